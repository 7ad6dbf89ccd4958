//! Live column introspection.
//!
//! Installs created at different times carry different column sets for the
//! same table. Statements are built only from columns reported here.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub table_name: String,
    pub existing_columns: HashSet<String>,
}

impl TableSchema {
    pub fn has(&self, column: &str) -> bool {
        self.existing_columns.contains(column)
    }
}

#[async_trait]
pub trait SchemaProbe: Send + Sync {
    /// Columns of `table` as they exist right now. Empty when the table is missing.
    async fn columns(&self, table: &str) -> Result<HashSet<String>>;
}

pub struct SqliteSchemaProbe {
    pool: SqlitePool,
}

impl SqliteSchemaProbe {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaProbe for SqliteSchemaProbe {
    async fn columns(&self, table: &str) -> Result<HashSet<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
            .bind(table)
            .fetch_all(&self.pool)
            .await?;
        Ok(names.into_iter().collect())
    }
}

/// Per-run memo over a probe. Build a new one for every orchestrator run.
pub struct RunSchemaCache<'a> {
    probe: &'a dyn SchemaProbe,
    tables: HashMap<String, TableSchema>,
}

impl<'a> RunSchemaCache<'a> {
    pub fn new(probe: &'a dyn SchemaProbe) -> Self {
        Self {
            probe,
            tables: HashMap::new(),
        }
    }

    pub async fn schema(&mut self, table: &str) -> Result<TableSchema> {
        if let Some(schema) = self.tables.get(table) {
            return Ok(schema.clone());
        }
        let schema = TableSchema {
            table_name: table.to_string(),
            existing_columns: self.probe.columns(table).await?,
        };
        self.tables.insert(table.to_string(), schema.clone());
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SchemaProbe for CountingProbe {
        async fn columns(&self, _table: &str) -> Result<HashSet<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(["name".to_string()].into_iter().collect())
        }
    }

    #[tokio::test]
    async fn test_probe_reports_live_columns_only() {
        let tmp = TempDir::new().unwrap();
        let mut config = crate::config::Config::default();
        config.db.path = tmp.path().join("schema.sqlite");
        let pool = crate::db::connect(&config).await.unwrap();
        sqlx::query("CREATE TABLE companies (id INTEGER PRIMARY KEY, name TEXT, country TEXT)")
            .execute(&pool)
            .await
            .unwrap();

        let probe = SqliteSchemaProbe::new(pool);
        let columns = probe.columns("companies").await.unwrap();
        let expected: HashSet<String> = ["id", "name", "country"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(columns, expected);
        assert!(!columns.contains("website"));

        assert!(probe.columns("no_such_table").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_cache_probes_each_table_once() {
        let probe = CountingProbe {
            calls: AtomicUsize::new(0),
        };
        let mut cache = RunSchemaCache::new(&probe);
        cache.schema("companies").await.unwrap();
        let schema = cache.schema("companies").await.unwrap();
        cache.schema("deals").await.unwrap();

        assert!(schema.has("name"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }
}

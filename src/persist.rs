//! Record persistence.
//!
//! Each validated record becomes exactly one SQL statement, built from the
//! module's field allow-list intersected with the table's live columns, and
//! executed on its own. A record either lands whole or not at all.
//!
//! Three write modes cover every module:
//!
//! - [`WriteMode::Insert`]: append-only.
//! - [`WriteMode::Upsert`]: `INSERT .. ON CONFLICT(key) DO UPDATE`, so
//!   re-running with identical output keeps one row per natural key.
//! - [`WriteMode::InsertOrUpdateById`]: records carrying an integer `id`
//!   update that row (only the fields they carry); the rest insert.

use serde_json::Value;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::db;
use crate::models::EnrichmentRecord;
use crate::schema::TableSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Real,
    /// Stored as a JSON array string; `[]` on insert when absent.
    JsonList,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Legacy column names, tried in order when `name` is not a live column.
    /// Records may also use them as keys.
    pub aliases: &'static [&'static str],
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            aliases: &[],
        }
    }

    pub const fn aliased(
        name: &'static str,
        kind: FieldKind,
        aliases: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            kind,
            aliases,
        }
    }

    fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.name).chain(self.aliases.iter().copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Insert,
    Upsert { conflict: &'static [&'static str] },
    InsertOrUpdateById,
}

/// Where and how one module's records are written.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub table: &'static str,
    pub natural_key: &'static [&'static str],
    pub write_mode: WriteMode,
    pub fields: &'static [FieldSpec],
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing natural key field '{0}'")]
    MissingKey(String),

    #[error("no writable columns for table '{0}'")]
    NoColumns(String),

    #[error("no row with id {0}")]
    RowNotFound(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PersistError {
    /// The pool is gone; no later record in the batch can succeed either.
    pub fn is_fatal(&self) -> bool {
        match self {
            PersistError::Database(e) => db::is_connection_lost(e),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
}

/// A single parameterised statement ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub values: Vec<SqlValue>,
    /// Row targeted by an update; `None` for inserts and upserts.
    pub update_id: Option<i64>,
}

pub struct PersistenceReconciler {
    pool: SqlitePool,
}

impl PersistenceReconciler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write one record and return the id of the affected row.
    pub async fn upsert(
        &self,
        record: &EnrichmentRecord,
        spec: &TableSpec,
        schema: &TableSchema,
    ) -> Result<i64, PersistError> {
        let statement = plan(record, spec, schema, &now_timestamp())?;

        let mut query = sqlx::query(&statement.sql);
        for value in &statement.values {
            query = match value {
                SqlValue::Null => query.bind(Option::<String>::None),
                SqlValue::Text(s) => query.bind(s.clone()),
                SqlValue::Integer(i) => query.bind(*i),
                SqlValue::Real(f) => query.bind(*f),
            };
        }

        match statement.update_id {
            Some(id) => {
                let result = query.execute(&self.pool).await?;
                if result.rows_affected() == 0 {
                    return Err(PersistError::RowNotFound(id));
                }
                Ok(id)
            }
            None => {
                let row = query.fetch_one(&self.pool).await?;
                Ok(row.try_get::<i64, _>(0)?)
            }
        }
    }
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Human-readable natural key: the key fields joined with `/`, or `#id` for
/// id-addressed updates without a name.
pub fn natural_key(record: &Value, spec: &TableSpec) -> Option<String> {
    let obj = record.as_object()?;
    let parts: Vec<String> = spec
        .natural_key
        .iter()
        .filter_map(|key| obj.get(*key).and_then(display_value))
        .collect();
    if parts.len() == spec.natural_key.len() && !parts.is_empty() {
        return Some(parts.join("/"));
    }
    update_id(record, spec).map(|id| format!("#{}", id))
}

fn display_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn update_id(record: &Value, spec: &TableSpec) -> Option<i64> {
    if spec.write_mode != WriteMode::InsertOrUpdateById {
        return None;
    }
    match record.get("id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Build the statement for one record without touching the database.
pub fn plan(
    record: &EnrichmentRecord,
    spec: &TableSpec,
    schema: &TableSchema,
    now: &str,
) -> Result<Statement, PersistError> {
    let obj = record.value.as_object().ok_or(PersistError::NotAnObject)?;

    if let Some(id) = update_id(&record.value, spec) {
        return plan_update(obj, id, spec, schema, now);
    }

    let mut columns: Vec<(&'static str, SqlValue)> = Vec::new();
    for field in spec.fields {
        let Some(column) = field.keys().find(|c| schema.has(c)) else {
            continue;
        };
        let value = field
            .keys()
            .find_map(|k| obj.get(k))
            .and_then(|v| coerce(v, field.kind));
        match (value, field.kind) {
            (Some(v), _) => columns.push((column, v)),
            (None, FieldKind::JsonList) => columns.push((column, SqlValue::Text("[]".into()))),
            (None, _) => {}
        }
    }

    for key in spec.natural_key {
        let present = columns.iter().any(|(c, v)| {
            spec.fields
                .iter()
                .any(|f| f.name == *key && f.keys().any(|k| k == *c))
                && is_present(v)
        });
        if !present {
            return Err(PersistError::MissingKey(key.to_string()));
        }
    }

    let provided: Vec<&'static str> = columns.iter().map(|(c, _)| *c).collect();
    for stamp in ["created_at", "updated_at"] {
        if schema.has(stamp) && !provided.contains(&stamp) {
            columns.push((stamp, SqlValue::Text(now.to_string())));
        }
    }

    if columns.is_empty() {
        return Err(PersistError::NoColumns(spec.table.to_string()));
    }

    let names: Vec<String> = columns.iter().map(|(c, _)| quote(c)).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(spec.table),
        names.join(", "),
        placeholders
    );

    if let WriteMode::Upsert { conflict } = spec.write_mode {
        let mut set: Vec<String> = columns
            .iter()
            .map(|(c, _)| *c)
            .filter(|c| !conflict.contains(c) && *c != "created_at")
            .map(|c| format!("{0} = excluded.{0}", quote(c)))
            .collect();
        if set.is_empty() {
            set.push(format!("{0} = excluded.{0}", quote(conflict[0])));
        }
        let target: Vec<String> = conflict.iter().map(|c| quote(c)).collect();
        sql.push_str(&format!(
            " ON CONFLICT({}) DO UPDATE SET {}",
            target.join(", "),
            set.join(", ")
        ));
    }
    sql.push_str(" RETURNING rowid");

    Ok(Statement {
        sql,
        values: columns.into_iter().map(|(_, v)| v).collect(),
        update_id: None,
    })
}

fn plan_update(
    obj: &serde_json::Map<String, Value>,
    id: i64,
    spec: &TableSpec,
    schema: &TableSchema,
    now: &str,
) -> Result<Statement, PersistError> {
    let mut columns: Vec<(&'static str, SqlValue)> = Vec::new();
    for field in spec.fields {
        let Some(column) = field.keys().find(|c| schema.has(c)) else {
            continue;
        };
        if let Some(value) = field
            .keys()
            .find_map(|k| obj.get(k))
            .and_then(|v| coerce(v, field.kind))
        {
            columns.push((column, value));
        }
    }
    if schema.has("updated_at") && !columns.iter().any(|(c, _)| *c == "updated_at") {
        columns.push(("updated_at", SqlValue::Text(now.to_string())));
    }
    if columns.is_empty() {
        return Err(PersistError::NoColumns(spec.table.to_string()));
    }

    let set: Vec<String> = columns
        .iter()
        .map(|(c, _)| format!("{} = ?", quote(c)))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE rowid = ?",
        quote(spec.table),
        set.join(", ")
    );
    let mut values: Vec<SqlValue> = columns.into_iter().map(|(_, v)| v).collect();
    values.push(SqlValue::Integer(id));

    Ok(Statement {
        sql,
        values,
        update_id: Some(id),
    })
}

fn is_present(value: &SqlValue) -> bool {
    match value {
        SqlValue::Null => false,
        SqlValue::Text(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Convert a JSON value to the column's kind. `None` means "no usable value";
/// the field is then left out rather than failing the record.
fn coerce(value: &Value, kind: FieldKind) -> Option<SqlValue> {
    if value.is_null() {
        return None;
    }
    match kind {
        FieldKind::Text => match value {
            Value::String(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| SqlValue::Text(s.to_string()))
            }
            Value::Number(n) => Some(SqlValue::Text(n.to_string())),
            Value::Bool(b) => Some(SqlValue::Text(b.to_string())),
            other => Some(SqlValue::Text(other.to_string())),
        },
        FieldKind::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.round() as i64))
                .map(SqlValue::Integer),
            Value::String(s) => {
                let cleaned = strip_number(s);
                cleaned
                    .parse::<i64>()
                    .ok()
                    .or_else(|| cleaned.parse::<f64>().ok().map(|f| f.round() as i64))
                    .map(SqlValue::Integer)
            }
            _ => None,
        },
        FieldKind::Real => match value {
            Value::Number(n) => n.as_f64().map(SqlValue::Real),
            Value::String(s) => strip_number(s).parse::<f64>().ok().map(SqlValue::Real),
            _ => None,
        },
        FieldKind::JsonList => {
            let list = match value {
                Value::Array(items) => Value::Array(items.clone()),
                Value::String(s) => Value::Array(
                    s.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(|p| Value::String(p.to_string()))
                        .collect(),
                ),
                other => Value::Array(vec![other.clone()]),
            };
            Some(SqlValue::Text(list.to_string()))
        }
    }
}

fn strip_number(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, ',' | '$' | ' ' | '_'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    const COMPANY_FIELDS: &[FieldSpec] = &[
        FieldSpec::new("name", FieldKind::Text),
        FieldSpec::new("country", FieldKind::Text),
        FieldSpec::new("website", FieldKind::Text),
        FieldSpec::new("employees_count", FieldKind::Integer),
        FieldSpec::new("total_funding", FieldKind::Real),
        FieldSpec::new("products", FieldKind::JsonList),
    ];

    const COMPANIES: TableSpec = TableSpec {
        table: "companies",
        natural_key: &["name"],
        write_mode: WriteMode::InsertOrUpdateById,
        fields: COMPANY_FIELDS,
    };

    const METRICS: TableSpec = TableSpec {
        table: "market_indicators",
        natural_key: &["country", "metric_name", "year"],
        write_mode: WriteMode::Upsert {
            conflict: &["country", "metric_name", "year"],
        },
        fields: &[
            FieldSpec::new("country", FieldKind::Text),
            FieldSpec::new("metric_name", FieldKind::Text),
            FieldSpec::new("metric_value", FieldKind::Real),
            FieldSpec::new("year", FieldKind::Integer),
        ],
    };

    const INVESTIGATORS: TableSpec = TableSpec {
        table: "investigators",
        natural_key: &["name"],
        write_mode: WriteMode::Insert,
        fields: &[
            FieldSpec::new("name", FieldKind::Text),
            FieldSpec::aliased("specialties", FieldKind::JsonList, &["specialization"]),
            FieldSpec::aliased("experience_years", FieldKind::Integer, &["years_experience"]),
        ],
    };

    fn schema(table: &str, cols: &[&str]) -> TableSchema {
        TableSchema {
            table_name: table.to_string(),
            existing_columns: cols.iter().map(|c| c.to_string()).collect::<HashSet<_>>(),
        }
    }

    fn record(value: Value) -> EnrichmentRecord {
        EnrichmentRecord { index: 0, value }
    }

    #[test]
    fn test_plan_only_references_live_columns() {
        let stmt = plan(
            &record(json!({"name": "Acme Health", "country": "Kenya", "website": "acme.ke"})),
            &COMPANIES,
            &schema("companies", &["name", "country", "created_at"]),
            "2024-01-01 00:00:00",
        )
        .unwrap();

        assert_eq!(
            stmt.sql,
            "INSERT INTO \"companies\" (\"name\", \"country\", \"created_at\") VALUES (?, ?, ?) RETURNING rowid"
        );
        assert_eq!(
            stmt.values,
            vec![
                SqlValue::Text("Acme Health".into()),
                SqlValue::Text("Kenya".into()),
                SqlValue::Text("2024-01-01 00:00:00".into()),
            ]
        );
    }

    #[test]
    fn test_missing_natural_key() {
        let err = plan(
            &record(json!({"country": "Kenya"})),
            &COMPANIES,
            &schema("companies", &["name", "country"]),
            "now",
        )
        .unwrap_err();
        assert!(matches!(err, PersistError::MissingKey(ref k) if k == "name"));

        let blank = plan(
            &record(json!({"name": "  "})),
            &COMPANIES,
            &schema("companies", &["name"]),
            "now",
        );
        assert!(matches!(blank, Err(PersistError::MissingKey(_))));
    }

    #[test]
    fn test_non_object_record() {
        let err = plan(&record(json!("junk")), &COMPANIES, &schema("companies", &["name"]), "now");
        assert!(matches!(err, Err(PersistError::NotAnObject)));
    }

    #[test]
    fn test_coercions() {
        let stmt = plan(
            &record(json!({
                "name": "Acme",
                "employees_count": "1,200",
                "total_funding": "$2,500,000.50",
                "products": "App, Clinic"
            })),
            &COMPANIES,
            &schema("companies", &["name", "employees_count", "total_funding", "products"]),
            "now",
        )
        .unwrap();
        assert_eq!(
            stmt.values,
            vec![
                SqlValue::Text("Acme".into()),
                SqlValue::Integer(1200),
                SqlValue::Real(2_500_000.5),
                SqlValue::Text("[\"App\",\"Clinic\"]".into()),
            ]
        );
    }

    #[test]
    fn test_unparseable_number_is_omitted_and_list_defaults() {
        let stmt = plan(
            &record(json!({"name": "Acme", "employees_count": "a few"})),
            &COMPANIES,
            &schema("companies", &["name", "employees_count", "products"]),
            "now",
        )
        .unwrap();
        assert!(!stmt.sql.contains("employees_count"));
        assert_eq!(stmt.values[1], SqlValue::Text("[]".into()));
    }

    #[test]
    fn test_update_by_id_touches_present_fields_only() {
        let stmt = plan(
            &record(json!({"id": 7, "website": "new.example"})),
            &COMPANIES,
            &schema("companies", &["name", "website", "products", "updated_at"]),
            "now",
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"companies\" SET \"website\" = ?, \"updated_at\" = ? WHERE rowid = ?"
        );
        assert_eq!(stmt.update_id, Some(7));
        assert_eq!(stmt.values.last(), Some(&SqlValue::Integer(7)));
    }

    #[test]
    fn test_upsert_sql() {
        let stmt = plan(
            &record(json!({"country": "Kenya", "metric_name": "gdp", "metric_value": 1.5, "year": 2023})),
            &METRICS,
            &schema(
                "market_indicators",
                &["country", "metric_name", "metric_value", "year", "created_at", "updated_at"],
            ),
            "now",
        )
        .unwrap();
        assert!(stmt.sql.contains("ON CONFLICT(\"country\", \"metric_name\", \"year\") DO UPDATE SET \"metric_value\" = excluded.\"metric_value\", \"updated_at\" = excluded.\"updated_at\""));
        assert!(!stmt.sql.contains("\"created_at\" = excluded"));
    }

    #[test]
    fn test_legacy_alias_columns() {
        let legacy = schema("investigators", &["name", "specialization", "years_experience"]);
        let stmt = plan(
            &record(json!({"name": "Dr. Amina", "specialties": ["oncology"], "experience_years": 12})),
            &INVESTIGATORS,
            &legacy,
            "now",
        )
        .unwrap();
        assert!(stmt.sql.contains("\"specialization\""));
        assert!(stmt.sql.contains("\"years_experience\""));
        assert!(!stmt.sql.contains("\"specialties\""));

        let current = schema("investigators", &["name", "specialties", "experience_years"]);
        let stmt = plan(
            &record(json!({"name": "Dr. Amina", "specialization": "cardiology"})),
            &INVESTIGATORS,
            &current,
            "now",
        )
        .unwrap();
        assert!(stmt.sql.contains("\"specialties\""));
        assert_eq!(stmt.values[1], SqlValue::Text("[\"cardiology\"]".into()));
    }

    #[test]
    fn test_natural_key_display() {
        assert_eq!(
            natural_key(&json!({"country": "Ghana", "metric_name": "gdp", "year": 2022}), &METRICS).as_deref(),
            Some("Ghana/gdp/2022")
        );
        assert_eq!(natural_key(&json!({"id": 4}), &COMPANIES).as_deref(), Some("#4"));
        assert_eq!(natural_key(&json!({"country": "Ghana"}), &METRICS), None);
    }

    async fn pool(tmp: &tempfile::TempDir) -> SqlitePool {
        let mut config = crate::config::Config::default();
        config.db.path = tmp.path().join("persist.sqlite");
        let pool = db::connect(&config).await.unwrap();
        crate::migrate::apply_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_key() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        let reconciler = PersistenceReconciler::new(pool.clone());
        let probe = crate::schema::SqliteSchemaProbe::new(pool.clone());
        let schema = TableSchema {
            table_name: "market_indicators".into(),
            existing_columns: crate::schema::SchemaProbe::columns(&probe, "market_indicators")
                .await
                .unwrap(),
        };

        let first = record(json!({"country": "Kenya", "metric_name": "gdp", "metric_value": 1.0, "year": 2023}));
        let second = record(json!({"country": "Kenya", "metric_name": "gdp", "metric_value": 2.0, "year": 2023}));
        let id1 = reconciler.upsert(&first, &METRICS, &schema).await.unwrap();
        let id2 = reconciler.upsert(&second, &METRICS, &schema).await.unwrap();
        assert_eq!(id1, id2);

        let (count, value): (i64, f64) = sqlx::query_as(
            "SELECT COUNT(*), MAX(metric_value) FROM market_indicators WHERE country = 'Kenya'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(value, 2.0);
    }

    #[tokio::test]
    async fn test_update_missing_row() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        let reconciler = PersistenceReconciler::new(pool);
        let err = reconciler
            .upsert(
                &record(json!({"id": 99, "website": "x"})),
                &COMPANIES,
                &schema("companies", &["name", "website"]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::RowNotFound(99)));
        assert!(!err.is_fatal());
    }
}

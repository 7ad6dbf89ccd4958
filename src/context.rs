//! Retrieval store used to ground generation requests.
//!
//! The [`ContextStore`] trait is the only surface the pipeline depends on.
//! Two implementations ship with the crate:
//!
//! - [`SqliteContextStore`]: documents in SQLite with an FTS5 index; scores
//!   are BM25 ranks min-max normalized into `[0, 1]`.
//! - [`InMemoryContextStore`]: token-overlap scoring over a `Vec`, for tests
//!   and embedders without a database.
//!
//! A query never fails the caller on a miss: no match, an empty query, or an
//! exceeded timeout all yield an empty result.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use crate::models::{Document, NewDocument, UpsertSummary};

#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Return at most `k` documents ranked by relevance to `text`.
    async fn query(&self, text: &str, k: usize) -> Result<Vec<Document>>;

    /// Insert or replace documents. Documents with blank text are skipped.
    async fn upsert(&self, docs: &[NewDocument]) -> Result<UpsertSummary>;
}

/// Lowercased alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Stable id for a document: the caller's id, or a content hash.
///
/// Hashing the text makes re-ingesting the same corpus idempotent.
pub fn document_id(doc: &NewDocument) -> String {
    match doc.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let mut hasher = Sha256::new();
            hasher.update(doc.text.as_bytes());
            hex::encode(hasher.finalize())[..32].to_string()
        }
    }
}

/// Read documents from a JSON Lines file, one `{id?, text, metadata?}` per line.
///
/// Blank lines are skipped. A malformed line fails the whole read with its
/// line number.
pub fn read_jsonl(path: &Path) -> Result<Vec<NewDocument>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut docs = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let doc: NewDocument = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid document", path.display(), i + 1))?;
        docs.push(doc);
    }
    Ok(docs)
}

// ============ SQLite store ============

pub struct SqliteContextStore {
    pool: SqlitePool,
    timeout: Duration,
}

impl SqliteContextStore {
    pub fn new(pool: SqlitePool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn search(&self, text: &str, k: usize) -> Result<Vec<Document>> {
        let tokens: Vec<String> = {
            let mut seen = HashSet::new();
            tokenize(text)
                .into_iter()
                .filter(|t| seen.insert(t.clone()))
                .collect()
        };
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        // Quote every token so user input never reaches FTS5 syntax.
        let match_expr = tokens
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR ");

        let rows = sqlx::query(
            r#"
            SELECT d.id, d.text, d.metadata_json, hits.rank AS rank
            FROM (
                SELECT doc_id, rank FROM context_fts
                WHERE context_fts MATCH ?
                ORDER BY rank
                LIMIT ?
            ) AS hits
            JOIN context_documents d ON d.id = hits.doc_id
            ORDER BY hits.rank
            "#,
        )
        .bind(&match_expr)
        .bind(i64::try_from(k).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let hits: Vec<(Document, f64)> = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                let metadata_json: String = row.get("metadata_json");
                let metadata: BTreeMap<String, String> =
                    serde_json::from_str(&metadata_json).unwrap_or_default();
                let doc = Document {
                    id: row.get("id"),
                    text: row.get("text"),
                    metadata,
                    score: 0.0,
                };
                (doc, -rank) // negate so higher = better
            })
            .collect();

        Ok(normalize_scores(hits))
    }
}

/// Min-max normalize raw scores into `[0, 1]`; a single hit scores `1.0`.
fn normalize_scores(hits: Vec<(Document, f64)>) -> Vec<Document> {
    if hits.is_empty() {
        return Vec::new();
    }

    let s_min = hits.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let s_max = hits
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);

    hits.into_iter()
        .map(|(mut doc, raw)| {
            doc.score = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (raw - s_min) / (s_max - s_min)
            };
            doc
        })
        .collect()
}

#[async_trait]
impl ContextStore for SqliteContextStore {
    async fn query(&self, text: &str, k: usize) -> Result<Vec<Document>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        match tokio::time::timeout(self.timeout, self.search(text, k)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "context query timed out; continuing without context"
                );
                Ok(Vec::new())
            }
        }
    }

    async fn upsert(&self, docs: &[NewDocument]) -> Result<UpsertSummary> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut accepted_count = 0;

        for doc in docs {
            if doc.text.trim().is_empty() {
                continue;
            }
            let id = document_id(doc);
            let metadata_json = serde_json::to_string(&doc.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO context_documents (id, text, metadata_json, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    text = excluded.text,
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(&id)
            .bind(&doc.text)
            .bind(&metadata_json)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM context_fts WHERE doc_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;

            sqlx::query("INSERT INTO context_fts (doc_id, text) VALUES (?, ?)")
                .bind(&id)
                .bind(&doc.text)
                .execute(&mut *tx)
                .await?;

            accepted_count += 1;
        }

        tx.commit().await?;
        Ok(UpsertSummary { accepted_count })
    }
}

// ============ In-memory store ============

/// Token-overlap store: a document scores one point per distinct query token
/// it contains. Zero-score documents are never returned.
pub struct InMemoryContextStore {
    docs: RwLock<Vec<Document>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryContextStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn query(&self, text: &str, k: usize) -> Result<Vec<Document>> {
        let query_tokens: HashSet<String> = tokenize(text).into_iter().collect();
        if query_tokens.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let docs = self
            .docs
            .read()
            .map_err(|_| anyhow!("context store lock poisoned"))?;

        let mut scored: Vec<Document> = docs
            .iter()
            .filter_map(|doc| {
                let doc_tokens: HashSet<String> = tokenize(&doc.text).into_iter().collect();
                let score = query_tokens.intersection(&doc_tokens).count();
                (score > 0).then(|| Document {
                    score: score as f64,
                    ..doc.clone()
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn upsert(&self, docs: &[NewDocument]) -> Result<UpsertSummary> {
        let mut stored = self
            .docs
            .write()
            .map_err(|_| anyhow!("context store lock poisoned"))?;
        let mut accepted_count = 0;

        for doc in docs {
            if doc.text.trim().is_empty() {
                continue;
            }
            let id = document_id(doc);
            stored.retain(|d| d.id != id);
            stored.push(Document {
                id,
                text: doc.text.clone(),
                metadata: doc.metadata.clone(),
                score: 0.0,
            });
            accepted_count += 1;
        }

        Ok(UpsertSummary { accepted_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_doc(text: &str) -> NewDocument {
        NewDocument {
            id: None,
            text: text.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_tokenize_strips_punctuation() {
        assert_eq!(
            tokenize("Kenya's M-Pesa: 2024!"),
            vec!["kenya", "s", "m", "pesa", "2024"]
        );
    }

    #[test]
    fn test_document_id_prefers_caller_id() {
        let mut doc = new_doc("hello");
        assert_eq!(document_id(&doc).len(), 32);
        doc.id = Some("custom-1".to_string());
        assert_eq!(document_id(&doc), "custom-1");
    }

    #[test]
    fn test_read_jsonl_skips_blank_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("docs.jsonl");
        std::fs::write(
            &path,
            "{\"text\": \"Kenya health budget\"}\n\n{\"id\": \"b\", \"text\": \"Ghana\", \"metadata\": {\"src\": \"wb\"}}\n",
        )
        .unwrap();

        let docs = read_jsonl(&path).unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].id.is_none());
        assert_eq!(docs[1].metadata.get("src").map(String::as_str), Some("wb"));

        std::fs::write(&path, "{\"text\": 1}\n").unwrap();
        let err = read_jsonl(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(":1: invalid document"));
    }

    #[tokio::test]
    async fn test_memory_store_ranks_by_overlap() {
        let store = InMemoryContextStore::new();
        store
            .upsert(&[
                new_doc("Telemedicine startups in Kenya raised seed rounds"),
                new_doc("Ghana cocoa exports"),
                new_doc("Kenya telemedicine funding and Kenya diagnostics"),
            ])
            .await
            .unwrap();

        let hits = store.query("kenya telemedicine funding", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].text.contains("funding"));
        assert_eq!(hits[0].score, 3.0);
    }

    #[tokio::test]
    async fn test_memory_store_empty_query_returns_nothing() {
        let store = InMemoryContextStore::new();
        store.upsert(&[new_doc("anything")]).await.unwrap();
        assert!(store.query("  ?? ", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_skips_blank_documents() {
        let store = InMemoryContextStore::new();
        let summary = store
            .upsert(&[new_doc("   "), new_doc("real text")])
            .await
            .unwrap();
        assert_eq!(summary.accepted_count, 1);
    }

    async fn sqlite_store(tmp: &TempDir) -> SqliteContextStore {
        let mut config = crate::config::Config::default();
        config.db.path = tmp.path().join("enrich.sqlite");
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply_schema(&pool).await.unwrap();
        SqliteContextStore::new(pool, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_sqlite_store_query_and_normalize() {
        let tmp = TempDir::new().unwrap();
        let store = sqlite_store(&tmp).await;

        let summary = store
            .upsert(&[
                new_doc("Nairobi hospital network expands cardiology"),
                new_doc("Lagos diagnostics startup raises Series A"),
                new_doc("Diagnostics startup diagnostics lab in Lagos"),
            ])
            .await
            .unwrap();
        assert_eq!(summary.accepted_count, 3);

        let hits = store.query("Lagos diagnostics", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|d| d.text.contains("Lagos")));
        assert!(hits.iter().all(|d| (0.0..=1.0).contains(&d.score)));
        assert_eq!(hits[0].score, 1.0);
    }

    #[tokio::test]
    async fn test_sqlite_store_reingest_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = sqlite_store(&tmp).await;

        store.upsert(&[new_doc("Rwanda drone deliveries")]).await.unwrap();
        store.upsert(&[new_doc("Rwanda drone deliveries")]).await.unwrap();

        let hits = store.query("rwanda", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_store_tolerates_fts_syntax() {
        let tmp = TempDir::new().unwrap();
        let store = sqlite_store(&tmp).await;
        store.upsert(&[new_doc("plain words")]).await.unwrap();

        let hits = store.query("\"plain\" AND (NOT words*", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}

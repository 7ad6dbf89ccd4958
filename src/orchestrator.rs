//! Enrichment orchestrator.
//!
//! Runs one module end to end:
//!
//! ```text
//! Idle -> Retrieving -> Dispatching -> Parsing -> Persisting -> Done
//!                            \             \
//!                             +-------------+--> Failed
//! ```
//!
//! Retrieval is best effort. Dispatch is retried only on `Unavailable`,
//! with jitter, and never past the run deadline. Once records are parsed,
//! each one persists on its own; a bad record lands in `failures` and the
//! run carries on. Only losing the database connection aborts a batch.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::Config;
use crate::context::ContextStore;
use crate::db;
use crate::dispatch::TextGenerator;
use crate::models::{
    BatchResult, EnrichmentRecord, GenerationRequest, GenerationResult, InsertedRecord,
    RecordFailure,
};
use crate::modules::{self, ModuleKind, PromptInput, Reference, MAX_COUNT};
use crate::parser;
use crate::persist::PersistenceReconciler;
use crate::schema::{RunSchemaCache, SchemaProbe, SqliteSchemaProbe};

const RETRY_JITTER_MS: std::ops::RangeInclusive<u64> = 250..=750;

/// Why a module run produced nothing.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    #[error("AI service unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("AI service returned a malformed response")]
    Malformed { raw_excerpt: String },

    #[error("could not parse AI response: {reason}")]
    Parse { reason: String, placeholder: bool },

    #[error("{reason}")]
    Fatal { reason: String },
}

impl RunFailure {
    /// Backend not configured or not reachable, as opposed to a hard error.
    pub fn is_warning(&self) -> bool {
        match self {
            RunFailure::Unavailable { .. } => true,
            RunFailure::Parse { placeholder, .. } => *placeholder,
            _ => false,
        }
    }

    fn fatal(reason: impl Into<String>) -> Self {
        RunFailure::Fatal {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Retrieving,
    Dispatching,
    Parsing,
    Persisting,
    Done,
    Failed,
}

struct PhaseTracker {
    phase: Phase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self { phase: Phase::Idle }
    }

    fn advance(&mut self, next: Phase) {
        tracing::debug!(from = ?self.phase, to = ?next, "phase");
        self.phase = next;
    }

    fn fail(&mut self, failure: RunFailure) -> RunFailure {
        tracing::warn!(phase = ?self.phase, error = %failure, "module run failed");
        self.advance(Phase::Failed);
        failure
    }
}

/// Tunables for every run, fixed at startup.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub retrieval_enabled: bool,
    pub top_k: usize,
    pub temperature: f64,
    pub max_tokens: u32,
    pub max_retries: u32,
    pub request_timeout: Duration,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retrieval_enabled: config.retrieval.enabled,
            top_k: config.retrieval.top_k,
            temperature: config.generation.temperature,
            max_tokens: config.generation.max_tokens,
            max_retries: config.generation.max_retries,
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub count: Option<usize>,
    pub countries: Vec<String>,
}

#[derive(Debug)]
pub struct ModuleOutcome {
    pub module: ModuleKind,
    pub outcome: Result<BatchResult, RunFailure>,
}

#[derive(Debug, Default)]
pub struct RunAllReport {
    pub results: Vec<ModuleOutcome>,
}

impl RunAllReport {
    pub fn total_updates(&self) -> usize {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok())
            .map(BatchResult::count)
            .sum()
    }
}

pub struct EnrichmentOrchestrator {
    generator: Arc<dyn TextGenerator>,
    context: Option<Arc<dyn ContextStore>>,
    probe: Arc<dyn SchemaProbe>,
    reconciler: PersistenceReconciler,
    settings: RunSettings,
}

impl EnrichmentOrchestrator {
    pub fn new(
        pool: sqlx::SqlitePool,
        generator: Arc<dyn TextGenerator>,
        context: Option<Arc<dyn ContextStore>>,
        settings: RunSettings,
    ) -> Self {
        Self {
            generator,
            context,
            probe: Arc::new(SqliteSchemaProbe::new(pool.clone())),
            reconciler: PersistenceReconciler::new(pool),
            settings,
        }
    }

    pub fn generator(&self) -> &Arc<dyn TextGenerator> {
        &self.generator
    }

    pub fn context(&self) -> Option<&Arc<dyn ContextStore>> {
        self.context.as_ref()
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Run one module under a fresh deadline.
    pub async fn run_module(
        &self,
        kind: ModuleKind,
        options: &RunOptions,
    ) -> Result<BatchResult, RunFailure> {
        let deadline = Instant::now() + self.settings.request_timeout;
        self.run_module_until(kind, options, deadline).await
    }

    pub async fn run_module_until(
        &self,
        kind: ModuleKind,
        options: &RunOptions,
        deadline: Instant,
    ) -> Result<BatchResult, RunFailure> {
        let span = tracing::info_span!("enrich", module = %kind);
        self.run_inner(kind, options, deadline).instrument(span).await
    }

    /// Run every module in dependency order, each under its own deadline.
    ///
    /// A failing module does not stop the next one, unless the database
    /// itself is gone: then every remaining module is reported as aborted
    /// without touching the backend.
    pub async fn run_all(&self, counts: &HashMap<ModuleKind, usize>) -> RunAllReport {
        let mut report = RunAllReport::default();
        let mut aborted: Option<String> = None;
        for kind in ModuleKind::ALL {
            if let Some(ref reason) = aborted {
                report.results.push(ModuleOutcome {
                    module: kind,
                    outcome: Err(RunFailure::fatal(format!("batch aborted: {}", reason))),
                });
                continue;
            }

            let options = RunOptions {
                count: counts.get(&kind).copied(),
                countries: Vec::new(),
            };
            let outcome = self.run_module(kind, &options).await;
            if let Err(RunFailure::Fatal { ref reason }) = outcome {
                if let Err(e) = db::ping(self.reconciler.pool()).await {
                    tracing::error!(module = %kind, error = %e, "database lost; aborting batch");
                    aborted = Some(reason.clone());
                }
            }
            report.results.push(ModuleOutcome {
                module: kind,
                outcome,
            });
        }
        tracing::info!(total_updates = report.total_updates(), "run-all finished");
        report
    }

    async fn run_inner(
        &self,
        kind: ModuleKind,
        options: &RunOptions,
        deadline: Instant,
    ) -> Result<BatchResult, RunFailure> {
        let spec = kind.spec();
        let pool = self.reconciler.pool();
        let count = options
            .count
            .unwrap_or(spec.default_count)
            .clamp(1, MAX_COUNT);
        let mut tracker = PhaseTracker::new();
        tracing::info!(count, "module run started");

        let mut schemas = RunSchemaCache::new(self.probe.as_ref());
        let schema = match schemas.schema(spec.table.table).await {
            Ok(schema) => schema,
            Err(e) => {
                return Err(tracker.fail(RunFailure::fatal(format!(
                    "cannot inspect table '{}': {}",
                    spec.table.table, e
                ))))
            }
        };
        if schema.existing_columns.is_empty() {
            return Err(tracker.fail(RunFailure::fatal(format!(
                "table '{}' does not exist",
                spec.table.table
            ))));
        }

        let reference = match spec.reference {
            Reference::None => Vec::new(),
            reference => {
                let companies = match schemas.schema(modules::COMPANIES_TABLE).await {
                    Ok(schema) => schema,
                    Err(e) => {
                        return Err(tracker.fail(RunFailure::fatal(format!(
                            "cannot inspect table '{}': {}",
                            modules::COMPANIES_TABLE,
                            e
                        ))))
                    }
                };
                match modules::load_reference(pool, reference, count, &companies).await {
                    Ok(rows) => rows,
                    Err(e) if db::is_connection_lost(&e) => {
                        return Err(tracker
                            .fail(RunFailure::fatal(format!("database unavailable: {}", e))))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "could not load reference rows; continuing without");
                        Vec::new()
                    }
                }
            }
        };

        tracker.advance(Phase::Retrieving);
        let context_texts = self
            .retrieve(&spec.retrieval_query(&options.countries))
            .await;

        tracker.advance(Phase::Dispatching);
        let prompt = spec.user_prompt(&PromptInput {
            count,
            countries: &options.countries,
            reference: &reference,
        });
        let request = GenerationRequest {
            system_prompt: Some(spec.system_prompt.to_string()),
            user_prompt: with_context(&context_texts, &prompt),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };
        let text = match self.dispatch_with_retry(&request, deadline).await {
            GenerationResult::Success { text } => text,
            GenerationResult::Unavailable { reason } => {
                return Err(tracker.fail(RunFailure::Unavailable { reason }))
            }
            GenerationResult::Malformed { raw_text } => {
                return Err(tracker.fail(RunFailure::Malformed {
                    raw_excerpt: raw_text.chars().take(200).collect(),
                }))
            }
        };

        tracker.advance(Phase::Parsing);
        let records = match parser::parse(&text) {
            Ok(records) => records,
            Err(e) => {
                return Err(tracker.fail(RunFailure::Parse {
                    placeholder: e.is_placeholder(),
                    reason: e.to_string(),
                }))
            }
        };

        tracker.advance(Phase::Persisting);

        let mut batch = BatchResult::new(kind.name());
        for record in records {
            batch.attempted += 1;
            let index = record.index;
            let mut value = record.value;
            let natural_key = spec.display_key(&value, &reference);

            if let Err(error) = spec.check_update_target(&value, &reference) {
                record_failure(&mut batch, index, &natural_key, error);
                continue;
            }

            if let Err(e) = spec.resolve_company_link(pool, &mut value).await {
                if db::is_connection_lost(&e) {
                    return Err(tracker.fail(RunFailure::fatal(format!(
                        "database connection lost: {}",
                        e
                    ))));
                }
                record_failure(&mut batch, index, &natural_key, format!("company lookup failed: {}", e));
                continue;
            }

            let record = EnrichmentRecord { index, value };
            match self.reconciler.upsert(&record, &spec.table, &schema).await {
                Ok(id) => batch.inserted.push(InsertedRecord {
                    id,
                    natural_key: natural_key.clone().unwrap_or_default(),
                }),
                Err(e) if e.is_fatal() => {
                    return Err(tracker.fail(RunFailure::fatal(format!(
                        "database connection lost: {}",
                        e
                    ))));
                }
                Err(e) => record_failure(&mut batch, index, &natural_key, e.to_string()),
            }
        }

        tracker.advance(Phase::Done);
        tracing::info!(
            attempted = batch.attempted,
            written = batch.count(),
            failed = batch.failures.len(),
            "module run finished"
        );
        Ok(batch)
    }

    /// Context texts for `query`; any failure means "no context".
    async fn retrieve(&self, query: &str) -> Vec<String> {
        let Some(store) = self.context.as_ref().filter(|_| self.settings.retrieval_enabled) else {
            return Vec::new();
        };
        match store.query(query, self.settings.top_k).await {
            Ok(docs) => docs.into_iter().map(|d| d.text).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "context query failed; continuing without context");
                Vec::new()
            }
        }
    }

    async fn dispatch_with_retry(
        &self,
        request: &GenerationRequest,
        deadline: Instant,
    ) -> GenerationResult {
        let mut attempt = 0;
        loop {
            let result = self.generator.generate(request, Some(deadline)).await;
            let reason = match &result {
                GenerationResult::Unavailable { reason } if attempt < self.settings.max_retries => {
                    reason.clone()
                }
                _ => return result,
            };

            let delay = Duration::from_millis(fastrand::u64(RETRY_JITTER_MS));
            if Instant::now() + delay >= deadline {
                return result;
            }
            attempt += 1;
            tracing::warn!(attempt, %reason, delay_ms = delay.as_millis() as u64, "retrying backend call");
            tokio::time::sleep(delay).await;
        }
    }
}

fn record_failure(
    batch: &mut BatchResult,
    index: usize,
    natural_key: &Option<String>,
    error: String,
) {
    tracing::warn!(index, natural_key = ?natural_key, %error, "record not persisted");
    batch.failures.push(RecordFailure {
        index,
        natural_key: natural_key.clone(),
        error,
    });
}

/// Prefix retrieved reference text to a prompt.
pub fn with_context(context_texts: &[String], prompt: &str) -> String {
    if context_texts.is_empty() {
        return prompt.to_string();
    }
    let lines: Vec<String> = context_texts.iter().map(|t| format!("- {}", t)).collect();
    format!("REFERENCE CONTEXT:\n{}\n\n{}", lines.join("\n"), prompt)
}

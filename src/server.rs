//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/enrich/{module}` | Run one enrichment module |
//! | `POST` | `/enrich/all` | Run every module in dependency order |
//! | `GET`  | `/enrich/health` | Database and inference backend status |
//! | `POST` | `/chat/query` | Retrieval-grounded question answering |
//! | `POST` | `/chat/ingest` | Add documents to the retrieval store |
//! | `GET`  | `/health` | Liveness (returns version) |
//!
//! # Error Contract
//!
//! Every failure is JSON:
//!
//! ```json
//! { "success": false, "error": "AI service unavailable: ...", "warning": true, "kind": "unavailable" }
//! ```
//!
//! `warning` is present and `true` when the inference backend is not
//! configured or not reachable, rather than a hard error.
//!
//! | Condition | Status |
//! |---|---|
//! | unknown module, bad body | 400 |
//! | backend unavailable or placeholder reply | 503 |
//! | malformed or unparseable backend reply | 502 |
//! | database lost | 500 |

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::backend::BackendRegistry;
use crate::chat::{ChatError, ChatService};
use crate::config::Config;
use crate::context::{ContextStore, SqliteContextStore};
use crate::db;
use crate::dispatch::{InferenceDispatcher, TextGenerator};
use crate::migrate;
use crate::models::{BatchResult, Document, NewDocument};
use crate::modules::{ModuleKind, MAX_COUNT};
use crate::orchestrator::{EnrichmentOrchestrator, RunFailure, RunOptions, RunSettings};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pool: SqlitePool,
    orchestrator: Arc<EnrichmentOrchestrator>,
    chat: Arc<ChatService>,
}

impl AppState {
    pub fn new(
        config: &Config,
        pool: SqlitePool,
        generator: Arc<dyn TextGenerator>,
        context: Option<Arc<dyn ContextStore>>,
    ) -> Self {
        let chat_context = context.clone().filter(|_| config.retrieval.enabled);
        let chat = ChatService::new(config, generator.clone(), chat_context);
        let orchestrator = EnrichmentOrchestrator::new(
            pool.clone(),
            generator,
            context,
            RunSettings::from_config(config),
        );
        Self {
            pool,
            orchestrator: Arc::new(orchestrator),
            chat: Arc::new(chat),
        }
    }

    /// Wire the production stack: SQLite pool, retrieval store, and the
    /// dispatcher for the backend the registry selects.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;

        let registry = BackendRegistry::from_config(&config.backends)?;
        tracing::info!(
            mode = %registry.mode(),
            endpoint = %registry.active().endpoint,
            "inference backend selected"
        );
        let dispatcher = Arc::new(InferenceDispatcher::new(&registry)?);
        let context: Arc<dyn ContextStore> = Arc::new(SqliteContextStore::new(
            pool.clone(),
            Duration::from_millis(config.retrieval.timeout_ms),
        ));

        Ok(Self::new(config, pool, dispatcher, Some(context)))
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/enrich/all", post(handle_enrich_all))
        .route("/enrich/health", get(handle_enrich_health))
        .route("/enrich/{module}", post(handle_enrich_module))
        .route("/chat/query", post(handle_chat_query))
        .route("/chat/ingest", post(handle_chat_ingest))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "enrichment server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
    warning: bool,
    kind: Option<&'static str>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({ "success": false, "error": self.message });
        if self.warning {
            body["warning"] = Value::Bool(true);
        }
        if let Some(kind) = self.kind {
            body["kind"] = Value::from(kind);
        }
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
        warning: false,
        kind: None,
    }
}

fn unavailable(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: message.into(),
        warning: false,
        kind: None,
    }
}

impl From<&RunFailure> for AppError {
    fn from(failure: &RunFailure) -> Self {
        let (status, kind) = match failure {
            RunFailure::Unavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            RunFailure::Parse {
                placeholder: true, ..
            } => (StatusCode::SERVICE_UNAVAILABLE, "parse"),
            RunFailure::Parse { .. } => (StatusCode::BAD_GATEWAY, "parse"),
            RunFailure::Malformed { .. } => (StatusCode::BAD_GATEWAY, "malformed"),
            RunFailure::Fatal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "fatal"),
        };
        AppError {
            status,
            message: failure.to_string(),
            warning: failure.is_warning(),
            kind: Some(kind),
        }
    }
}

/// Parse an optional JSON body; an empty body is the default value.
fn parse_body<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid JSON body: {}", e)))
}

fn check_count(count: Option<usize>) -> Result<Option<usize>, AppError> {
    match count {
        Some(n) if n == 0 || n > MAX_COUNT => Err(bad_request(format!(
            "count must be between 1 and {}",
            MAX_COUNT
        ))),
        other => Ok(other),
    }
}

fn batch_json(kind: ModuleKind, batch: &BatchResult) -> Value {
    let mut body = Map::new();
    body.insert("success".into(), Value::Bool(true));
    body.insert("module".into(), Value::from(kind.name()));
    body.insert("count".into(), Value::from(batch.count()));
    body.insert("attempted".into(), Value::from(batch.attempted));
    body.insert(
        kind.spec().response_key.into(),
        serde_json::to_value(&batch.inserted).unwrap_or_default(),
    );
    body.insert(
        "failures".into(),
        serde_json::to_value(&batch.failures).unwrap_or_default(),
    );
    Value::Object(body)
}

fn failure_json(failure: &RunFailure) -> Value {
    let mut body = json!({ "success": false, "error": failure.to_string() });
    if failure.is_warning() {
        body["warning"] = Value::Bool(true);
    }
    body["kind"] = serde_json::to_value(failure)
        .ok()
        .and_then(|v| v.get("kind").cloned())
        .unwrap_or(Value::Null);
    body
}

// ============ POST /enrich/{module} ============

#[derive(Deserialize, Default)]
struct EnrichRequest {
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    countries: Option<Vec<String>>,
}

async fn handle_enrich_module(
    State(state): State<AppState>,
    Path(module): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let kind: ModuleKind = module.parse().map_err(|e| bad_request(format!("{}", e)))?;
    let req: EnrichRequest = parse_body(&body)?;
    let options = RunOptions {
        count: check_count(req.count)?,
        countries: req.countries.unwrap_or_default(),
    };

    match state.orchestrator.run_module(kind, &options).await {
        Ok(batch) => Ok(Json(batch_json(kind, &batch))),
        Err(failure) => Err(AppError::from(&failure)),
    }
}

// ============ POST /enrich/all ============

/// Per-module counts from a run-all body. `true`, `false` and `null` select
/// the module's default count.
fn requested_counts(raw: Map<String, Value>) -> Result<HashMap<ModuleKind, usize>, AppError> {
    let mut counts = HashMap::new();
    for (key, value) in raw {
        let kind: ModuleKind = key.parse().map_err(|e| bad_request(format!("{}", e)))?;
        let count = match value {
            Value::Null | Value::Bool(_) => None,
            Value::Number(ref n) => {
                let n = n.as_u64().ok_or_else(|| {
                    bad_request(format!("count for '{}' must be a positive integer", key))
                })?;
                Some(usize::try_from(n).unwrap_or(usize::MAX))
            }
            _ => {
                return Err(bad_request(format!(
                    "count for '{}' must be an integer or boolean",
                    key
                )))
            }
        };
        if let Some(count) = check_count(count)? {
            counts.insert(kind, count);
        }
    }
    Ok(counts)
}

async fn handle_enrich_all(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let raw: Map<String, Value> = parse_body(&body)?;
    let counts = requested_counts(raw)?;

    let report = state.orchestrator.run_all(&counts).await;

    let mut results = Map::new();
    for outcome in &report.results {
        let entry = match &outcome.outcome {
            Ok(batch) => batch_json(outcome.module, batch),
            Err(failure) => failure_json(failure),
        };
        results.insert(outcome.module.name().to_string(), entry);
    }

    Ok(Json(json!({
        "success": true,
        "results": results,
        "summary": { "total_updates": report.total_updates() },
    })))
}

// ============ GET /enrich/health ============

#[derive(Serialize)]
struct EnrichHealthResponse {
    database: String,
    ai_mode: String,
    ai_available: bool,
    ai_endpoint: String,
    ai_model: Option<String>,
}

async fn handle_enrich_health(State(state): State<AppState>) -> Json<EnrichHealthResponse> {
    let database = match db::ping(&state.pool).await {
        Ok(()) => "connected".to_string(),
        Err(e) => format!("error: {}", e),
    };
    let generator = state.orchestrator.generator();
    let info = generator.info();

    Json(EnrichHealthResponse {
        database,
        ai_mode: info.mode.to_string(),
        ai_available: generator.health().await,
        ai_endpoint: info.endpoint,
        ai_model: info.model,
    })
}

// ============ POST /chat/query ============

#[derive(Deserialize)]
struct ChatQueryRequest {
    query: String,
    #[serde(default, rename = "topK", alias = "top_k")]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct ChatQueryResponse {
    answer: String,
    sources: Vec<Document>,
}

async fn handle_chat_query(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ChatQueryResponse>, AppError> {
    let req: ChatQueryRequest = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("invalid JSON body: {}", e)))?;

    let top_k = req.top_k.map(|k| k.clamp(1, MAX_COUNT));
    match state.chat.answer(&req.query, top_k).await {
        Ok(answer) => Ok(Json(ChatQueryResponse {
            answer: answer.answer,
            sources: answer.sources,
        })),
        Err(ChatError::EmptyQuery) => Err(bad_request("query must not be empty")),
        Err(ChatError::Unavailable { reason }) => {
            tracing::warn!(%reason, "chat query could not be answered");
            Err(unavailable("AI service unavailable"))
        }
    }
}

// ============ POST /chat/ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    docs: Vec<NewDocument>,
}

async fn handle_chat_ingest(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let req: IngestRequest = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("invalid JSON body: {}", e)))?;
    let Some(store) = state.orchestrator.context() else {
        return Err(bad_request("retrieval store is not enabled"));
    };

    match store.upsert(&req.docs).await {
        Ok(summary) => Ok(Json(json!({ "ok": true, "upserted": summary.accepted_count }))),
        Err(e) => Err(AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("ingest failed: {}", e),
            warning: false,
            kind: Some("fatal"),
        }),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

//! Inference dispatch.
//!
//! [`InferenceDispatcher`] sends one chat-style request to the active backend
//! and folds every outcome into a [`GenerationResult`]:
//!
//! | Outcome | Result |
//! |---|---|
//! | connection refused, timeout, non-2xx, deadline passed | `Unavailable` |
//! | 2xx with empty or unrecognised payload | `Malformed` |
//! | 2xx with reply text | `Success` |
//!
//! The dispatcher never retries; that is the orchestrator's call.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::backend::{BackendConfig, BackendMode, BackendRegistry, Credentials};
use crate::models::{GenerationRequest, GenerationResult};
use crate::sigv4::{self, SigningInput};

/// System message used by the dedicated backend when the caller sends none.
const DEFAULT_SYSTEM_PROMPT: &str = "You are a research assistant for African healthcare, \
biotech and investment data. Answer precisely and return structured data when asked.";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Anything that can turn a [`GenerationRequest`] into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// One attempt, bounded by the backend timeout and the optional deadline.
    async fn generate(
        &self,
        req: &GenerationRequest,
        deadline: Option<Instant>,
    ) -> GenerationResult;

    async fn health(&self) -> bool;

    fn info(&self) -> BackendInfo;
}

/// What the health endpoint reports about the active backend.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendInfo {
    pub mode: BackendMode,
    pub endpoint: String,
    pub model: Option<String>,
}

pub struct InferenceDispatcher {
    backend: BackendConfig,
    client: reqwest::Client,
}

impl InferenceDispatcher {
    pub fn new(registry: &BackendRegistry) -> Result<Self> {
        let backend = registry.active().clone();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(backend.timeout_ms))
            .build()?;
        Ok(Self { backend, client })
    }

    pub async fn call(&self, req: &GenerationRequest) -> GenerationResult {
        self.call_until(req, None).await
    }

    /// Like [`call`](Self::call) but gives up at `deadline`.
    pub async fn call_until(
        &self,
        req: &GenerationRequest,
        deadline: Option<Instant>,
    ) -> GenerationResult {
        let result = match deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return deadline_exceeded();
                }
                match tokio::time::timeout_at(deadline, self.invoke(req)).await {
                    Ok(result) => result,
                    Err(_) => deadline_exceeded(),
                }
            }
            None => self.invoke(req).await,
        };

        match &result {
            GenerationResult::Success { text } => {
                tracing::debug!(backend = %self.backend.mode, chars = text.len(), "generation succeeded")
            }
            GenerationResult::Unavailable { reason } => {
                tracing::warn!(backend = %self.backend.mode, %reason, "backend unavailable")
            }
            GenerationResult::Malformed { raw_text } => tracing::warn!(
                backend = %self.backend.mode,
                bytes = raw_text.len(),
                "backend returned a malformed payload"
            ),
        }
        result
    }

    async fn invoke(&self, req: &GenerationRequest) -> GenerationResult {
        let builder = match self.build_request(req) {
            Ok(builder) => builder,
            Err(e) => {
                return GenerationResult::Unavailable {
                    reason: e.to_string(),
                }
            }
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                return GenerationResult::Unavailable {
                    reason: describe_transport_error(&e, &self.backend),
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            return GenerationResult::Unavailable {
                reason: format!("{} backend returned HTTP {}", self.backend.mode, status.as_u16()),
            };
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return GenerationResult::Unavailable {
                    reason: describe_transport_error(&e, &self.backend),
                }
            }
        };

        match extract_reply(&body).map(|text| clean_text(&text)) {
            Some(text) if !text.is_empty() => GenerationResult::Success { text },
            _ => GenerationResult::Malformed { raw_text: body },
        }
    }

    fn build_request(&self, req: &GenerationRequest) -> Result<reqwest::RequestBuilder> {
        let backend = &self.backend;
        match backend.mode {
            BackendMode::Dedicated => {
                let body = json!({
                    "messages": chat_messages(req, Some(DEFAULT_SYSTEM_PROMPT)),
                    "temperature": req.temperature,
                    "max_tokens": req.max_tokens,
                    "top_p": 0.9,
                    "repetition_penalty": 1.15,
                });
                let mut builder = self
                    .client
                    .post(format!("{}/chat", backend.endpoint))
                    .json(&body);
                if let Credentials::ApiKey(ref key) = backend.credentials {
                    builder = builder.header("X-API-Key", key);
                }
                Ok(builder)
            }
            BackendMode::ManagedCloud => {
                let creds = match backend.credentials {
                    Credentials::Aws(ref creds) => creds,
                    _ => return Err(anyhow!("managed-cloud credentials are not configured")),
                };
                let body = serde_json::to_vec(&json!({
                    "messages": chat_messages(req, None),
                    "temperature": req.temperature,
                    "max_tokens": req.max_tokens,
                }))?;

                let url = reqwest::Url::parse(&backend.endpoint)?;
                let host = match (url.host_str(), url.port()) {
                    (Some(host), Some(port)) => format!("{}:{}", host, port),
                    (Some(host), None) => host.to_string(),
                    (None, _) => return Err(anyhow!("managed-cloud endpoint has no host")),
                };
                let region = backend.region.as_deref().unwrap_or("us-east-1");
                let headers = sigv4::sign(
                    creds,
                    &SigningInput {
                        method: "POST",
                        host: &host,
                        path: url.path(),
                        payload: &body,
                        region,
                        service: "sagemaker",
                    },
                    chrono::Utc::now(),
                )?;

                let mut builder = self
                    .client
                    .post(url)
                    .header("Content-Type", "application/json")
                    .body(body);
                for (name, value) in headers {
                    builder = builder.header(name, value);
                }
                Ok(builder)
            }
            BackendMode::Local => {
                let body = json!({
                    "model": backend.model.as_deref().unwrap_or_default(),
                    "messages": chat_messages(req, None),
                    "temperature": req.temperature,
                    "max_tokens": req.max_tokens,
                });
                let mut builder = self
                    .client
                    .post(format!("{}/v1/chat/completions", backend.endpoint))
                    .json(&body);
                if let Credentials::ApiKey(ref key) = backend.credentials {
                    builder = builder.bearer_auth(key);
                }
                Ok(builder)
            }
        }
    }

    async fn dedicated_health(&self) -> bool {
        let endpoint = &self.backend.endpoint;
        let with_key = |builder: reqwest::RequestBuilder| match self.backend.credentials {
            Credentials::ApiKey(ref key) => builder.header("X-API-Key", key),
            _ => builder,
        };

        let health = with_key(self.client.get(format!("{}/health", endpoint)))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        if let Ok(resp) = health {
            if resp.status().is_success() {
                if let Ok(body) = resp.json::<Value>().await {
                    if health_body_ok(&body) {
                        return true;
                    }
                }
            }
        }

        // Older hosts only expose /ping.
        match with_key(self.client.get(format!("{}/ping", endpoint)))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl TextGenerator for InferenceDispatcher {
    async fn generate(
        &self,
        req: &GenerationRequest,
        deadline: Option<Instant>,
    ) -> GenerationResult {
        self.call_until(req, deadline).await
    }

    async fn health(&self) -> bool {
        match self.backend.mode {
            BackendMode::Dedicated => self.dedicated_health().await,
            // No probe: every invocation of a managed endpoint is billed.
            BackendMode::ManagedCloud => matches!(self.backend.credentials, Credentials::Aws(_)),
            BackendMode::Local => {
                let probe = GenerationRequest {
                    system_prompt: None,
                    user_prompt: "ping".to_string(),
                    temperature: 0.0,
                    max_tokens: 10,
                };
                let deadline = Instant::now() + HEALTH_TIMEOUT;
                self.call_until(&probe, Some(deadline)).await.is_success()
            }
        }
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            mode: self.backend.mode,
            endpoint: self.backend.endpoint.clone(),
            model: self.backend.model.clone(),
        }
    }
}

fn deadline_exceeded() -> GenerationResult {
    GenerationResult::Unavailable {
        reason: "deadline exceeded".to_string(),
    }
}

fn describe_transport_error(e: &reqwest::Error, backend: &BackendConfig) -> String {
    if e.is_connect() {
        format!("cannot connect to {} backend at {}", backend.mode, backend.endpoint)
    } else if e.is_timeout() {
        format!(
            "{} backend timed out after {}ms",
            backend.mode, backend.timeout_ms
        )
    } else {
        format!("{} backend request failed: {}", backend.mode, e)
    }
}

fn chat_messages(req: &GenerationRequest, default_system: Option<&str>) -> Vec<Value> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = req.system_prompt.as_deref().or(default_system) {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": req.user_prompt }));
    messages
}

/// Pull the reply text out of any of the payload shapes backends return.
fn extract_reply(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match &value {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => {
            if let Some(s) = value
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
            {
                return Some(s.to_string());
            }
            ["output", "response", "generated_text"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str))
                .map(str::to_string)
        }
        Value::Array(items) => items
            .first()
            .and_then(|v| v.get("generated_text"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Strip replacement, control and zero-width characters, then trim.
pub fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|c| match *c {
            '\n' | '\t' | '\r' => true,
            '\u{FFFD}' | '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' => false,
            c => !c.is_control(),
        })
        .collect::<String>()
        .trim()
        .to_string()
}

fn health_body_ok(body: &Value) -> bool {
    let status_ok = body
        .get("status")
        .and_then(Value::as_str)
        .map(|s| matches!(s, "ok" | "OK" | "healthy"))
        .unwrap_or(false);
    let gpu = body
        .get("gpu")
        .map(|v| !v.is_null() && v != &Value::Bool(false))
        .unwrap_or(false);
    let ready = body.get("inference_ready") == Some(&Value::Bool(true));
    status_ok || gpu || ready
}

/// Mock generator for testing. Replays queued results in order.
///
/// Once the queue is empty every call yields `Unavailable`.
pub struct ScriptedGenerator {
    results: Mutex<VecDeque<GenerationResult>>,
    requests: Mutex<Vec<GenerationRequest>>,
    healthy: bool,
}

impl ScriptedGenerator {
    pub fn new(results: Vec<GenerationResult>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
            healthy: true,
        }
    }

    /// Convenience: a single successful reply.
    pub fn replying(text: &str) -> Self {
        Self::new(vec![GenerationResult::Success {
            text: text.to_string(),
        }])
    }

    pub fn with_health(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        req: &GenerationRequest,
        deadline: Option<Instant>,
    ) -> GenerationResult {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(req.clone());
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return deadline_exceeded();
        }
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| GenerationResult::Unavailable {
                reason: "no scripted response left".to_string(),
            })
    }

    async fn health(&self) -> bool {
        self.healthy
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            mode: BackendMode::Local,
            endpoint: "scripted".to_string(),
            model: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendsConfig;

    fn request(system: Option<&str>) -> GenerationRequest {
        GenerationRequest {
            system_prompt: system.map(str::to_string),
            user_prompt: "list companies".to_string(),
            temperature: 0.3,
            max_tokens: 100,
        }
    }

    #[test]
    fn test_extract_reply_shapes() {
        assert_eq!(
            extract_reply(r#"{"choices":[{"message":{"content":"hi"}}]}"#).as_deref(),
            Some("hi")
        );
        assert_eq!(extract_reply(r#"{"output":"out"}"#).as_deref(), Some("out"));
        assert_eq!(extract_reply(r#"{"response":"resp"}"#).as_deref(), Some("resp"));
        assert_eq!(extract_reply(r#""bare""#).as_deref(), Some("bare"));
        assert_eq!(
            extract_reply(r#"[{"generated_text":"tgi"}]"#).as_deref(),
            Some("tgi")
        );
        assert_eq!(extract_reply(r#"{"choices":[]}"#), None);
        assert_eq!(extract_reply("<html>502</html>"), None);
    }

    #[test]
    fn test_clean_text_strips_noise() {
        assert_eq!(clean_text("\u{FEFF} a\u{200B}b\u{FFFD}\u{0007}\n c  "), "ab\n c");
        assert_eq!(clean_text("\u{200B}\u{FFFD}  "), "");
    }

    #[test]
    fn test_chat_messages_default_system() {
        let with_default = chat_messages(&request(None), Some("sys"));
        assert_eq!(with_default.len(), 2);
        assert_eq!(with_default[0]["content"], "sys");

        let explicit = chat_messages(&request(Some("mine")), Some("sys"));
        assert_eq!(explicit[0]["content"], "mine");

        let bare = chat_messages(&request(None), None);
        assert_eq!(bare.len(), 1);
        assert_eq!(bare[0]["role"], "user");
    }

    #[test]
    fn test_health_body_variants() {
        assert!(health_body_ok(&json!({"status": "healthy"})));
        assert!(health_body_ok(&json!({"status": "degraded", "inference_ready": true})));
        assert!(health_body_ok(&json!({"gpu": "A100"})));
        assert!(!health_body_ok(&json!({"status": "loading", "gpu": false})));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let mut config = BackendsConfig::default();
        config.local.url = "http://127.0.0.1:1".to_string();
        config.local.timeout_ms = 2_000;
        let registry = BackendRegistry::from_config(&config).unwrap();
        let dispatcher = InferenceDispatcher::new(&registry).unwrap();

        let result = dispatcher.call(&request(None)).await;
        assert!(matches!(result, GenerationResult::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_expired_deadline_short_circuits() {
        let registry = BackendRegistry::from_config(&BackendsConfig::default()).unwrap();
        let dispatcher = InferenceDispatcher::new(&registry).unwrap();

        let past = Instant::now() - Duration::from_millis(1);
        let result = dispatcher.call_until(&request(None), Some(past)).await;
        assert_eq!(
            result,
            GenerationResult::Unavailable {
                reason: "deadline exceeded".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_managed_cloud_without_credentials_is_unavailable() {
        let mut config = BackendsConfig::default();
        config.managed_cloud.endpoint_name = Some("enrich-7b".to_string());
        let registry = BackendRegistry::from_config(&config).unwrap();
        let dispatcher = InferenceDispatcher::new(&registry).unwrap();

        assert!(!dispatcher.health().await);
        match dispatcher.call(&request(None)).await {
            GenerationResult::Unavailable { reason } => assert!(reason.contains("credentials")),
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scripted_generator_replays_then_runs_dry() {
        let generator = ScriptedGenerator::replying("[]");
        assert!(generator.generate(&request(None), None).await.is_success());
        assert!(!generator.generate(&request(None), None).await.is_success());
        assert_eq!(generator.requests().len(), 2);
    }
}

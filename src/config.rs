//! Configuration loading.
//!
//! Settings come from an optional TOML file, then environment variables
//! override individual values. The environment is the deployment surface:
//! a process started with `DEDICATED_AI_URL` set selects the dedicated
//! backend without any file edits.
//!
//! ```toml
//! [db]
//! path = "./data/enrich.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7340"
//!
//! [generation]
//! temperature = 0.3
//! max_tokens = 4000
//!
//! [backends]
//! mode = "auto"
//!
//! [backends.local]
//! url = "http://localhost:8000"
//! model = "mistral-7b-instruct"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/enrich.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Deadline applied to every enrichment or chat request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}
fn default_request_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: default_top_k(),
            timeout_ms: default_retrieval_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_top_k() -> usize {
    5
}
fn default_retrieval_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Temperature for enrichment calls. Kept low so records stay factual.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_chat_temperature")]
    pub chat_temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub chat_max_tokens: u32,
    /// Extra attempts after an `Unavailable` result. Capped at 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            chat_temperature: default_chat_temperature(),
            chat_max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_temperature() -> f64 {
    0.3
}
fn default_chat_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_max_retries() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendsConfig {
    /// `auto`, `dedicated`, `managed-cloud`, or `local`.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub dedicated: DedicatedConfig,
    #[serde(default)]
    pub managed_cloud: ManagedCloudConfig,
    #[serde(default)]
    pub local: LocalConfig,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            dedicated: DedicatedConfig::default(),
            managed_cloud: ManagedCloudConfig::default(),
            local: LocalConfig::default(),
        }
    }
}

fn default_mode() -> String {
    "auto".to_string()
}

/// Rented GPU host running the fine-tuned model behind a small HTTP API.
#[derive(Debug, Deserialize, Clone)]
pub struct DedicatedConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_dedicated_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DedicatedConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_ms: default_dedicated_timeout_ms(),
        }
    }
}

fn default_dedicated_timeout_ms() -> u64 {
    30_000
}

/// Managed inference endpoint invoked through a SigV4-signed runtime API.
#[derive(Debug, Deserialize, Clone)]
pub struct ManagedCloudConfig {
    #[serde(default)]
    pub endpoint_name: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Overrides the runtime host, e.g. for a compatible gateway.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default = "default_managed_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ManagedCloudConfig {
    fn default() -> Self {
        Self {
            endpoint_name: None,
            region: default_region(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            timeout_ms: default_managed_timeout_ms(),
        }
    }
}

fn default_region() -> String {
    "us-east-2".to_string()
}
fn default_managed_timeout_ms() -> u64 {
    60_000
}

/// Self-hosted OpenAI-compatible server (vLLM, Ollama, llama.cpp).
#[derive(Debug, Deserialize, Clone)]
pub struct LocalConfig {
    #[serde(default = "default_local_url")]
    pub url: String,
    #[serde(default = "default_local_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_local_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            url: default_local_url(),
            model: default_local_model(),
            api_key: None,
            timeout_ms: default_local_timeout_ms(),
        }
    }
}

fn default_local_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_local_model() -> String {
    "mistral-7b-instruct".to_string()
}
fn default_local_timeout_ms() -> u64 {
    60_000
}

/// Load configuration from an optional TOML file plus the process environment.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse config file")?
        }
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Overlay environment values onto `config`.
///
/// `lookup` stands in for `std::env::var` so callers can supply a fixed map.
/// Empty values are treated as unset.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("ENRICH_DB_PATH") {
        config.db.path = PathBuf::from(v);
    }
    if let Some(v) = get("ENRICH_BIND") {
        config.server.bind = v;
    }
    if let Some(v) = get("ENRICH_AI_MODE") {
        config.backends.mode = v;
    }

    let dedicated = &mut config.backends.dedicated;
    if let Some(v) = get("DEDICATED_AI_URL") {
        dedicated.url = Some(v);
    }
    if let Some(v) = get("DEDICATED_AI_API_KEY") {
        dedicated.api_key = Some(v);
    }

    let managed = &mut config.backends.managed_cloud;
    if let Some(v) = get("MANAGED_AI_ENDPOINT_NAME") {
        managed.endpoint_name = Some(v);
    }
    if let Some(v) = get("MANAGED_AI_REGION") {
        managed.region = v;
    }
    if let Some(v) = get("MANAGED_AI_ENDPOINT_URL") {
        managed.endpoint_url = Some(v);
    }
    if let Some(v) = get("AWS_ACCESS_KEY_ID") {
        managed.access_key_id = Some(v);
    }
    if let Some(v) = get("AWS_SECRET_ACCESS_KEY") {
        managed.secret_access_key = Some(v);
    }
    if let Some(v) = get("AWS_SESSION_TOKEN") {
        managed.session_token = Some(v);
    }

    let local = &mut config.backends.local;
    if let Some(v) = get("LOCAL_AI_URL") {
        local.url = v;
    }
    if let Some(v) = get("LOCAL_AI_MODEL") {
        local.model = v;
    }
    if let Some(v) = get("LOCAL_AI_API_KEY") {
        local.api_key = Some(v);
    }

    if let Some(v) = get("AI_TEMPERATURE") {
        config.generation.temperature = v
            .parse()
            .with_context(|| format!("AI_TEMPERATURE is not a number: '{}'", v))?;
    }
    if let Some(v) = get("AI_MAX_TOKENS") {
        config.generation.max_tokens = v
            .parse()
            .with_context(|| format!("AI_MAX_TOKENS is not an integer: '{}'", v))?;
    }
    if let Some(v) = get("AI_TIMEOUT_MS") {
        let ms: u64 = v
            .parse()
            .with_context(|| format!("AI_TIMEOUT_MS is not an integer: '{}'", v))?;
        config.backends.dedicated.timeout_ms = ms;
        config.backends.managed_cloud.timeout_ms = ms;
        config.backends.local.timeout_ms = ms;
    }

    Ok(())
}

pub fn validate(config: &Config) -> Result<()> {
    let generation = &config.generation;
    if !(0.0..=2.0).contains(&generation.temperature) {
        bail!("generation.temperature must be in [0.0, 2.0]");
    }
    if !(0.0..=2.0).contains(&generation.chat_temperature) {
        bail!("generation.chat_temperature must be in [0.0, 2.0]");
    }
    if generation.max_tokens == 0 || generation.chat_max_tokens == 0 {
        bail!("generation max token limits must be > 0");
    }
    if generation.max_retries > 3 {
        bail!("generation.max_retries must be <= 3");
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.server.request_timeout_secs == 0 {
        bail!("server.request_timeout_secs must be > 0");
    }

    let backends = &config.backends;
    if backends.dedicated.timeout_ms == 0
        || backends.managed_cloud.timeout_ms == 0
        || backends.local.timeout_ms == 0
    {
        bail!("backend timeout_ms must be > 0");
    }

    match backends.mode.as_str() {
        "auto" | "local" => {}
        "dedicated" => {
            if backends.dedicated.url.is_none() {
                bail!("backends.mode = 'dedicated' requires backends.dedicated.url (DEDICATED_AI_URL)");
            }
        }
        "managed-cloud" => {
            if backends.managed_cloud.endpoint_name.is_none() {
                bail!(
                    "backends.mode = 'managed-cloud' requires backends.managed_cloud.endpoint_name (MANAGED_AI_ENDPOINT_NAME)"
                );
            }
        }
        other => bail!(
            "Unknown backend mode: '{}'. Must be auto, dedicated, managed-cloud, or local.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        validate(&config).unwrap();
        assert_eq!(config.backends.mode, "auto");
        assert_eq!(config.backends.local.url, "http://localhost:8000");
        assert_eq!(config.generation.max_retries, 1);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
[db]
path = "/tmp/x.sqlite"

[backends.dedicated]
url = "http://gpu-box:8081"
"#,
        )
        .unwrap();
        assert_eq!(config.db.path, PathBuf::from("/tmp/x.sqlite"));
        assert_eq!(config.backends.dedicated.url.as_deref(), Some("http://gpu-box:8081"));
        assert_eq!(config.backends.dedicated.timeout_ms, 30_000);
        assert_eq!(config.retrieval.top_k, 5);
    }

    #[test]
    fn test_env_overrides_backends() {
        let vars = env(&[
            ("DEDICATED_AI_URL", "http://10.0.0.5:8081"),
            ("DEDICATED_AI_API_KEY", "secret"),
            ("MANAGED_AI_ENDPOINT_NAME", "enrich-7b"),
            ("LOCAL_AI_MODEL", "llama3"),
            ("AI_MAX_TOKENS", "1024"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.backends.dedicated.url.as_deref(), Some("http://10.0.0.5:8081"));
        assert_eq!(config.backends.dedicated.api_key.as_deref(), Some("secret"));
        assert_eq!(config.backends.managed_cloud.endpoint_name.as_deref(), Some("enrich-7b"));
        assert_eq!(config.backends.local.model, "llama3");
        assert_eq!(config.generation.max_tokens, 1024);
    }

    #[test]
    fn test_empty_env_value_is_ignored() {
        let vars = env(&[("DEDICATED_AI_URL", "  ")]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).cloned()).unwrap();
        assert!(config.backends.dedicated.url.is_none());
    }

    #[test]
    fn test_bad_numeric_env_fails() {
        let vars = env(&[("AI_TEMPERATURE", "warm")]);
        let mut config = Config::default();
        let err = apply_env_overrides(&mut config, |k| vars.get(k).cloned()).unwrap_err();
        assert!(err.to_string().contains("AI_TEMPERATURE"));
    }

    #[test]
    fn test_timeout_env_applies_to_all_backends() {
        let vars = env(&[("AI_TIMEOUT_MS", "5000")]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.backends.dedicated.timeout_ms, 5000);
        assert_eq!(config.backends.managed_cloud.timeout_ms, 5000);
        assert_eq!(config.backends.local.timeout_ms, 5000);
    }

    #[test]
    fn test_explicit_mode_requires_endpoint() {
        let mut config = Config::default();
        config.backends.mode = "dedicated".to_string();
        assert!(validate(&config).is_err());

        config.backends.dedicated.url = Some("http://gpu:8081".to_string());
        validate(&config).unwrap();
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let mut config = Config::default();
        config.backends.mode = "round-robin".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("Unknown backend mode"));
    }

    #[test]
    fn test_retry_cap() {
        let mut config = Config::default();
        config.generation.max_retries = 4;
        assert!(validate(&config).is_err());
    }
}

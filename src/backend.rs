//! Backend registry.
//!
//! Built once at startup from [`BackendsConfig`]. Lists every configured
//! inference backend in priority order (dedicated, managed-cloud, local)
//! and fixes which one is active for the life of the process.

use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;

use crate::config::BackendsConfig;
use crate::sigv4::AwsCredentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendMode {
    Dedicated,
    ManagedCloud,
    Local,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Dedicated => "dedicated",
            BackendMode::ManagedCloud => "managed-cloud",
            BackendMode::Local => "local",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    ApiKey(String),
    Aws(AwsCredentials),
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub mode: BackendMode,
    /// Base URL for dedicated/local; full invocation URL for managed-cloud.
    pub endpoint: String,
    pub credentials: Credentials,
    pub timeout_ms: u64,
    pub model: Option<String>,
    /// Signing region, managed-cloud only.
    pub region: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: Vec<BackendConfig>,
    active: usize,
}

impl BackendRegistry {
    pub fn from_config(config: &BackendsConfig) -> Result<Self> {
        let mut backends = Vec::new();

        if let Some(ref url) = config.dedicated.url {
            backends.push(BackendConfig {
                name: "dedicated-gpu".to_string(),
                mode: BackendMode::Dedicated,
                endpoint: url.trim_end_matches('/').to_string(),
                credentials: config
                    .dedicated
                    .api_key
                    .clone()
                    .map(Credentials::ApiKey)
                    .unwrap_or(Credentials::None),
                timeout_ms: config.dedicated.timeout_ms,
                model: None,
                region: None,
            });
        }

        if let Some(ref endpoint_name) = config.managed_cloud.endpoint_name {
            let managed = &config.managed_cloud;
            let base = match managed.endpoint_url {
                Some(ref url) => url.trim_end_matches('/').to_string(),
                None => format!("https://runtime.sagemaker.{}.amazonaws.com", managed.region),
            };
            let credentials = match (&managed.access_key_id, &managed.secret_access_key) {
                (Some(key), Some(secret)) => Credentials::Aws(AwsCredentials {
                    access_key_id: key.clone(),
                    secret_access_key: secret.clone(),
                    session_token: managed.session_token.clone(),
                }),
                _ => Credentials::None,
            };
            backends.push(BackendConfig {
                name: "managed-cloud".to_string(),
                mode: BackendMode::ManagedCloud,
                endpoint: format!("{}/endpoints/{}/invocations", base, endpoint_name),
                credentials,
                timeout_ms: managed.timeout_ms,
                model: Some(endpoint_name.clone()),
                region: Some(managed.region.clone()),
            });
        }

        // Local is always registered as the last resort.
        backends.push(BackendConfig {
            name: "local".to_string(),
            mode: BackendMode::Local,
            endpoint: config.local.url.trim_end_matches('/').to_string(),
            credentials: config
                .local
                .api_key
                .clone()
                .map(Credentials::ApiKey)
                .unwrap_or(Credentials::None),
            timeout_ms: config.local.timeout_ms,
            model: Some(config.local.model.clone()),
            region: None,
        });

        let active = match config.mode.as_str() {
            "auto" => 0,
            "dedicated" => position(&backends, BackendMode::Dedicated)?,
            "managed-cloud" => position(&backends, BackendMode::ManagedCloud)?,
            "local" => position(&backends, BackendMode::Local)?,
            other => bail!("Unknown backend mode: '{}'", other),
        };

        Ok(Self { backends, active })
    }

    pub fn active(&self) -> &BackendConfig {
        &self.backends[self.active]
    }

    pub fn mode(&self) -> BackendMode {
        self.active().mode
    }

    /// Configured backends in priority order.
    pub fn backends(&self) -> &[BackendConfig] {
        &self.backends
    }
}

fn position(backends: &[BackendConfig], mode: BackendMode) -> Result<usize> {
    match backends.iter().position(|b| b.mode == mode) {
        Some(idx) => Ok(idx),
        None => bail!("backend mode '{}' selected but not configured", mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_select_local() {
        let registry = BackendRegistry::from_config(&BackendsConfig::default()).unwrap();
        assert_eq!(registry.mode(), BackendMode::Local);
        assert_eq!(registry.backends().len(), 1);
        assert_eq!(registry.active().endpoint, "http://localhost:8000");
        assert_eq!(registry.active().model.as_deref(), Some("mistral-7b-instruct"));
    }

    #[test]
    fn test_dedicated_wins_over_managed() {
        let mut config = BackendsConfig::default();
        config.dedicated.url = Some("http://gpu:8081/".to_string());
        config.managed_cloud.endpoint_name = Some("enrich-7b".to_string());

        let registry = BackendRegistry::from_config(&config).unwrap();
        assert_eq!(registry.mode(), BackendMode::Dedicated);
        assert_eq!(registry.active().endpoint, "http://gpu:8081");
        let modes: Vec<_> = registry.backends().iter().map(|b| b.mode).collect();
        assert_eq!(
            modes,
            vec![BackendMode::Dedicated, BackendMode::ManagedCloud, BackendMode::Local]
        );
    }

    #[test]
    fn test_managed_cloud_endpoint_and_credentials() {
        let mut config = BackendsConfig::default();
        config.managed_cloud.endpoint_name = Some("enrich-7b".to_string());
        config.managed_cloud.access_key_id = Some("AKID".to_string());
        config.managed_cloud.secret_access_key = Some("secret".to_string());

        let registry = BackendRegistry::from_config(&config).unwrap();
        let active = registry.active();
        assert_eq!(active.mode, BackendMode::ManagedCloud);
        assert_eq!(
            active.endpoint,
            "https://runtime.sagemaker.us-east-2.amazonaws.com/endpoints/enrich-7b/invocations"
        );
        assert!(matches!(active.credentials, Credentials::Aws(_)));
    }

    #[test]
    fn test_managed_cloud_without_keys_has_no_credentials() {
        let mut config = BackendsConfig::default();
        config.managed_cloud.endpoint_name = Some("enrich-7b".to_string());
        config.managed_cloud.endpoint_url = Some("http://127.0.0.1:9000".to_string());

        let registry = BackendRegistry::from_config(&config).unwrap();
        assert_eq!(registry.active().credentials, Credentials::None);
        assert_eq!(
            registry.active().endpoint,
            "http://127.0.0.1:9000/endpoints/enrich-7b/invocations"
        );
    }

    #[test]
    fn test_explicit_mode_overrides_priority() {
        let mut config = BackendsConfig::default();
        config.dedicated.url = Some("http://gpu:8081".to_string());
        config.mode = "local".to_string();

        let registry = BackendRegistry::from_config(&config).unwrap();
        assert_eq!(registry.mode(), BackendMode::Local);
    }

    #[test]
    fn test_explicit_mode_without_backend_fails() {
        let mut config = BackendsConfig::default();
        config.mode = "managed-cloud".to_string();
        assert!(BackendRegistry::from_config(&config).is_err());
    }

    #[test]
    fn test_mode_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&BackendMode::ManagedCloud).unwrap(),
            "\"managed-cloud\""
        );
    }
}

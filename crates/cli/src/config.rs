//! Server configuration for `fieldops serve`.
//!
//! # Example
//!
//! ```toml
//! port = 8080
//! rate_limit = 120
//! policy_file = "policy.toml"
//! sms_gateway_url = "https://sms.internal.example.com/send"
//! log_level = "fieldops_engine=debug,info"
//!
//! [lifecycle]
//! code_ttl_secs = 300
//! operation_timeout_ms = 3000
//! ```
//!
//! `FIELDOPS_API_KEY`, `FIELDOPS_RATE_LIMIT` and `FIELDOPS_SMS_GATEWAY_URL`
//! override the file.

use std::path::{Path, PathBuf};

use fieldops_engine::LifecycleConfig;
use serde::Deserialize;

/// Default rate limit: 60 requests per minute per IP.
pub(crate) const DEFAULT_RATE_LIMIT: u64 = 60;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ServeConfig {
    pub(crate) port: u16,
    /// Requests per minute per client IP.
    pub(crate) rate_limit: u64,
    /// When set, every endpoint except `/health` requires this key.
    pub(crate) api_key: Option<String>,
    /// Replaces the built-in policy table.
    pub(crate) policy_file: Option<PathBuf>,
    /// SMS gateway endpoint. Without one, messages are only logged.
    pub(crate) sms_gateway_url: Option<String>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub(crate) log_level: String,
    pub(crate) lifecycle: LifecycleConfig,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            rate_limit: DEFAULT_RATE_LIMIT,
            api_key: None,
            policy_file: None,
            sms_gateway_url: None,
            log_level: "info".to_string(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl ServeConfig {
    /// Read `path` (or start from defaults) and apply environment overrides.
    pub(crate) fn load(path: Option<&Path>) -> Result<Self, String> {
        let mut config = match path {
            Some(path) => Self::read(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
        toml::from_str(&content).map_err(|e| format!("could not parse '{}': {}", path.display(), e))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("FIELDOPS_API_KEY").filter(|k| !k.is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(limit) = lookup("FIELDOPS_RATE_LIMIT").and_then(|v| v.parse().ok()) {
            self.rate_limit = limit;
        }
        if let Some(url) = lookup("FIELDOPS_SMS_GATEWAY_URL").filter(|u| !u.is_empty()) {
            self.sms_gateway_url = Some(url);
        }
        self.api_key = self.api_key.take().filter(|k| !k.is_empty());
    }
}

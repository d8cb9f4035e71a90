use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LoomError, Result};
use crate::security::SecurityPolicy;

/// Top-level Loom configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub security: SecurityPolicy,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Deadline for `trigger_and_wait` when the caller passes none.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Streams idle this long with no active runs are reaped.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Grace period for in-flight runs when a stream stops.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Step ceiling for graphs that do not declare their own.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            max_steps: default_max_steps(),
        }
    }
}

fn default_timeout_secs() -> u64 { 300 }
fn default_idle_timeout_secs() -> u64 { 1800 }
fn default_reaper_interval_secs() -> u64 { 60 }
fn default_stop_timeout_secs() -> u64 { 10 }
fn default_max_steps() -> usize { 100 }

/// Result retention for each execution stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_max_retained_results")]
    pub max_retained_results: usize,
    /// Results older than this are dropped (0 = keep until evicted by count).
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_retained_results: default_max_retained_results(),
            result_ttl_secs: default_result_ttl_secs(),
        }
    }
}

fn default_max_retained_results() -> usize { 1000 }
fn default_result_ttl_secs() -> Option<u64> { Some(3600) }

/// Backoff between node retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_initial_backoff_ms() -> u64 { 250 }
fn default_max_backoff_ms() -> u64 { 10_000 }
fn default_jitter() -> bool { true }

/// Security audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    /// JSONL file; when unset, audit events only go to tracing.
    #[serde(default)]
    pub path: Option<String>,
    /// Rotate once the active file grows past this size.
    #[serde(default = "default_audit_max_bytes")]
    pub max_bytes: u64,
    /// Number of rotated files kept (`audit.log.1` .. `audit.log.N`).
    #[serde(default = "default_audit_max_files")]
    pub max_files: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            path: None,
            max_bytes: default_audit_max_bytes(),
            max_files: default_audit_max_files(),
        }
    }
}

fn default_audit_enabled() -> bool { true }
fn default_audit_max_bytes() -> u64 { 10 * 1024 * 1024 }
fn default_audit_max_files() -> usize { 5 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| LoomError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| LoomError::Config(e.to_string()))
    }

    /// Audit log location, if file output is configured.
    pub fn audit_path(&self) -> Option<PathBuf> {
        self.audit.path.as_deref().map(expand_home)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep the reference when the variable is unset
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::Severity;

    #[test]
    fn empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.runtime.default_timeout_secs, 300);
        assert_eq!(config.runtime.max_steps, 100);
        assert_eq!(config.stream.max_retained_results, 1000);
        assert_eq!(config.stream.result_ttl_secs, Some(3600));
        assert_eq!(config.security.block_at, Severity::Critical);
        assert!(config.audit.enabled);
        assert!(config.gateway.is_none());
    }

    #[test]
    fn partial_sections_keep_field_defaults() {
        let config = AppConfig::from_toml(
            r#"
[stream]
max_retained_results = 5

[security]
block_at = "high"
"#,
        )
        .unwrap();
        assert_eq!(config.stream.max_retained_results, 5);
        assert_eq!(config.stream.result_ttl_secs, Some(3600));
        assert_eq!(config.security.block_at, Severity::High);
        assert_eq!(config.security.patterns.len(), 5);
    }

    #[test]
    fn env_expansion_keeps_unset_refs() {
        let out = expand_env_vars("path = \"${LOOM_SURELY_UNSET_VAR_123}\"");
        assert_eq!(out, "path = \"${LOOM_SURELY_UNSET_VAR_123}\"");
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = AppConfig::from_toml("[runtime\nmax_steps = ").unwrap_err();
        assert!(matches!(err, LoomError::Config(_)));
    }
}

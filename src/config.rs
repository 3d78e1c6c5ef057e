//! Sandbox configuration.
//!
//! Every field has a default; [`SandboxConfig::from_env`] overlays
//! `FN_SANDBOX_*` environment variables on top of them.

use crate::error::SandboxError;
use crate::fetch::FetchConfig;
use crate::output::OutputLimits;
use serde::Deserialize;
use std::time::Duration;

/// Configuration for the function sandbox
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Outer wall-clock budget for one handler invocation, in seconds
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    /// Inner budget for evaluating a single imported module, in milliseconds
    #[serde(default = "default_module_eval_timeout_ms")]
    pub module_eval_timeout_ms: u64,
    /// Maximum size of a fetched module in bytes
    #[serde(default = "default_max_module_size")]
    pub max_module_size: usize,
    /// Time-to-live of durable module cache entries, in seconds
    #[serde(default = "default_module_cache_ttl_secs")]
    pub module_cache_ttl_secs: u64,
    /// Network timeout for a single module fetch, in seconds
    #[serde(default = "default_module_fetch_timeout_secs")]
    pub module_fetch_timeout_secs: u64,
    /// V8 heap limit per isolate in bytes
    #[serde(default = "default_max_heap_size")]
    pub max_heap_size: usize,
    /// Maximum number of isolates running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Origins reachable through the sandbox `fetch()` ("*" = any public origin, empty = fetch disabled)
    #[serde(default = "default_fetch_allowed_origins")]
    pub fetch_allowed_origins: Vec<String>,
    /// Largest response body one sandbox `fetch()` may read, in bytes
    #[serde(default = "default_max_fetch_response_size")]
    pub max_fetch_response_size: usize,
    /// Maximum number of outputs one execution may emit
    #[serde(default = "default_max_output_entries")]
    pub max_output_entries: usize,
    /// Maximum total size of output messages of one execution, in bytes
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: default_execution_timeout_secs(),
            module_eval_timeout_ms: default_module_eval_timeout_ms(),
            max_module_size: default_max_module_size(),
            module_cache_ttl_secs: default_module_cache_ttl_secs(),
            module_fetch_timeout_secs: default_module_fetch_timeout_secs(),
            max_heap_size: default_max_heap_size(),
            max_concurrent: default_max_concurrent(),
            fetch_allowed_origins: default_fetch_allowed_origins(),
            max_fetch_response_size: default_max_fetch_response_size(),
            max_output_entries: default_max_output_entries(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from `FN_SANDBOX_*` environment variables.
    ///
    /// `FN_SANDBOX_FETCH_ALLOWED_ORIGINS` is a comma-separated list.
    pub fn from_env() -> Result<Self, SandboxError> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("FN_SANDBOX")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("fetch_allowed_origins"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn module_eval_timeout(&self) -> Duration {
        Duration::from_millis(self.module_eval_timeout_ms)
    }

    pub fn module_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.module_cache_ttl_secs)
    }

    pub fn module_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.module_fetch_timeout_secs)
    }

    pub fn output_limits(&self) -> OutputLimits {
        OutputLimits {
            max_entries: self.max_output_entries,
            max_bytes: self.max_output_bytes,
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig::new(self.fetch_allowed_origins.clone())
            .with_max_response_size(self.max_fetch_response_size)
    }
}

fn default_execution_timeout_secs() -> u64 {
    60
}

fn default_module_eval_timeout_ms() -> u64 {
    3_000
}

fn default_max_module_size() -> usize {
    5 * 1024 * 1024 // 5 MiB
}

fn default_module_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_module_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_heap_size() -> usize {
    128 * 1024 * 1024 // 128 MiB
}

fn default_max_concurrent() -> usize {
    16
}

fn default_fetch_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_max_fetch_response_size() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_max_output_entries() -> usize {
    OutputLimits::default().max_entries
}

fn default_max_output_bytes() -> usize {
    OutputLimits::default().max_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.execution_timeout(), Duration::from_secs(60));
        assert_eq!(config.module_eval_timeout(), Duration::from_secs(3));
        assert_eq!(config.max_module_size, 5 * 1024 * 1024);
        assert_eq!(config.module_cache_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.fetch_allowed_origins, vec!["*".to_string()]);
        assert_eq!(config.fetch_config().max_response_size, 10 * 1024 * 1024);
        assert_eq!(config.output_limits(), OutputLimits::default());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"execution_timeout_secs": 5}"#).unwrap();
        assert_eq!(config.execution_timeout_secs, 5);
        assert_eq!(config.module_eval_timeout_ms, 3_000);
        assert_eq!(config.max_concurrent, 16);
    }
}

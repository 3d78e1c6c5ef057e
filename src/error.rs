//! Error taxonomy for the function sandbox.

use thiserror::Error;

/// Errors raised while preparing, running or importing into a sandbox.
///
/// Everything that originates inside the isolate is converted into an
/// `error` output on the [`ExecutionResult`](crate::ExecutionResult); only
/// Building-phase rejections and platform failures are returned as `Err`
/// from [`SandboxExecutor::execute`](crate::SandboxExecutor::execute).
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Missing required argument, bad argument type or malformed request.
    #[error("{0}")]
    Validation(String),

    /// The module specifier resolved to a host outside the allow-list.
    #[error("Host not allowed: {host}")]
    Forbidden { host: String },

    /// The module specifier could not be turned into a URL.
    #[error("Invalid module specifier: {0}")]
    InvalidSpecifier(String),

    /// The module host answered with a non-2xx status.
    #[error("Failed to fetch module from {url}: {status} {status_text}")]
    Fetch {
        url: String,
        status: u16,
        status_text: String,
    },

    /// DNS, connect, TLS, timeout or body read failures.
    #[error("Failed to fetch module: {0}")]
    Network(String),

    /// The module exceeds the configured size ceiling.
    #[error("Module size exceeds limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// The module was served with a content type that is not script or data.
    #[error("Unsupported content type: {content_type}")]
    UnsupportedMediaType { content_type: String },

    /// Module evaluation did not finish within the inner timeout.
    #[error("Module evaluation timed out after {timeout_ms}ms")]
    EvaluationTimeout { timeout_ms: u64 },

    /// Module evaluation threw.
    #[error("Failed to evaluate module: {0}")]
    ModuleEvaluation(String),

    /// The handler did not settle within the request budget.
    #[error("Execution timed out exceeded {timeout_secs} seconds")]
    ExecutionTimeout { timeout_secs: f64 },

    /// The handler threw, rejected or could not be run.
    #[error("{0}")]
    Handler(String),

    /// The isolate approached its heap limit and was terminated.
    #[error("Execution exceeded the memory limit of {limit} bytes")]
    MemoryLimit { limit: usize },

    /// Too many sandboxes are running at once.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit { max: usize },

    /// Configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// Anything else going wrong on the host side.
    #[error("sandbox runtime failure: {0}")]
    Runtime(#[from] anyhow::Error),
}

impl SandboxError {
    /// HTTP-like status code for the transport layer wrapping this crate.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::InvalidSpecifier(_) | Self::Handler(_) => 400,
            Self::Forbidden { .. } => 403,
            Self::Fetch { status, .. } => *status,
            Self::PayloadTooLarge { .. } => 413,
            Self::UnsupportedMediaType { .. } => 415,
            Self::ExecutionTimeout { .. } => 408,
            Self::ConcurrencyLimit { .. } => 503,
            Self::Network(_)
            | Self::EvaluationTimeout { .. }
            | Self::ModuleEvaluation(_)
            | Self::MemoryLimit { .. }
            | Self::Config(_)
            | Self::Runtime(_) => 500,
        }
    }

    /// `true` when the caller's code or input is at fault ("fix your code"),
    /// `false` when the platform failed.
    pub fn is_user_fault(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_split_user_and_platform_faults() {
        assert_eq!(SandboxError::Validation("x".into()).status_code(), 400);
        assert_eq!(
            SandboxError::Forbidden {
                host: "evil.com".into()
            }
            .status_code(),
            403
        );
        assert_eq!(SandboxError::PayloadTooLarge { limit: 1 }.status_code(), 413);
        assert_eq!(
            SandboxError::ExecutionTimeout { timeout_secs: 1.0 }.status_code(),
            408
        );
        assert!(SandboxError::Handler("boom".into()).is_user_fault());
        assert!(!SandboxError::Network("reset".into()).is_user_fault());
        assert!(!SandboxError::ConcurrencyLimit { max: 1 }.is_user_fault());
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(
            SandboxError::ExecutionTimeout { timeout_secs: 60.0 }.to_string(),
            "Execution timed out exceeded 60 seconds"
        );
        assert_eq!(
            SandboxError::ExecutionTimeout { timeout_secs: 0.5 }.to_string(),
            "Execution timed out exceeded 0.5 seconds"
        );
    }

    #[test]
    fn test_fetch_error_carries_upstream_status() {
        let err = SandboxError::Fetch {
            url: "https://unpkg.com/nope".into(),
            status: 404,
            status_text: "Not Found".into(),
        };
        assert_eq!(err.status_code(), 404);
        assert!(err.to_string().contains("404 Not Found"));
    }
}

//! Execution outputs and results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of observable effect from an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SandboxOutput {
    Log { message: String },
    Error { message: String },
    Output { value: Value },
    Metric { metric: String, value: u64 },
}

impl SandboxOutput {
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Bounds on what one execution may write to its [`OutputLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLimits {
    pub max_entries: usize,
    /// Sum of message lengths.
    pub max_bytes: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_bytes: 1024 * 1024,
        }
    }
}

/// Append-only output list owned by a single execution.
///
/// Lives in the isolate's `OpState` while the handler runs and is moved into
/// the [`ExecutionResult`] afterwards. Once either limit is reached, further
/// entries are dropped and a single truncation error is appended instead.
#[derive(Debug, Default)]
pub struct OutputLog {
    entries: Vec<SandboxOutput>,
    bytes: usize,
    limits: OutputLimits,
    truncated: bool,
}

impl OutputLog {
    pub fn with_limits(limits: OutputLimits) -> Self {
        Self {
            limits,
            ..Default::default()
        }
    }

    pub fn push(&mut self, output: SandboxOutput) {
        if self.truncated {
            return;
        }
        let size = match &output {
            SandboxOutput::Log { message } | SandboxOutput::Error { message } => message.len(),
            _ => 0,
        };
        if self.entries.len() >= self.limits.max_entries || self.bytes + size > self.limits.max_bytes {
            self.truncated = true;
            self.entries.push(SandboxOutput::error(format!(
                "Output truncated: limit of {} entries or {} bytes reached",
                self.limits.max_entries, self.limits.max_bytes
            )));
            return;
        }
        self.bytes += size;
        self.entries.push(output);
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.push(SandboxOutput::log(message));
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(SandboxOutput::error(message));
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_inner(self) -> Vec<SandboxOutput> {
        self.entries
    }
}

/// Number of `importModule` and `fetch` calls made by one execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApiCallCount(pub u64);

/// Lifecycle of one execution.
///
/// `Building → Running → {Completed | Failed | TimedOut}`; a Building-phase
/// rejection goes straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Building,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Resource usage of one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub execution_time_ms: u64,
    pub api_call_count: u64,
    pub memory_used_bytes: u64,
}

impl ExecutionMetrics {
    /// Flatten into `metric` outputs for transports that want a single list.
    pub fn to_outputs(&self) -> Vec<SandboxOutput> {
        [
            ("executionTime", self.execution_time_ms),
            ("memoryUsed", self.memory_used_bytes),
            ("apiCallCount", self.api_call_count),
        ]
        .into_iter()
        .map(|(metric, value)| SandboxOutput::Metric {
            metric: metric.to_string(),
            value,
        })
        .collect()
    }
}

/// Final, immutable outcome of one execution.
///
/// Serializes to `{"outputs": [...], "result": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    #[serde(skip)]
    pub status: ExecutionState,
    pub outputs: Vec<SandboxOutput>,
    /// The handler's return value, `null` unless the state is `Completed`.
    pub result: Value,
    #[serde(skip)]
    pub metrics: ExecutionMetrics,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionState::Completed
    }

    /// Messages of every `error` output, in emission order.
    pub fn errors(&self) -> Vec<String> {
        self.outputs
            .iter()
            .filter_map(|o| match o {
                SandboxOutput::Error { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

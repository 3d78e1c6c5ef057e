//! Analytics hand-off.
//!
//! After every execution the executor fires an [`ExecutionReport`] at the
//! configured [`AnalyticsSink`] without waiting for it. Sinks never see
//! source code, arguments or secrets.

use crate::output::{ExecutionMetrics, ExecutionState};
use async_trait::async_trait;
use serde::Serialize;

/// Summary of one finished execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub operation_id: String,
    pub status: ExecutionState,
    pub metrics: ExecutionMetrics,
    /// Messages of the `error` outputs, already sanitized.
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Receives execution reports, fire-and-forget.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record(&self, report: ExecutionReport);
}

/// Sink that emits reports as `tracing` events.
pub struct TracingAnalyticsSink;

#[async_trait]
impl AnalyticsSink for TracingAnalyticsSink {
    async fn record(&self, report: ExecutionReport) {
        tracing::info!(
            analytics = true,
            operation_id = %report.operation_id,
            status = report.status.as_str(),
            duration_ms = report.duration_ms,
            api_call_count = report.metrics.api_call_count,
            memory_used_bytes = report.metrics.memory_used_bytes,
            errors = report.errors.len(),
            "execution report"
        );
    }
}

/// Sink that drops every report.
pub struct NoopAnalyticsSink;

#[async_trait]
impl AnalyticsSink for NoopAnalyticsSink {
    async fn record(&self, _report: ExecutionReport) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_json_uses_camel_case() {
        let report = ExecutionReport {
            operation_id: "op-1".into(),
            status: ExecutionState::Completed,
            metrics: ExecutionMetrics {
                execution_time_ms: 5,
                api_call_count: 1,
                memory_used_bytes: 0,
            },
            errors: vec![],
            duration_ms: 7,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["operationId"], "op-1");
        assert_eq!(value["durationMs"], 7);
        assert_eq!(value["metrics"]["apiCallCount"], 1);
        assert_eq!(value["status"], "completed");
    }

    #[tokio::test]
    async fn test_builtin_sinks_accept_reports() {
        let report = ExecutionReport {
            operation_id: "op-2".into(),
            status: ExecutionState::Failed,
            metrics: ExecutionMetrics::default(),
            errors: vec!["boom".into()],
            duration_ms: 1,
        };
        TracingAnalyticsSink.record(report.clone()).await;
        NoopAnalyticsSink.record(report).await;
    }
}

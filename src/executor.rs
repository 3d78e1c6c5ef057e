//! Sandbox executor - the public entry point.
//!
//! One [`SandboxExecutor`] owns the durable module tier, the module fetcher,
//! the concurrency gate and the analytics sink. Every call to
//! [`SandboxExecutor::execute`] builds its context, then runs the handler in a
//! brand-new isolate on a dedicated thread.

use crate::analytics::{AnalyticsSink, ExecutionReport, TracingAnalyticsSink};
use crate::cache::{MemoryModuleStore, ModuleStore};
use crate::config::SandboxConfig;
use crate::context::{build_context, ExecutionRequest};
use crate::error::SandboxError;
use crate::fetcher::{HttpModuleFetcher, ModuleFetcher};
use crate::importer::ModuleImporter;
use crate::output::{ExecutionMetrics, ExecutionResult, ExecutionState};
use crate::runtime::{run_in_isolate, IsolateJob};
use anyhow::anyhow;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Semaphore};

pub struct SandboxExecutor {
    config: SandboxConfig,
    importer: Arc<ModuleImporter>,
    semaphore: Arc<Semaphore>,
    analytics: Arc<dyn AnalyticsSink>,
}

impl SandboxExecutor {
    /// Executor with the HTTP fetcher and an in-process durable tier.
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let fetcher = HttpModuleFetcher::new(config.max_module_size, config.module_fetch_timeout())?;
        let store = MemoryModuleStore::new(config.module_cache_ttl());
        Ok(Self::with_components(config, Arc::new(store), Arc::new(fetcher)))
    }

    /// Executor over caller-provided module store and fetcher.
    pub fn with_components(
        config: SandboxConfig,
        store: Arc<dyn ModuleStore>,
        fetcher: Arc<dyn ModuleFetcher>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            importer: Arc::new(ModuleImporter::new(store, fetcher)),
            semaphore,
            analytics: Arc::new(TracingAnalyticsSink),
        }
    }

    pub fn with_analytics(mut self, sink: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = sink;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `request.code` and invoke its `handler(ctx)`.
    ///
    /// Returns `Err` only when the request is rejected before any code runs
    /// (validation, concurrency limit) or the platform fails. Failures of the
    /// user's code come back as an `Ok` result with `error` outputs.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let _permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }
        })?;

        let operation_id = request
            .operation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let started = Instant::now();
        tracing::debug!(%operation_id, state = ExecutionState::Building.as_str(), "building context");

        let context_json = match build_context(&request).and_then(|ctx| ctx.to_json()) {
            Ok(json) => json,
            Err(e) => {
                tracing::debug!(%operation_id, error = %e, "request rejected before running");
                self.report(ExecutionReport {
                    operation_id,
                    status: ExecutionState::Failed,
                    metrics: ExecutionMetrics::default(),
                    errors: vec![e.to_string()],
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                return Err(e);
            }
        };

        let job = IsolateJob {
            code: request.code,
            context_json,
            timeout: request.timeout.unwrap_or(self.config.execution_timeout()),
            module_eval_timeout: self.config.module_eval_timeout(),
            max_heap_size: self.config.max_heap_size,
            output_limits: self.config.output_limits(),
            fetch: self.config.fetch_config(),
            importer: self.importer.clone(),
        };

        let result = spawn_isolate(job).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            %operation_id,
            status = result.status.as_str(),
            duration_ms,
            outputs = result.outputs.len(),
            "execution finished"
        );

        self.report(ExecutionReport {
            operation_id,
            status: result.status,
            metrics: result.metrics,
            errors: result.errors(),
            duration_ms,
        });

        Ok(result)
    }

    fn report(&self, report: ExecutionReport) {
        let sink = self.analytics.clone();
        tokio::spawn(async move { sink.record(report).await });
    }
}

/// Run `job` on its own thread; V8 isolates are `!Send`.
async fn spawn_isolate(job: IsolateJob) -> Result<ExecutionResult, SandboxError> {
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("function-sandbox-isolate".into())
        .spawn(move || {
            let result = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt.block_on(run_in_isolate(job)),
                Err(e) => Err(SandboxError::Runtime(e.into())),
            };
            if tx.send(result).is_err() {
                tracing::warn!("sandbox result receiver dropped before result was sent");
            }
        })
        .map_err(|e| SandboxError::Runtime(anyhow!("failed to spawn sandbox thread: {e}")))?;

    rx.await
        .map_err(|_| SandboxError::Runtime(anyhow!("sandbox thread panicked")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ArgumentSpec;
    use crate::context::ArgumentType;
    use crate::importer::tests::FakeFetcher;
    use std::time::Duration;

    fn executor(config: SandboxConfig) -> SandboxExecutor {
        SandboxExecutor::with_components(
            config,
            Arc::new(MemoryModuleStore::new(Duration::from_secs(60))),
            Arc::new(FakeFetcher::default()),
        )
    }

    #[tokio::test]
    async fn test_saturated_executor_fails_fast() {
        let executor = executor(SandboxConfig {
            max_concurrent: 0,
            ..Default::default()
        });
        let err = executor
            .execute(ExecutionRequest::new("function handler() { return 1; }"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ConcurrencyLimit { max: 0 }));
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn test_missing_argument_is_rejected_before_running() {
        let executor = executor(SandboxConfig::default());
        let request = ExecutionRequest::new("function handler() { console.log('ran'); }")
            .declare(ArgumentSpec::new("city", ArgumentType::String).required());

        let err = executor.execute(request).await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
        assert_eq!(err.to_string(), "Missing required argument: city");
    }

    #[tokio::test]
    async fn test_request_timeout_overrides_config() {
        let executor = executor(SandboxConfig::default());
        let request = ExecutionRequest::new("function handler() { while (true) {} }")
            .timeout(Duration::from_millis(200));

        let started = Instant::now();
        let result = executor.execute(request).await.unwrap();
        assert_eq!(result.status, ExecutionState::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            result.errors(),
            vec!["Execution timed out exceeded 0.2 seconds".to_string()]
        );
    }
}

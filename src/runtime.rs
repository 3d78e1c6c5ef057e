//! Sandbox runtime - runs one handler invocation in a fresh V8 isolate.
//!
//! The isolate only gets this crate's extension:
//! - console.log/info/debug/warn/error (captured as outputs, never printed)
//! - setTimeout/clearTimeout
//! - atob, btoa, crypto.randomUUID, crypto.getRandomValues, crypto.subtle.digest
//! - Buffer and URLSearchParams
//! - fetch() behind an origin policy
//! - utils.date.parseDate/parseStartAndEnd
//! - importModule/require for allow-listed module hosts
//! - No fs, env, process or dynamic `import()`
//!
//! Everything in here is `!Send`; callers run it on a dedicated thread.

use crate::error::SandboxError;
use crate::evaluator::EvaluationLimits;
use crate::fetch::FetchConfig;
use crate::importer::{ModuleImporter, StagedModules};
use crate::ops::{function_sandbox, HandlerOutcome, HandlerSettlement};
use crate::output::{
    ApiCallCount, ExecutionMetrics, ExecutionResult, ExecutionState, OutputLimits, OutputLog,
    SandboxOutput,
};
use crate::sanitize::sanitize_message;
use deno_core::error::JsError;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const BOOTSTRAP_JS: &str = include_str!("bootstrap.js");

/// Grace granted past the heap limit so termination can unwind.
const HEAP_GRACE_BYTES: usize = 1024 * 1024;

/// Terminates the isolate if not stopped within `timeout`.
pub(crate) struct Watchdog {
    cancel: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl Watchdog {
    /// `fired` is set before the isolate is terminated.
    pub(crate) fn start(handle: v8::IsolateHandle, timeout: Duration, fired: Arc<AtomicBool>) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                fired.store(true, Ordering::SeqCst);
                handle.terminate_execution();
            }
        });
        Self { cancel, thread }
    }

    /// Stop and join, so the isolate handle is not used after this returns.
    pub(crate) fn stop(self) {
        let _ = self.cancel.send(());
        let _ = self.thread.join();
    }
}

/// Everything one isolate needs to run a handler.
pub(crate) struct IsolateJob {
    pub code: String,
    /// The serialized `ctx` object.
    pub context_json: String,
    pub timeout: Duration,
    pub module_eval_timeout: Duration,
    pub max_heap_size: usize,
    pub output_limits: OutputLimits,
    pub fetch: FetchConfig,
    pub importer: Arc<ModuleImporter>,
}

/// Create a sandboxed JS runtime with per-execution state in place.
pub(crate) fn create_runtime(job: &IsolateJob, outer_terminated: Arc<AtomicBool>) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, job.max_heap_size);

    let runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![function_sandbox::init_ops()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(OutputLog::with_limits(job.output_limits));
        state.put(ApiCallCount::default());
        state.put(StagedModules::default());
        state.put(HandlerSettlement::default());
        state.put(job.fetch.clone());
        state.put(job.importer.clone());
        state.put(EvaluationLimits {
            timeout: job.module_eval_timeout,
            outer_terminated,
        });
    }

    runtime
}

fn used_heap_size(runtime: &mut JsRuntime) -> u64 {
    let mut stats = v8::HeapStatistics::default();
    runtime.v8_isolate().get_heap_statistics(&mut stats);
    stats.used_heap_size() as u64
}

/// Message of a script or event loop failure, without the `Uncaught` noise.
fn js_error_message(error: &anyhow::Error) -> String {
    let raw = match error.downcast_ref::<JsError>() {
        Some(js_error) => js_error.exception_message.clone(),
        None => error.to_string(),
    };
    sanitize_message(&raw)
}

/// Why the isolate stopped before the event loop drained, if it did.
#[derive(Debug, Default, Clone, Copy)]
struct Stops {
    heap_exceeded: bool,
    watchdog_fired: bool,
    async_timed_out: bool,
}

/// Decide the final state and append the closing outputs.
///
/// A settled handler wins over a watchdog that fired after settlement; the
/// script or loop error seen then is only the termination unwinding.
fn conclude(
    outputs: &mut Vec<SandboxOutput>,
    stops: Stops,
    run_error: Option<anyhow::Error>,
    settled: Option<HandlerOutcome>,
    timeout: Duration,
    max_heap_size: usize,
) -> (ExecutionState, Value) {
    if stops.heap_exceeded {
        outputs.push(SandboxOutput::error(
            SandboxError::MemoryLimit {
                limit: max_heap_size,
            }
            .to_string(),
        ));
        return (ExecutionState::Failed, Value::Null);
    }

    let Some(settled) = settled else {
        if stops.watchdog_fired || stops.async_timed_out {
            outputs.push(SandboxOutput::error(
                SandboxError::ExecutionTimeout {
                    timeout_secs: timeout.as_secs_f64(),
                }
                .to_string(),
            ));
            return (ExecutionState::TimedOut, Value::Null);
        }
        let message = match run_error {
            Some(error) => js_error_message(&error),
            None => "Handler did not settle: its promise can never resolve".to_string(),
        };
        outputs.push(SandboxOutput::error(message));
        return (ExecutionState::Failed, Value::Null);
    };

    if let Some(error) = run_error.filter(|_| !stops.watchdog_fired) {
        outputs.push(SandboxOutput::error(js_error_message(&error)));
        return (ExecutionState::Failed, Value::Null);
    }

    match settled {
        HandlerOutcome::Returned(json) => match serde_json::from_str::<Value>(&json) {
            Ok(value) => {
                outputs.push(SandboxOutput::Output {
                    value: value.clone(),
                });
                (ExecutionState::Completed, value)
            }
            Err(e) => {
                outputs.push(SandboxOutput::error(format!(
                    "Handler returned a value that is not JSON: {e}"
                )));
                (ExecutionState::Failed, Value::Null)
            }
        },
        HandlerOutcome::Threw { message, reported } => {
            if !reported {
                outputs.push(SandboxOutput::error(sanitize_message(&message)));
            }
            (ExecutionState::Failed, Value::Null)
        }
    }
}

/// Run `job.code` and invoke its `handler(ctx)`.
///
/// Failures inside the isolate come back as an `Ok` result carrying error
/// outputs; `Err` means the runtime itself could not be set up.
pub(crate) async fn run_in_isolate(job: IsolateJob) -> Result<ExecutionResult, SandboxError> {
    let outer_terminated = Arc::new(AtomicBool::new(false));
    let mut runtime = create_runtime(&job, outer_terminated.clone());

    let heap_exceeded = Arc::new(AtomicBool::new(false));
    {
        let heap_flag = heap_exceeded.clone();
        let handle = runtime.v8_isolate().thread_safe_handle();
        runtime.add_near_heap_limit_callback(move |current, _initial| {
            if !heap_flag.swap(true, Ordering::SeqCst) {
                handle.terminate_execution();
            }
            current + HEAP_GRACE_BYTES
        });
    }

    runtime
        .execute_script("[function-sandbox:bootstrap]", BOOTSTRAP_JS)
        .map_err(|e| SandboxError::Runtime(e.context("failed to bootstrap sandbox")))?;

    let notify: Arc<Notify> = runtime
        .op_state()
        .borrow()
        .borrow::<HandlerSettlement>()
        .notify
        .clone();

    let heap_before = used_heap_size(&mut runtime);
    let started = Instant::now();
    tracing::debug!(state = ExecutionState::Running.as_str(), "handler starting");

    let watchdog = Watchdog::start(
        runtime.v8_isolate().thread_safe_handle(),
        job.timeout,
        outer_terminated.clone(),
    );

    let script_error = match runtime.execute_script("handler.js", job.code) {
        Ok(_) => {
            let invoke = format!(
                "__sandbox_internal_run__(typeof handler === \"function\" ? handler : undefined, {})",
                job.context_json
            );
            runtime.execute_script("[function-sandbox:run]", invoke).err()
        }
        Err(e) => Some(e),
    };

    let mut async_timed_out = false;
    let loop_error = if script_error.is_none() {
        let drive = async {
            tokio::select! {
                result = runtime.run_event_loop(PollEventLoopOptions::default()) => result.err(),
                _ = notify.notified() => None,
            }
        };
        match tokio::time::timeout(job.timeout, drive).await {
            Ok(error) => error,
            Err(_) => {
                async_timed_out = true;
                None
            }
        }
    } else {
        None
    };

    watchdog.stop();
    let execution_time_ms = started.elapsed().as_millis() as u64;
    let memory_used_bytes = used_heap_size(&mut runtime).saturating_sub(heap_before);

    let op_state = runtime.op_state();
    let mut state = op_state.borrow_mut();
    let mut outputs = state.take::<OutputLog>().into_inner();
    let api_call_count = state.take::<ApiCallCount>().0;
    let settled = state.take::<HandlerSettlement>().outcome;
    drop(state);

    let stops = Stops {
        heap_exceeded: heap_exceeded.load(Ordering::SeqCst),
        watchdog_fired: outer_terminated.load(Ordering::SeqCst),
        async_timed_out,
    };
    let (status, result) = conclude(
        &mut outputs,
        stops,
        script_error.or(loop_error),
        settled,
        job.timeout,
        job.max_heap_size,
    );

    tracing::debug!(
        state = status.as_str(),
        execution_time_ms,
        api_call_count,
        "handler finished"
    );

    Ok(ExecutionResult {
        status,
        outputs,
        result,
        metrics: ExecutionMetrics {
            execution_time_ms,
            api_call_count,
            memory_used_bytes,
        },
    })
}

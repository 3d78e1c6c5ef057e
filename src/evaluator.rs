//! Module evaluator.
//!
//! Runs module source inside a fresh V8 context of the current isolate,
//! wrapped CommonJS style:
//!
//! ```js
//! (function (module, exports, require) {
//!   <source>
//! })
//! ```
//!
//! The new context has its own global object carrying only `console`,
//! `Buffer`, `URLSearchParams`, `setTimeout`, `clearTimeout`, a frozen empty
//! `process.env` and empty `__dirname`/`__filename`. Evaluation is bounded by its own watchdog,
//! independent of the outer execution timeout.

use crate::error::SandboxError;
use crate::importer::{report_import_error, StagedModules};
use crate::runtime::Watchdog;
use anyhow::anyhow;
use deno_core::{op2, v8, OpState};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WRAPPER_PREFIX: &str = "(function (module, exports, require) {\n";
const WRAPPER_SUFFIX: &str = "\n})";

/// Globals copied from the host object handed in by the bootstrap.
const HOST_GLOBALS: &[&str] = &[
    "console",
    "Buffer",
    "URLSearchParams",
    "setTimeout",
    "clearTimeout",
];

/// Evaluation bounds of one execution, kept in `OpState`.
#[derive(Debug, Clone)]
pub struct EvaluationLimits {
    pub timeout: Duration,
    /// Set by the outer watchdog. Once set, termination is never cancelled.
    pub outer_terminated: Arc<AtomicBool>,
}

#[op2(reentrant)]
pub fn op_import_evaluate<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: Rc<RefCell<OpState>>,
    #[string] cache_key: String,
    require: v8::Local<'s, v8::Function>,
    host: v8::Local<'s, v8::Object>,
) -> Result<v8::Local<'s, v8::Value>, deno_core::error::AnyError> {
    // OpState borrows must end before any JS runs.
    let source = state
        .borrow()
        .borrow::<StagedModules>()
        .0
        .get(&cache_key)
        .map(|staged| staged.module.source.clone());
    let Some(source) = source else {
        return Err(report_import_error(&state, "module was not resolved before evaluation"));
    };
    let limits = state.borrow().borrow::<EvaluationLimits>().clone();

    match evaluate_module(scope, &source, require, host, &limits) {
        Ok(exports) => {
            if let Some(staged) = state
                .borrow_mut()
                .borrow_mut::<StagedModules>()
                .0
                .get_mut(&cache_key)
            {
                staged.evaluated = true;
            }
            Ok(exports)
        }
        Err(_) if limits.outer_terminated.load(Ordering::SeqCst) => {
            Err(anyhow!("execution terminated"))
        }
        Err(e) => Err(report_import_error(&state, &e.to_string())),
    }
}

/// Evaluate `source` and return its `module.exports`.
pub fn evaluate_module<'s>(
    scope: &mut v8::HandleScope<'s>,
    source: &str,
    require: v8::Local<'s, v8::Function>,
    host: v8::Local<'s, v8::Object>,
    limits: &EvaluationLimits,
) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
    let wrapped = format!("{WRAPPER_PREFIX}{source}{WRAPPER_SUFFIX}");
    let code = v8::String::new(scope, &wrapped)
        .ok_or_else(|| SandboxError::ModuleEvaluation("module source too large".into()))?;

    let context = v8::Context::new(scope, Default::default());
    let fired = Arc::new(AtomicBool::new(false));
    let watchdog = Watchdog::start(scope.thread_safe_handle(), limits.timeout, fired.clone());

    let outcome = {
        let scope = &mut v8::ContextScope::new(scope, context);
        let tc = &mut v8::TryCatch::new(scope);
        let outcome = run_wrapped(tc, context, code, require, host);
        watchdog.stop();
        // Cancel while the TryCatch still holds the termination.
        if fired.load(Ordering::SeqCst) && !limits.outer_terminated.load(Ordering::SeqCst) {
            tc.cancel_terminate_execution();
        }
        outcome
    };

    if fired.load(Ordering::SeqCst) {
        return Err(SandboxError::EvaluationTimeout {
            timeout_ms: limits.timeout.as_millis() as u64,
        });
    }

    outcome.map_err(SandboxError::ModuleEvaluation)
}

fn run_wrapped<'s>(
    scope: &mut v8::TryCatch<v8::HandleScope<'s>>,
    context: v8::Local<'s, v8::Context>,
    code: v8::Local<'s, v8::String>,
    require: v8::Local<'s, v8::Function>,
    host: v8::Local<'s, v8::Object>,
) -> Result<v8::Local<'s, v8::Value>, String> {
    install_globals(scope, context, host).ok_or_else(|| exception_message(scope))?;

    let script = v8::Script::compile(scope, code, None).ok_or_else(|| exception_message(scope))?;
    let wrapper = script.run(scope).ok_or_else(|| exception_message(scope))?;
    let wrapper = v8::Local::<v8::Function>::try_from(wrapper)
        .map_err(|_| "module wrapper did not evaluate to a function".to_string())?;

    let module = v8::Object::new(scope);
    let exports = v8::Object::new(scope);
    let exports_key = key(scope, "exports").ok_or_else(|| exception_message(scope))?;
    module
        .set(scope, exports_key, exports.into())
        .ok_or_else(|| exception_message(scope))?;

    let receiver = v8::undefined(scope).into();
    wrapper
        .call(scope, receiver, &[module.into(), exports.into(), require.into()])
        .ok_or_else(|| exception_message(scope))?;

    module
        .get(scope, exports_key)
        .ok_or_else(|| exception_message(scope))
}

fn install_globals<'s>(
    scope: &mut v8::HandleScope<'s>,
    context: v8::Local<'s, v8::Context>,
    host: v8::Local<'s, v8::Object>,
) -> Option<()> {
    let global = context.global(scope);

    for name in HOST_GLOBALS {
        let name = key(scope, name)?;
        let value = host.get(scope, name)?;
        if !value.is_undefined() {
            global.set(scope, name, value)?;
        }
    }

    let env = v8::Object::new(scope);
    env.set_integrity_level(scope, v8::IntegrityLevel::Frozen)?;
    let process = v8::Object::new(scope);
    let env_key = key(scope, "env")?;
    process.set(scope, env_key, env.into())?;
    let process_key = key(scope, "process")?;
    global.set(scope, process_key, process.into())?;

    let empty = v8::String::empty(scope);
    for name in ["__dirname", "__filename"] {
        let name = key(scope, name)?;
        global.set(scope, name, empty.into())?;
    }

    Some(())
}

fn key<'s>(scope: &mut v8::HandleScope<'s>, name: &str) -> Option<v8::Local<'s, v8::Value>> {
    v8::String::new(scope, name).map(Into::into)
}

/// Message of the pending exception, preferring `error.message`.
fn exception_message(scope: &mut v8::TryCatch<v8::HandleScope>) -> String {
    if scope.has_terminated() {
        return "execution terminated".to_string();
    }
    let Some(exception) = scope.exception() else {
        return "unknown error".to_string();
    };
    if let Ok(object) = v8::Local::<v8::Object>::try_from(exception) {
        if let Some(message_key) = v8::String::new(scope, "message") {
            if let Some(message) = object.get(scope, message_key.into()) {
                if message.is_string() {
                    return message.to_rust_string_lossy(scope);
                }
            }
        }
    }
    exception.to_rust_string_lossy(scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::{ResolvedModule, StagedModule};
    use crate::output::{OutputLog, SandboxOutput};
    use deno_core::{JsRuntime, RuntimeOptions};

    fn runtime_with(cache_key: &str, source: &str, timeout: Duration) -> JsRuntime {
        let runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![crate::ops::function_sandbox::init_ops()],
            ..Default::default()
        });
        {
            let op_state = runtime.op_state();
            let mut state = op_state.borrow_mut();
            state.put(OutputLog::default());
            state.put(EvaluationLimits {
                timeout,
                outer_terminated: Arc::new(AtomicBool::new(false)),
            });
            let mut staged = StagedModules::default();
            staged.0.insert(
                cache_key.to_string(),
                StagedModule {
                    module: ResolvedModule {
                        specifier: "npm:test".into(),
                        cache_key: cache_key.to_string(),
                        source: source.into(),
                        fetched: true,
                    },
                    evaluated: false,
                },
            );
            state.put(staged);
        }
        runtime
    }

    fn eval_to_string(runtime: &mut JsRuntime, script: &'static str) -> String {
        let value = runtime.execute_script("<test>", script).unwrap();
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        local.to_rust_string_lossy(scope)
    }

    const CALL: &str = r#"
        (() => {
            try {
                const exports = Deno.core.ops.op_import_evaluate(
                    "module:k", () => {}, { console: { log() {} } });
                return JSON.stringify(exports);
            } catch (e) {
                return "threw: " + e.message;
            }
        })()
    "#;

    #[test]
    fn test_module_exports_are_returned() {
        let mut runtime = runtime_with(
            "module:k",
            "module.exports = { pad: (s) => '  ' + s, env: Object.keys(process.env).length };",
            Duration::from_secs(3),
        );
        assert_eq!(eval_to_string(&mut runtime, CALL), r#"{"env":0}"#);

        let state = runtime.op_state();
        let state = state.borrow();
        assert!(state.borrow::<StagedModules>().0["module:k"].evaluated);
    }

    #[test]
    fn test_exports_shorthand_and_isolated_globals() {
        let mut runtime = runtime_with(
            "module:k",
            "exports.sameGlobal = typeof globalThis.Deno === 'undefined'; exports.hasConsole = typeof console === 'object';",
            Duration::from_secs(3),
        );
        assert_eq!(
            eval_to_string(&mut runtime, CALL),
            r#"{"sameGlobal":true,"hasConsole":true}"#
        );
    }

    #[test]
    fn test_host_buffer_is_visible_to_module() {
        let mut runtime = runtime_with(
            "module:k",
            "module.exports = { encoded: Buffer.from('a').toString('base64'), query: typeof URLSearchParams };",
            Duration::from_secs(3),
        );
        let call = r#"
            (() => {
                const Buffer = { from: (s) => ({ toString: (enc) => enc + ":" + s }) };
                const exports = Deno.core.ops.op_import_evaluate(
                    "module:k", () => {}, { Buffer, URLSearchParams: class {} });
                return JSON.stringify(exports);
            })()
        "#;
        assert_eq!(
            eval_to_string(&mut runtime, call),
            r#"{"encoded":"base64:a","query":"function"}"#
        );
    }

    #[test]
    fn test_throwing_module_reports_import_error() {
        let mut runtime = runtime_with("module:k", "throw new Error('bad module');", Duration::from_secs(3));
        assert_eq!(
            eval_to_string(&mut runtime, CALL),
            "threw: Import error: Failed to evaluate module: bad module"
        );

        let state = runtime.op_state();
        let state = state.borrow();
        let outputs = state.borrow::<OutputLog>();
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn test_hanging_module_times_out_and_isolate_survives() {
        let mut runtime = runtime_with("module:k", "while (true) {}", Duration::from_millis(100));
        assert_eq!(
            eval_to_string(&mut runtime, CALL),
            "threw: Import error: Module evaluation timed out after 100ms"
        );
        // Termination was cancelled, so the isolate keeps running scripts.
        assert_eq!(eval_to_string(&mut runtime, "'still alive'"), "still alive");

        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        let outputs = state.take::<OutputLog>().into_inner();
        assert_eq!(
            outputs,
            vec![SandboxOutput::error(
                "Import error: Module evaluation timed out after 100ms"
            )]
        );
    }

    #[test]
    fn test_unstaged_module_is_an_error() {
        let mut runtime = runtime_with("module:other", "", Duration::from_secs(3));
        assert!(eval_to_string(&mut runtime, CALL).starts_with("threw: Import error:"));
    }
}

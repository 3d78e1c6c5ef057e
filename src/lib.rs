//! # Function Sandbox
//!
//! Runs user-authored JavaScript functions in isolation using deno_core.
//! User code defines `handler(ctx)`; the sandbox calls it with validated
//! arguments, secrets and the caller's profile, and collects every
//! `console.*` call, error and the return value into an [`ExecutionResult`].
//!
//! ## Security Guarantees
//!
//! - **Fresh isolate per request**: no globals, outputs or module exports
//!   survive between executions
//! - **No filesystem, env or process access**: only this crate's ops exist
//! - **Bounded time and memory**: wall-clock timeout plus a V8 heap limit,
//!   with capped console output and `fetch()` bodies on the host side
//! - **Allow-listed imports**: `importModule`/`require` only reach a fixed set
//!   of module CDNs; imported modules run in their own V8 context with a
//!   short evaluation timeout
//! - **Origin-checked fetch**: no loopback or private network targets, even
//!   behind a DNS name
//!
//! ## Usage
//!
//! ```rust,ignore
//! use function_sandbox::{ExecutionRequest, SandboxConfig, SandboxExecutor};
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor = SandboxExecutor::new(SandboxConfig::default()).unwrap();
//!     let request = ExecutionRequest::new(
//!         r#"async function handler(ctx) {
//!             const pad = await importModule("npm:left-pad");
//!             return pad(ctx.args.name, 10);
//!         }"#,
//!     )
//!     .arg("name", "World");
//!
//!     let result = executor.execute(request).await.unwrap();
//!     println!("{}", serde_json::to_string(&result).unwrap());
//! }
//! ```

mod analytics;
mod cache;
mod config;
mod context;
mod dates;
mod error;
mod evaluator;
mod executor;
mod fetch;
mod fetcher;
mod importer;
mod ops;
mod output;
mod runtime;
mod sanitize;
mod specifier;

pub use analytics::{AnalyticsSink, ExecutionReport, NoopAnalyticsSink, TracingAnalyticsSink};
pub use cache::{CachedModule, MemoryModuleStore, ModuleStore};
pub use config::SandboxConfig;
pub use context::{
    build_context, ArgumentSpec, ArgumentType, ArgumentValue, ExecutionRequest, OAuthCredential,
    SandboxContext, SecretSet, UserProfile,
};
pub use error::SandboxError;
pub use executor::SandboxExecutor;
pub use fetch::FetchConfig;
pub use fetcher::{HttpModuleFetcher, ModuleFetcher};
pub use output::{ExecutionMetrics, ExecutionResult, ExecutionState, OutputLimits, SandboxOutput};
pub use sanitize::sanitize_message;
pub use specifier::{cache_key, parse_module_specifier, ModuleSource, ModuleSpecifier, ALLOWED_HOSTS};

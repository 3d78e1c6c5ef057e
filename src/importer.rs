//! Import orchestrator.
//!
//! `importModule`/`require` inside the sandbox is a thin JS shim over the
//! ops in this module:
//!
//! 1. `op_import_begin` counts the call and logs memory-tier hits.
//! 2. `op_import_resolve` parses the specifier, consults the durable tier,
//!    falls back to the fetcher and stages the source in `OpState`.
//! 3. `op_import_evaluate` (see [`crate::evaluator`]) runs the staged source.
//! 4. `op_import_commit` writes fetched, successfully evaluated source to the
//!    durable tier and drops the staging entry.
//!
//! Source text never passes through JS on its way to the durable tier, so
//! user code cannot plant entries in the shared cache.

use crate::cache::{CachedModule, ModuleStore};
use crate::error::SandboxError;
use crate::fetcher::ModuleFetcher;
use crate::output::{ApiCallCount, OutputLog};
use crate::sanitize::sanitize_message;
use crate::specifier::parse_module_specifier;
use anyhow::anyhow;
use deno_core::{op2, OpState};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

/// Module source ready for evaluation.
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub specifier: String,
    pub cache_key: String,
    pub source: Arc<str>,
    /// `true` when the source came from the network rather than the durable tier.
    pub fetched: bool,
}

/// Durable tier plus fetcher, shared by every execution of one executor.
pub struct ModuleImporter {
    store: Arc<dyn ModuleStore>,
    fetcher: Arc<dyn ModuleFetcher>,
}

impl ModuleImporter {
    pub fn new(store: Arc<dyn ModuleStore>, fetcher: Arc<dyn ModuleFetcher>) -> Self {
        Self { store, fetcher }
    }

    /// Resolve `specifier` to source text, reporting the path taken through `log`.
    pub async fn load(
        &self,
        specifier: &str,
        log: &mut dyn FnMut(String),
    ) -> Result<ResolvedModule, SandboxError> {
        let parsed = parse_module_specifier(specifier)?;

        let cached = match self.store.get(&parsed.cache_key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(specifier, error = %e, "module cache read failed, treating as miss");
                None
            }
        };

        if let Some(module) = cached {
            log(format!("Loaded module from cache: {specifier}"));
            return Ok(ResolvedModule {
                specifier: specifier.to_string(),
                cache_key: parsed.cache_key,
                source: module.source_text,
                fetched: false,
            });
        }

        log(format!("Fetching module: {specifier}"));
        let started = Instant::now();
        let source = self.fetcher.fetch(&parsed.resolved_url).await?;
        let seconds = started.elapsed().as_millis() as f64 / 1000.0;
        log(format!("Module fetched in {seconds} seconds"));
        tracing::debug!(specifier, url = %parsed.resolved_url, seconds, "module fetched");

        Ok(ResolvedModule {
            specifier: specifier.to_string(),
            cache_key: parsed.cache_key,
            source: source.into(),
            fetched: true,
        })
    }

    /// Write a fetched module to the durable tier. Failures are only logged.
    pub async fn persist(&self, module: &ResolvedModule) {
        if !module.fetched {
            return;
        }
        let entry = CachedModule::new(module.cache_key.clone(), module.source.clone());
        if let Err(e) = self.store.put(entry).await {
            tracing::warn!(specifier = %module.specifier, error = %e, "module cache write failed");
        }
    }
}

/// A resolved module waiting for evaluation and commit.
#[derive(Debug)]
pub struct StagedModule {
    pub module: ResolvedModule,
    pub evaluated: bool,
}

/// Staging area of one execution, keyed by cache key.
#[derive(Debug, Default)]
pub struct StagedModules(pub HashMap<String, StagedModule>);

/// Push `Import error: ...` as an error output and build the matching JS error.
pub(crate) fn report_import_error(state: &RefCell<OpState>, message: &str) -> anyhow::Error {
    let message = format!("Import error: {}", sanitize_message(message));
    state.borrow_mut().borrow_mut::<OutputLog>().error(message.clone());
    anyhow!(message)
}

#[op2(fast)]
pub fn op_import_begin(state: &mut OpState, #[string] specifier: &str, memory_hit: bool) {
    state.borrow_mut::<ApiCallCount>().0 += 1;
    if memory_hit {
        state
            .borrow_mut::<OutputLog>()
            .log(format!("Loaded module from memory: {specifier}"));
    }
}

#[op2(async)]
#[string]
pub async fn op_import_resolve(
    state: Rc<RefCell<OpState>>,
    #[string] specifier: String,
) -> Result<String, deno_core::error::AnyError> {
    let importer = state.borrow().borrow::<Arc<ModuleImporter>>().clone();

    let mut log = |message: String| state.borrow_mut().borrow_mut::<OutputLog>().log(message);
    match importer.load(&specifier, &mut log).await {
        Ok(module) => {
            let cache_key = module.cache_key.clone();
            state.borrow_mut().borrow_mut::<StagedModules>().0.insert(
                cache_key.clone(),
                StagedModule {
                    module,
                    evaluated: false,
                },
            );
            Ok(cache_key)
        }
        Err(e) => Err(report_import_error(&state, &e.to_string())),
    }
}

#[op2(async)]
pub async fn op_import_commit(
    state: Rc<RefCell<OpState>>,
    #[string] cache_key: String,
) -> Result<(), deno_core::error::AnyError> {
    let staged = state.borrow_mut().borrow_mut::<StagedModules>().0.remove(&cache_key);
    let Some(staged) = staged else {
        return Ok(());
    };
    if staged.evaluated {
        let importer = state.borrow().borrow::<Arc<ModuleImporter>>().clone();
        importer.persist(&staged.module).await;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::MemoryModuleStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use url::Url;

    /// Serves fixed sources by URL and counts requests.
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        pub sources: Mutex<HashMap<String, String>>,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl ModuleFetcher for FakeFetcher {
        async fn fetch(&self, url: &Url) -> Result<String, SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sources
                .lock()
                .unwrap()
                .get(url.as_str())
                .cloned()
                .ok_or(SandboxError::Fetch {
                    url: url.to_string(),
                    status: 404,
                    status_text: "Not Found".into(),
                })
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl ModuleStore for BrokenStore {
        async fn get(&self, _cache_key: &str) -> anyhow::Result<Option<CachedModule>> {
            Err(anyhow!("store offline"))
        }

        async fn put(&self, _module: CachedModule) -> anyhow::Result<()> {
            Err(anyhow!("store offline"))
        }
    }

    fn fetcher_with(url: &str, body: &str) -> Arc<FakeFetcher> {
        let fetcher = FakeFetcher::default();
        fetcher
            .sources
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
        Arc::new(fetcher)
    }

    #[tokio::test]
    async fn test_cold_load_fetches_then_warm_load_hits_cache() {
        let store = Arc::new(MemoryModuleStore::new(Duration::from_secs(60)));
        let fetcher = fetcher_with("https://unpkg.com/left-pad", "module.exports = 1;");
        let importer = ModuleImporter::new(store.clone(), fetcher.clone());

        let mut lines = Vec::new();
        let cold = importer
            .load("npm:left-pad", &mut |m| lines.push(m))
            .await
            .unwrap();
        assert!(cold.fetched);
        assert_eq!(lines[0], "Fetching module: npm:left-pad");
        assert!(lines[1].starts_with("Module fetched in "));
        assert!(lines[1].ends_with(" seconds"));

        importer.persist(&cold).await;

        let mut lines = Vec::new();
        let warm = importer
            .load("npm:left-pad", &mut |m| lines.push(m))
            .await
            .unwrap();
        assert!(!warm.fetched);
        assert_eq!(lines, vec!["Loaded module from cache: npm:left-pad"]);
        assert_eq!(&*warm.source, "module.exports = 1;");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forbidden_host_never_reaches_fetcher() {
        let store = Arc::new(MemoryModuleStore::new(Duration::from_secs(60)));
        let fetcher = Arc::new(FakeFetcher::default());
        let importer = ModuleImporter::new(store, fetcher.clone());

        let mut lines = Vec::new();
        let err = importer
            .load("https://evil.com/x.js", &mut |m| lines.push(m))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Forbidden { .. }));
        assert!(lines.is_empty());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_failures_degrade_to_fetch() {
        let fetcher = fetcher_with("https://unpkg.com/ms", "module.exports = 2;");
        let importer = ModuleImporter::new(Arc::new(BrokenStore), fetcher.clone());

        let module = importer.load("npm:ms", &mut |_| {}).await.unwrap();
        assert!(module.fetched);
        // Best-effort write must not panic or error.
        importer.persist(&module).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_hits_are_not_rewritten() {
        let store = Arc::new(MemoryModuleStore::new(Duration::from_secs(60)));
        let fetcher = Arc::new(FakeFetcher::default());
        let importer = ModuleImporter::new(store.clone(), fetcher);

        let hit = ResolvedModule {
            specifier: "npm:x".into(),
            cache_key: "module:x".into(),
            source: "exports.a = 1;".into(),
            fetched: false,
        };
        importer.persist(&hit).await;
        assert!(store.get("module:x").await.unwrap().is_none());
    }
}

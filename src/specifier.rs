//! Module specifier parsing.
//!
//! Turns the free-form string user code hands to `importModule`/`require`
//! into a concrete, host-validated URL plus a deterministic cache key.
//! Nothing here touches the network.

use crate::error::SandboxError;
use sha2::{Digest, Sha256};
use url::Url;

/// Hosts modules may be fetched from. Fixed at compile time.
pub const ALLOWED_HOSTS: &[&str] = &[
    "unpkg.com",
    "cdn.jsdelivr.net",
    "fastly.jsdelivr.net",
    "esm.sh",
    "esm.run",
    "deno.land",
    "raw.githubusercontent.com",
    "cdn.skypack.dev",
    "ga.jspm.io",
    "jspm.dev",
];

const NPM_REGISTRY_CDN: &str = "https://unpkg.com/";
const DENO_REGISTRY: &str = "https://deno.land/x/";

/// Where a specifier points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSource {
    Npm,
    Deno,
    Url,
}

/// A classified, allow-listed module specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpecifier {
    pub source: ModuleSource,
    pub resolved_url: Url,
    /// Hash of the original specifier string, not of `resolved_url`.
    pub cache_key: String,
}

/// Returns `true` when `host` is one of [`ALLOWED_HOSTS`].
pub fn is_host_allowed(host: &str) -> bool {
    ALLOWED_HOSTS.contains(&host)
}

/// Stable durable-cache key for a specifier string.
pub fn cache_key(specifier: &str) -> String {
    format!("module:{:x}", Sha256::digest(specifier.as_bytes()))
}

/// Parse and validate a module specifier.
///
/// Resolution rules, in order:
/// - `npm:<rest>` resolves to `https://unpkg.com/<rest>`
/// - `deno:<rest>` is used verbatim when it is already an http(s) URL, otherwise
///   it resolves to `https://deno.land/x/<rest>`
/// - `http://` and `https://` URLs are used verbatim
/// - anything else is a bare package name and resolves like `npm:`
///
/// The resolved host must be in [`ALLOWED_HOSTS`].
pub fn parse_module_specifier(specifier: &str) -> Result<ModuleSpecifier, SandboxError> {
    let trimmed = specifier.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::InvalidSpecifier(specifier.to_string()));
    }

    let (source, target) = if let Some(rest) = trimmed.strip_prefix("npm:") {
        (ModuleSource::Npm, npm_url(rest, specifier)?)
    } else if let Some(rest) = trimmed.strip_prefix("deno:") {
        if rest.is_empty() {
            return Err(SandboxError::InvalidSpecifier(specifier.to_string()));
        }
        let target = if has_http_scheme(rest) {
            rest.to_string()
        } else {
            format!("{DENO_REGISTRY}{rest}")
        };
        (ModuleSource::Deno, target)
    } else if has_http_scheme(trimmed) {
        (ModuleSource::Url, trimmed.to_string())
    } else {
        (ModuleSource::Npm, npm_url(trimmed, specifier)?)
    };

    let resolved_url = Url::parse(&target)
        .map_err(|_| SandboxError::InvalidSpecifier(specifier.to_string()))?;

    if !matches!(resolved_url.scheme(), "http" | "https") {
        return Err(SandboxError::InvalidSpecifier(specifier.to_string()));
    }

    let host = resolved_url.host_str().unwrap_or_default();
    if !is_host_allowed(host) {
        return Err(SandboxError::Forbidden {
            host: host.to_string(),
        });
    }

    Ok(ModuleSpecifier {
        source,
        resolved_url,
        cache_key: cache_key(specifier),
    })
}

fn npm_url(path: &str, specifier: &str) -> Result<String, SandboxError> {
    if path.is_empty() {
        return Err(SandboxError::InvalidSpecifier(specifier.to_string()));
    }
    Ok(format!("{NPM_REGISTRY_CDN}{path}"))
}

fn has_http_scheme(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

//! Sanitize messages and names crossing the sandbox boundary.
//!
//! Error text coming out of V8 or the network stack can carry stack frames,
//! host file paths and internal module URLs. None of that may reach the
//! sandboxed code's outputs or the external caller.

use regex::Regex;
use std::sync::LazyLock;

/// Keys that could be used for prototype pollution
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Maximum length of a sanitized message
const MAX_MESSAGE_LEN: usize = 4096;

static STACK_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*at [^\n]*(?::\d+:\d+\)?|<anonymous>\)?)[ \t]*$\n?").expect("valid regex"));

static INTERNAL_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:file|ext|node):[^\s'`)]+").expect("valid regex"));

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(?:home|Users|etc|var|tmp|opt|usr|root|mnt|srv|proc|sys|dev|run)(?:/[\w.\-]+)+")
        .expect("valid regex")
});

/// Strip stack frames, internal URLs and host paths from an error message.
pub fn sanitize_message(message: &str) -> String {
    let message = message.trim();
    let message = message.strip_prefix("Uncaught ").unwrap_or(message);

    let without_frames = STACK_FRAME_RE.replace_all(message, "");
    let without_urls = INTERNAL_URL_RE.replace_all(&without_frames, "<internal>");
    let cleaned = UNIX_PATH_RE.replace_all(&without_urls, "<path>");

    let mut cleaned = cleaned.trim().to_string();
    if cleaned.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
    }
    if cleaned.is_empty() {
        cleaned.push_str("Unknown error");
    }
    cleaned
}

/// Returns an error message when `name` cannot be used as a context key.
pub fn check_key(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Context keys must not be empty".to_string());
    }
    if DANGEROUS_KEYS.contains(&name) {
        return Err(format!(
            "Prototype pollution attempt: '{}' key is forbidden",
            name
        ));
    }
    Ok(())
}

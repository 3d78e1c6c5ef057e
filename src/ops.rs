//! Host ops backing the sandbox globals, and the extension that bundles them.
//!
//! Every op reads or writes per-execution state in `OpState`; nothing here
//! is shared between executions.

use crate::dates;
use crate::evaluator::op_import_evaluate;
use crate::fetch::op_fetch;
use crate::importer::{op_import_begin, op_import_commit, op_import_resolve};
use crate::output::OutputLog;
use anyhow::{anyhow, Error};
use chrono::Utc;
use deno_core::{op2, OpState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// How the handler settled.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// JSON text of the return value.
    Returned(String),
    /// The handler threw or rejected. `reported` means an error output was
    /// already pushed for it.
    Threw { message: String, reported: bool },
}

/// First settlement of the handler, plus a wake-up for the executor.
#[derive(Debug, Default)]
pub struct HandlerSettlement {
    pub outcome: Option<HandlerOutcome>,
    pub notify: Arc<Notify>,
}

impl HandlerSettlement {
    fn settle(&mut self, outcome: HandlerOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
            self.notify.notify_one();
        }
    }
}

// ============================================================================
// Console Ops
// ============================================================================

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<OutputLog>() {
        output.log(msg);
    }
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<OutputLog>() {
        output.error(msg);
    }
}

// ============================================================================
// Handler Result Ops
// ============================================================================

#[op2(fast)]
pub fn op_sandbox_set_result(state: &mut OpState, #[string] json: &str) {
    state
        .borrow_mut::<HandlerSettlement>()
        .settle(HandlerOutcome::Returned(json.to_string()));
}

#[op2(fast)]
pub fn op_sandbox_set_error(state: &mut OpState, #[string] message: &str, reported: bool) {
    state.borrow_mut::<HandlerSettlement>().settle(HandlerOutcome::Threw {
        message: message.to_string(),
        reported,
    });
}

// ============================================================================
// Timer Ops
// ============================================================================

#[op2(async)]
pub async fn op_sandbox_sleep(millis: f64) {
    let delay = Duration::try_from_secs_f64(millis.max(0.0) / 1000.0).unwrap_or(Duration::MAX);
    tokio::time::sleep(delay).await;
}

// ============================================================================
// Crypto Ops
// ============================================================================

#[op2]
#[string]
pub fn op_crypto_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
pub fn op_crypto_get_random_values(#[buffer] buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

#[op2]
#[buffer]
pub fn op_crypto_subtle_digest(#[string] algorithm: &str, #[buffer] data: &[u8]) -> Result<Vec<u8>, Error> {
    use sha2::{Digest, Sha256, Sha384, Sha512};

    let result = match algorithm.to_uppercase().replace('-', "").as_str() {
        "SHA256" => Sha256::digest(data).to_vec(),
        "SHA384" => Sha384::digest(data).to_vec(),
        "SHA512" => Sha512::digest(data).to_vec(),
        _ => {
            return Err(anyhow!(
                "Unsupported algorithm: {}. Supported: SHA-256, SHA-384, SHA-512",
                algorithm
            ))
        }
    };

    Ok(result)
}

// ============================================================================
// Encoding Ops
// ============================================================================

#[op2]
#[string]
pub fn op_btoa(#[string] data: &str) -> String {
    use base64::Engine;
    // btoa expects Latin-1, but we'll be lenient and accept UTF-8
    base64::engine::general_purpose::STANDARD.encode(data.as_bytes())
}

#[op2]
#[string]
pub fn op_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
}

/// Base64 of raw bytes, for `Buffer#toString("base64")`.
#[op2]
#[string]
pub fn op_base64_encode(#[buffer] data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Padding is optional, as Node's `Buffer.from(s, "base64")` accepts both.
const LENIENT_BASE64: base64::engine::GeneralPurpose = base64::engine::GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    base64::engine::GeneralPurposeConfig::new()
        .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent),
);

#[op2]
#[buffer]
pub fn op_base64_decode(#[string] data: &str) -> Result<Vec<u8>, Error> {
    use base64::Engine;
    LENIENT_BASE64
        .decode(data.trim())
        .map_err(|e| anyhow!("Invalid base64: {}", e))
}

// ============================================================================
// Date Ops
// ============================================================================

/// ISO string of the parsed date, or `null` when the input is not understood.
#[op2]
#[serde]
pub fn op_date_parse(#[string] input: &str, #[string] time_zone: &str) -> Result<Option<String>, Error> {
    let parsed = dates::parse_date(input, time_zone, Utc::now()).map_err(|e| anyhow!(e))?;
    Ok(parsed.as_ref().map(dates::to_iso_string))
}

#[op2]
#[serde]
pub fn op_date_parse_range(
    #[string] start: &str,
    #[string] end: &str,
    #[string] time_zone: &str,
) -> Result<(String, String), Error> {
    let (start, end) =
        dates::parse_start_and_end(start, end, time_zone, Utc::now()).map_err(|e| anyhow!(e))?;
    Ok((dates::to_iso_string(&start), dates::to_iso_string(&end)))
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    function_sandbox,
    ops = [
        op_console_log,
        op_console_error,
        op_sandbox_set_result,
        op_sandbox_set_error,
        op_sandbox_sleep,
        op_crypto_random_uuid,
        op_crypto_get_random_values,
        op_crypto_subtle_digest,
        op_btoa,
        op_atob,
        op_base64_encode,
        op_base64_decode,
        op_date_parse,
        op_date_parse_range,
        op_fetch,
        op_import_begin,
        op_import_resolve,
        op_import_evaluate,
        op_import_commit,
    ],
);

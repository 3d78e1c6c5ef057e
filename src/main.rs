//! Function Sandbox CLI
//!
//! Single-shot mode:
//!   function-sandbox <code-file> [args-json]
//!
//! Server mode (persistent process, reads from stdin):
//!   function-sandbox --server
//!
//! Protocol (server mode):
//!   Request (stdin, one JSON object per line):
//!     {"code":"async function handler(ctx) {...}","args":{"name":"World"}}
//!
//!   Optional request fields: `arguments` (declared parameters), `secrets`,
//!   `oauth`, `user`, `timeoutSecs`, `operationId`.
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:1234
//!
//!     {"outputs":[...],"result":...}
//!
//!   Error response (request rejected before running):
//!     Status:Error
//!     Length:42
//!
//!     {"error":"Missing required argument: name","status":400}

use anyhow::{anyhow, Result};
use function_sandbox::{
    ArgumentSpec, ExecutionRequest, ExecutionResult, OAuthCredential, SandboxConfig,
    SandboxExecutor, SecretSet, UserProfile,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!("Function Sandbox - Isolated runtime for user-authored JavaScript functions");
    eprintln!();
    eprintln!("Single-shot mode:");
    eprintln!("  function-sandbox <code-file> [args-json]");
    eprintln!();
    eprintln!("Server mode (persistent process):");
    eprintln!("  function-sandbox --server");
    eprintln!();
    eprintln!("Configuration is read from FN_SANDBOX_* environment variables.");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  function-sandbox ./hello.js '{{\"name\":\"World\"}}'");
    eprintln!("  function-sandbox --server");
}

/// One line of server-mode input.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerRequest {
    code: String,
    #[serde(default)]
    arguments: Vec<ArgumentSpec>,
    #[serde(default)]
    args: Map<String, Value>,
    #[serde(default)]
    secrets: BTreeMap<String, String>,
    #[serde(default)]
    oauth: Vec<OAuthCredential>,
    #[serde(default)]
    user: Option<UserProfile>,
    #[serde(default)]
    timeout_secs: Option<f64>,
    #[serde(default)]
    operation_id: Option<String>,
}

impl ServerRequest {
    fn into_execution_request(self) -> Result<ExecutionRequest> {
        let mut request = ExecutionRequest::new(self.code)
            .secrets(SecretSet::for_user(&self.oauth, self.secrets)?);
        request.declared_arguments = self.arguments;
        request.supplied_arguments = self.args;
        request.user = self.user;
        request.operation_id = self.operation_id;
        if let Some(secs) = self.timeout_secs {
            let timeout = Duration::try_from_secs_f64(secs)
                .map_err(|e| anyhow!("Invalid timeoutSecs: {}", e))?;
            request = request.timeout(timeout);
        }
        Ok(request)
    }
}

/// Transport JSON of a result, with metrics flattened into `metric` outputs.
fn response_body(result: &ExecutionResult) -> String {
    let mut outputs = result.outputs.clone();
    outputs.extend(result.metrics.to_outputs());
    json!({ "outputs": outputs, "result": result.result }).to_string()
}

/// Run in single-shot mode
async fn run_single_shot(code_file: &str, args_json: Option<&str>) -> Result<()> {
    let code = std::fs::read_to_string(code_file)
        .map_err(|e| anyhow!("Failed to read {}: {}", code_file, e))?;

    let args: Map<String, Value> = match args_json {
        Some(json) => serde_json::from_str(json).map_err(|e| anyhow!("Invalid args JSON: {}", e))?,
        None => Map::new(),
    };

    let executor = SandboxExecutor::new(SandboxConfig::from_env()?)?;
    let mut request = ExecutionRequest::new(code);
    request.supplied_arguments = args;

    let result = executor.execute(request).await?;
    println!("{}", response_body(&result));

    if result.is_success() {
        Ok(())
    } else {
        Err(anyhow!("Handler {}", result.status.as_str()))
    }
}

/// Run in server mode (persistent process, reads requests from stdin)
async fn run_server() -> Result<()> {
    // One executor for the process lifetime keeps the durable module tier warm
    let executor = SandboxExecutor::new(SandboxConfig::from_env()?)?;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    tracing::info!("server ready, reading from stdin");

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            // EOF - stdin closed, exit gracefully
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<ServerRequest>(line)
            .map_err(|e| anyhow!("Invalid request JSON: {}", e))
            .and_then(ServerRequest::into_execution_request)
        {
            Ok(request) => request,
            Err(e) => {
                let body = json!({ "error": e.to_string(), "status": 400 }).to_string();
                write_response(&mut stdout, false, &body)?;
                continue;
            }
        };

        match executor.execute(request).await {
            Ok(result) => write_response(&mut stdout, true, &response_body(&result))?,
            Err(e) => {
                let body = json!({ "error": e.to_string(), "status": e.status_code() }).to_string();
                write_response(&mut stdout, false, &body)?;
            }
        }
    }

    tracing::info!("server shutting down");
    Ok(())
}

/// Write response in length-prefixed protocol
fn write_response(stdout: &mut std::io::Stdout, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };

    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Length:{}", body.len())?;
    writeln!(stdout)?; // Empty line separator
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Err(anyhow!("Missing required arguments"));
    }

    if args[1] == "--server" {
        return run_server().await;
    }

    let code_file = &args[1];
    let args_json = args.get(2).map(|s| s.as_str());

    run_single_shot(code_file, args_json).await
}

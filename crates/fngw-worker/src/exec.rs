//! Sandboxed function execution: spawn the runtime command with piped
//! stdio, feed it the request body, capture bounded output, and synthesize
//! the HTTP response.

use std::io::Read;
use std::os::fd::OwnedFd;
use std::process::Stdio;

use fngw::handoff::WorkerRequest;
use fngw::http::format_response;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task;
use tracing::{info, warn};

/// Cap on captured child output.
pub const MAX_OUTPUT_BYTES: usize = 8192;

/// Exit code reported when the runtime command cannot be executed at all.
const EXEC_FAILURE_CODE: i32 = 127;

/// Bytes of captured output echoed back in an error response.
const ERROR_PREVIEW_BYTES: usize = 200;

/// Result of one function invocation.
#[derive(Debug)]
pub struct ExecOutcome {
    exit_code: i32,
    output: Vec<u8>,
    spawn_failed: bool,
}

impl ExecOutcome {
    fn spawn_failure(message: String) -> Self {
        Self {
            exit_code: EXEC_FAILURE_CODE,
            output: serde_json::json!({ "error": message }).to_string().into_bytes(),
            spawn_failed: true,
        }
    }

    /// True when the runtime command never ran: unknown runtime or a failed
    /// spawn. Function-level failures (non-zero exit) are not spawn
    /// failures.
    pub fn is_spawn_failure(&self) -> bool {
        self.spawn_failed
    }

    /// Synthesize the HTTP response written to the client descriptor.
    pub fn into_response(self) -> Vec<u8> {
        let succeeded = self.exit_code == 0 && !self.output.is_empty();
        if succeeded {
            let first = self
                .output
                .iter()
                .copied()
                .find(|b| !b.is_ascii_whitespace());
            if matches!(first, Some(b'{' | b'[')) {
                return format_response(200, "application/json", &self.output);
            }
            let text = String::from_utf8_lossy(&self.output);
            let body = serde_json::json!({ "result": text }).to_string();
            return format_response(200, "application/json", body.as_bytes());
        }

        let preview_len = self.output.len().min(ERROR_PREVIEW_BYTES);
        let body = serde_json::json!({
            "error": "Function failed",
            "exit_code": self.exit_code,
            "output_bytes": self.output.len(),
            "output": String::from_utf8_lossy(&self.output[..preview_len]),
        })
        .to_string();
        format_response(500, "application/json", body.as_bytes())
    }
}

/// Runtime command executed at request time. Only `php` and `wasm` run here;
/// every other runtime was compiled to wasm at upload time and its rows name
/// a `.wasm` module.
fn command_for(runtime: &str, module: &str) -> Option<Command> {
    if runtime.eq_ignore_ascii_case("php") {
        let mut cmd = Command::new("php");
        cmd.arg(module);
        return Some(cmd);
    }
    if runtime.eq_ignore_ascii_case("wasm") {
        let mut cmd = Command::new("wasmer");
        cmd.arg("run").arg(module);
        return Some(cmd);
    }
    None
}

/// Execute the handoff request.
pub async fn run(request: &WorkerRequest) -> ExecOutcome {
    let Some(cmd) = command_for(&request.runtime, &request.module) else {
        warn!(runtime = %request.runtime, "unknown runtime");
        return ExecOutcome::spawn_failure(format!("Unknown runtime: {}", request.runtime));
    };
    info!(module = %request.module, runtime = %request.runtime, "executing function");
    run_command(cmd, &request.body).await
}

/// Spawn `cmd` with piped stdio, write `body` to its stdin, and collect
/// bounded output. The child's stdout and stderr share one pipe writer, so
/// the capture preserves the child's write order under a single cap. Split
/// out from [`run`] so the piping is testable without the real runtime
/// commands.
async fn run_command(mut cmd: Command, body: &[u8]) -> ExecOutcome {
    let (reader, writer) = match nix::unistd::pipe() {
        Ok(pair) => pair,
        Err(err) => {
            warn!(%err, "pipe creation failed");
            return ExecOutcome::spawn_failure(format!("pipe creation failed: {err}"));
        }
    };
    let writer_for_stderr = match writer.try_clone() {
        Ok(writer) => writer,
        Err(err) => {
            warn!(%err, "pipe writer dup failed");
            return ExecOutcome::spawn_failure(format!("pipe creation failed: {err}"));
        }
    };
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::from(writer))
        .stderr(Stdio::from(writer_for_stderr));

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(%err, "spawn failed");
            return ExecOutcome::spawn_failure(format!("failed to execute function: {err}"));
        }
    };
    // The command still holds the parent's copies of the pipe writer; they
    // must close before the reader can see EOF.
    drop(cmd);

    if let Some(mut stdin) = child.stdin.take() {
        if !body.is_empty() {
            if let Err(err) = stdin.write_all(body).await {
                warn!(%err, "body write failed");
            }
        }
        // Dropping stdin signals EOF to the child.
    }

    let output = task::spawn_blocking(move || read_capped(reader, MAX_OUTPUT_BYTES))
        .await
        .expect("output read task panicked");

    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(err) => {
            warn!(%err, "wait failed");
            -1
        }
    };
    info!(exit_code, output_bytes = output.len(), "function finished");

    ExecOutcome {
        exit_code,
        output,
        spawn_failed: false,
    }
}

/// Read the shared output pipe until EOF or `cap` bytes, whichever comes
/// first.
fn read_capped(reader: OwnedFd, cap: usize) -> Vec<u8> {
    let mut file = std::fs::File::from(reader);
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while buf.len() < cap {
        let want = (cap - buf.len()).min(chunk.len());
        match file.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    buf
}

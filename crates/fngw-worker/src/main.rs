//! fngw worker: accepts handoffs from the gateway, runs the function in a
//! piped child process, and answers the client on the transferred
//! descriptor. One request at a time; pool parallelism comes from running N
//! worker processes.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;

use anyhow::{Context, bail};
use fngw::Config;
use fngw::handoff;
use tokio::net::UnixListener;
use tokio::task;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod exec;
mod state;
mod telemetry_task;

use state::WorkerState;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(socket_path) = args.next() else {
        bail!("usage: fngw-worker <socket_path> [worker_id]");
    };
    let worker_id: u32 = args.next().map_or(Ok(0), |raw| {
        raw.parse().context("worker_id must be a small integer")
    })?;

    let config = Config::from_env();
    let state = Arc::new(WorkerState::new(worker_id));

    tokio::spawn(telemetry_task::run(
        state.clone(),
        config.telemetry_socket(),
    ));

    // A previous worker instance may have left its socket behind.
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("cannot bind worker socket {socket_path}"))?;
    info!(worker_id, socket = %socket_path, pid = std::process::id(), "worker ready");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((conn, _)) => serve_handoff(&state, conn).await,
                    Err(err) => warn!(%err, "accept failed"),
                }
            }
        }
    }

    info!(worker_id, "worker stopping");
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

/// Drive one gateway connection: receive the handoff, execute, respond on
/// the transferred descriptor, release it.
async fn serve_handoff(state: &Arc<WorkerState>, conn: tokio::net::UnixStream) {
    let received = match conn.into_std() {
        Ok(conn) => {
            task::spawn_blocking(move || {
                let _ = conn.set_nonblocking(false);
                // The gateway connection is dropped here either way; the
                // client descriptor is all the worker needs.
                handoff::recv_request(&conn)
            })
            .await
            .expect("handoff receive task panicked")
        }
        Err(err) => {
            warn!(%err, "cannot detach gateway connection");
            state.record_error();
            return;
        }
    };

    let (request, client_fd) = match received {
        Ok(received) => received,
        Err(err) => {
            warn!(%err, "handoff receive failed");
            state.record_error();
            return;
        }
    };
    info!(
        runtime = %request.runtime,
        module = %request.module,
        body_bytes = request.body_len(),
        "handoff received"
    );

    state.begin_request();
    let outcome = exec::run(&request).await;
    if outcome.is_spawn_failure() {
        state.record_error();
    }
    let response = outcome.into_response();

    let client = TcpStream::from(client_fd);
    let write_result = task::spawn_blocking(move || {
        // The descriptor inherits the gateway's non-blocking mode.
        client.set_nonblocking(false)?;
        let mut client = client;
        client.write_all(&response)
        // Dropping `client` closes the descriptor: the worker owns it.
    })
    .await
    .expect("response write task panicked");

    if let Err(err) = write_result {
        warn!(%err, "response write failed");
    }
    state.end_request();
}

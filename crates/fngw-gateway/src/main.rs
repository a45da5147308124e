//! fngw gateway: accepts HTTP requests, routes them to deployed functions,
//! and hands accepted connections to the least-loaded worker.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use fngw::compiler::CompileDriver;
use fngw::registry::Registry;
use fngw::scheduler::Scheduler;
use fngw::sync::Syncer;
use fngw::telemetry::Collector;
use fngw::upload::UploadPipeline;
use fngw::{Config, RouteTable};
use tokio::net::TcpSocket;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod dispatch;

use dispatch::Gateway;

const LISTEN_BACKLOG: u32 = 2048;
const ROUTE_CAPACITY: usize = 1024;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!(port = config.port, workers = config.workers, "gateway starting");

    let registry = Registry::new(&config.db_path);
    registry
        .ensure_schema()
        .context("cannot prepare the function registry")?;

    let table = Arc::new(RouteTable::with_capacity(ROUTE_CAPACITY));
    let syncer = Syncer::init(table.clone(), registry.clone(), config.sync_interval)
        .await
        .context("initial registry load failed")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    tokio::spawn(syncer.run(shutdown.clone()));

    let collector = Arc::new(Collector::new(config.workers));
    {
        let collector = collector.clone();
        let path = config.telemetry_socket();
        tokio::spawn(async move {
            if let Err(err) = collector.run(&path).await {
                error!(%err, "telemetry collector terminated");
            }
        });
    }

    let driver = CompileDriver::new(
        &config.staging_dir,
        &config.out_dir,
        &config.sidecar_dir,
        registry,
    );
    let uploads = UploadPipeline::new(&config.staging_dir, driver, config.sync_interval);
    let scheduler = Scheduler::new(collector.clone(), config.workers);
    let gateway = Arc::new(Gateway::new(config.clone(), table, scheduler, uploads));

    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)))?;
    let listener = socket.listen(LISTEN_BACKLOG)?;
    info!(port = config.port, "gateway ready");

    let shutdown_requested = shutdown_signal();
    tokio::pin!(shutdown_requested);

    loop {
        tokio::select! {
            () = &mut shutdown_requested => {
                shutdown.store(true, Ordering::Relaxed);
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        tracing::debug!(%peer, "accepted connection");
                        tokio::spawn(dispatch::handle_connection(gateway.clone(), stream));
                    }
                    Err(err) => warn!(%err, "accept failed"),
                }
            }
        }
    }

    info!("shutting down");
    for record in collector.snapshot() {
        if record.is_present() {
            info!(
                worker = record.worker_id,
                score = record.score,
                cpu = record.cpu,
                mem = record.mem,
                io = record.io,
                requests = record.requests,
                errors = record.errors,
                status = record.status.as_str(),
                "final worker state"
            );
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

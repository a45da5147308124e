//! Per-connection request handling: parse, route, and either serve the
//! upload surface or hand the connection to a worker.

use std::io::Write;
use std::os::fd::{AsFd, IntoRawFd};
use std::sync::Arc;

use fngw::handoff::{self, WorkerRequest};
use fngw::http::{self, Request};
use fngw::scheduler::Scheduler;
use fngw::upload::UploadPipeline;
use fngw::{Config, RouteTable};
use tokio::net::TcpStream;
use tokio::task;
use tracing::{info, warn};

const UPLOAD_URI: &str = "/upload";

/// Shared request-path state, built once in `main`.
pub struct Gateway {
    config: Config,
    table: Arc<RouteTable>,
    scheduler: Scheduler,
    uploads: UploadPipeline,
}

impl Gateway {
    pub fn new(
        config: Config,
        table: Arc<RouteTable>,
        scheduler: Scheduler,
        uploads: UploadPipeline,
    ) -> Self {
        Self {
            config,
            table,
            scheduler,
            uploads,
        }
    }
}

pub async fn handle_connection(gateway: Arc<Gateway>, mut stream: TcpStream) {
    let request = match http::read_request(&mut stream).await {
        Ok(request) => request,
        Err(err) => {
            warn!(%err, "request rejected");
            let _ = http::write_server_error(&mut stream, "Failed to parse request").await;
            return;
        }
    };
    info!(
        method = %request.method,
        uri = %request.uri,
        body_bytes = request.body.len(),
        "request"
    );

    if request.uri == UPLOAD_URI {
        match request.method.as_str() {
            "GET" => {
                let _ = http::serve_html_file(&mut stream, &gateway.config.upload_page).await;
                return;
            }
            "POST" => {
                serve_upload(&gateway, &request, &mut stream).await;
                return;
            }
            _ => {}
        }
    }

    invoke_function(&gateway, &request, stream).await;
}

async fn serve_upload(gateway: &Gateway, request: &Request, stream: &mut TcpStream) {
    match gateway
        .uploads
        .process(&request.content_type, request.body.clone())
        .await
    {
        Ok(receipt) => {
            info!(id = %receipt.id, uri = %receipt.uri, "function deployed");
            let _ = http::write_json_ok(stream, &receipt.to_json().to_string()).await;
        }
        Err(err) => {
            warn!(%err, "upload rejected");
            let body = err.to_json().to_string();
            let _ = http::write_response(stream, 500, "application/json", body.as_bytes()).await;
        }
    }
}

async fn invoke_function(gateway: &Gateway, request: &Request, mut stream: TcpStream) {
    let Some(descriptor) = gateway.table.lookup(&request.method, &request.uri) else {
        info!(method = %request.method, uri = %request.uri, "no function for route");
        let _ = http::write_not_found(&mut stream).await;
        return;
    };
    info!(
        name = %descriptor.name,
        runtime = %descriptor.runtime,
        memory = descriptor.memory,
        timeout = descriptor.timeout,
        "resolved function"
    );

    let worker_request = match WorkerRequest::new(
        descriptor.runtime.as_str(),
        &descriptor.module,
        &descriptor.handler,
        &request.body,
    ) {
        Ok(worker_request) => worker_request,
        Err(err) => {
            warn!(%err, "descriptor exceeds handoff caps");
            let _ = http::write_server_error(&mut stream, "Worker communication failed").await;
            return;
        }
    };

    let worker = gateway.scheduler.select();
    let socket_path = gateway.config.worker_socket(worker);

    let client = match stream.into_std() {
        Ok(client) => client,
        Err(err) => {
            warn!(%err, "cannot detach client stream");
            return;
        }
    };

    let (client, sent) = task::spawn_blocking(move || {
        let sent = handoff::dispatch(&socket_path, &worker_request, client.as_fd());
        (client, sent)
    })
    .await
    .expect("handoff task panicked");

    match sent {
        Ok(()) => {
            info!(worker, "client descriptor delegated");
            // The worker now owns the response and the close; the gateway
            // must not touch the descriptor again.
            let _ = client.into_raw_fd();
        }
        Err(err) => {
            warn!(worker, %err, "handoff failed");
            let _ = client.set_nonblocking(false);
            let mut client = client;
            let body = serde_json::json!({ "error": "Worker communication failed" }).to_string();
            let _ = client.write_all(&http::format_response(
                500,
                "application/json",
                body.as_bytes(),
            ));
        }
    }
}

//! Cross-component scenarios: upload → registry → sync → lookup, and the
//! scheduler → handoff → response path against an in-process worker.

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use fngw::compiler::CompileDriver;
use fngw::handoff::{self, WorkerRequest};
use fngw::http::format_response;
use fngw::registry::Registry;
use fngw::scheduler::Scheduler;
use fngw::sync::Syncer;
use fngw::telemetry::{Collector, WorkerStatus, WorkerTelemetry, timestamp_ms};
use fngw::upload::UploadPipeline;
use fngw::{RouteTable, Runtime};

const ECHO_DESCRIPTOR: &str = r#"{"name":"echo","runtime":"wasm","module":"/opt/functions/echo/module.wasm","handler":"echo","memory":128,"timeout":5}"#;

/// Collect response bytes until `suffix` arrives or the peer goes quiet.
fn read_until_suffix(stream: &mut std::net::TcpStream, suffix: &str) -> String {
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut collected = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if String::from_utf8_lossy(&collected).ends_with(suffix) {
            break;
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => collected.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

fn telemetry(worker_id: u32, score: f32) -> WorkerTelemetry {
    WorkerTelemetry {
        worker_id,
        pid: 1,
        cpu: score,
        mem: 0.0,
        io: 0.0,
        score,
        requests: 0,
        errors: 0,
        timestamp: timestamp_ms(),
        status: WorkerStatus::Idle,
    }
}

struct Plane {
    _dir: tempfile::TempDir,
    registry: Registry,
    table: Arc<RouteTable>,
    pipeline: UploadPipeline,
}

fn plane() -> Plane {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(dir.path().join("meta.db"));
    registry.ensure_schema().unwrap();
    let staging = dir.path().join("staging");
    let driver = CompileDriver::new(
        &staging,
        dir.path().join("out"),
        dir.path().join("sidecars"),
        registry.clone(),
    );
    let pipeline = UploadPipeline::new(staging, driver, Duration::from_secs(5));
    Plane {
        _dir: dir,
        registry,
        table: Arc::new(RouteTable::with_capacity(64)),
        pipeline,
    }
}

fn multipart(descriptor: &str, code: &[u8]) -> (String, Bytes) {
    let boundary = "it-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"code\"; filename=\"f.wasm\"\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(code);
    body.extend_from_slice(
        format!(
            "\r\n--{boundary}\r\nContent-Disposition: form-data; name=\"descriptor\"; filename=\"d.json\"\r\n\r\n{descriptor}\r\n--{boundary}--\r\n"
        )
        .as_bytes(),
    );
    (
        format!("multipart/form-data; boundary={boundary}"),
        Bytes::from(body),
    )
}

#[tokio::test]
async fn upload_becomes_routable_after_one_poll() -> Result<()> {
    let plane = plane();
    let mut syncer = Syncer::init(
        plane.table.clone(),
        plane.registry.clone(),
        Duration::from_secs(5),
    )
    .await?;

    let (content_type, body) = multipart(r#"{"runtime":"wasm","method":"POST"}"#, b"\0asm");
    let receipt = plane.pipeline.process(&content_type, body).await?;

    // Not routable before the poll observes the new row.
    assert!(plane.table.lookup("POST", &receipt.uri).is_none());

    assert_eq!(syncer.poll_once().await, 1);
    let descriptor = plane
        .table
        .lookup("POST", &receipt.uri)
        .expect("route visible after poll");
    assert_eq!(descriptor.runtime, Runtime::Wasm);
    assert!(std::path::Path::new(&descriptor.module).exists());
    assert_eq!(descriptor.handler, receipt.id);
    Ok(())
}

#[tokio::test]
async fn sync_freshness_with_running_poll_task() -> Result<()> {
    let plane = plane();
    let interval = Duration::from_millis(50);
    let syncer = Syncer::init(plane.table.clone(), plane.registry.clone(), interval).await?;
    let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let task = tokio::spawn(syncer.run(shutdown.clone()));

    plane.registry.upsert_at("GET:/new", ECHO_DESCRIPTOR, 10)?;
    assert!(plane.table.lookup("GET", "/new").is_none());

    // Visible no later than the next completed poll.
    tokio::time::timeout(Duration::from_secs(2), async {
        while plane.table.lookup("GET", "/new").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("row did not become routable within the freshness window");

    shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    Ok(())
}

#[tokio::test]
async fn repeated_upsert_is_idempotent_through_sync() -> Result<()> {
    let plane = plane();
    plane.registry.upsert_at("POST:/echo", ECHO_DESCRIPTOR, 7)?;
    let mut syncer = Syncer::init(
        plane.table.clone(),
        plane.registry.clone(),
        Duration::from_secs(5),
    )
    .await?;

    let before = plane.table.len();
    plane.registry.upsert_at("POST:/echo", ECHO_DESCRIPTOR, 8)?;
    syncer.poll_once().await;

    assert_eq!(plane.table.len(), before);
    assert_eq!(
        plane.table.get("POST:/echo").as_deref(),
        Some(ECHO_DESCRIPTOR)
    );
    Ok(())
}

/// The S1 path: telemetry names worker 2 the least loaded, the handoff
/// carries the descriptor and the connection there, and the worker's
/// response reaches the client untouched by the gateway.
#[test]
fn scheduled_handoff_reaches_client() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let socket_path = dir.path().join("faas_worker_2.sock");

    let worker_listener = std::os::unix::net::UnixListener::bind(&socket_path)?;
    let worker = std::thread::spawn(move || {
        let (conn, _) = worker_listener.accept().unwrap();
        let (request, client_fd) = handoff::recv_request(&conn).unwrap();
        assert_eq!(request.runtime, "wasm");
        assert_eq!(request.handler, "echo");
        assert_eq!(request.body, b"hi");

        let mut client = std::net::TcpStream::from(client_fd);
        client.set_nonblocking(false).unwrap();
        client
            .write_all(&format_response(
                200,
                "application/json",
                br#"{"echo":"hi"}"#,
            ))
            .unwrap();
    });

    // Only worker 2 has telemetry, so selection is deterministic.
    let collector = Arc::new(Collector::new(4));
    collector.update(telemetry(2, 3.5));
    let scheduler = Scheduler::new(collector, 4);
    assert_eq!(scheduler.select(), 2);

    // Loopback stand-in for the accepted client connection.
    let tcp = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = tcp.local_addr()?;
    let mut client_side = std::net::TcpStream::connect(addr)?;
    let (gateway_side, _) = tcp.accept()?;

    let request = WorkerRequest::new("wasm", "/opt/functions/echo/module.wasm", "echo", b"hi")?;
    handoff::dispatch(&socket_path, &request, gateway_side.as_fd())?;
    worker.join().unwrap();

    // The gateway holds its descriptor copy but never writes; the response
    // the client sees is the worker's alone.
    let text = read_until_suffix(&mut client_side, r#"{"echo":"hi"}"#);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "got: {text}");
    assert!(text.ends_with(r#"{"echo":"hi"}"#), "got: {text}");
    drop(gateway_side);
    Ok(())
}

/// Every handoff delivers exactly one usable descriptor even under a burst
/// of sequential requests on one worker socket.
#[test]
fn handoffs_serialize_on_one_worker() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let socket_path = dir.path().join("faas_worker_0.sock");
    let worker_listener = std::os::unix::net::UnixListener::bind(&socket_path)?;

    const ROUNDS: usize = 20;
    let worker = std::thread::spawn(move || {
        for _ in 0..ROUNDS {
            let (conn, _) = worker_listener.accept().unwrap();
            let (request, client_fd) = handoff::recv_request(&conn).unwrap();
            let mut client = std::net::TcpStream::from(client_fd);
            client.set_nonblocking(false).unwrap();
            client
                .write_all(&format_response(200, "application/json", &request.body))
                .unwrap();
        }
    });

    for round in 0..ROUNDS {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0")?;
        let mut client_side = std::net::TcpStream::connect(tcp.local_addr()?)?;
        let (gateway_side, _) = tcp.accept()?;

        let body = format!(r#"{{"round":{round}}}"#);
        let request = WorkerRequest::new("wasm", "/m.wasm", "h", body.as_bytes())?;
        handoff::dispatch(&socket_path, &request, gateway_side.as_fd())?;

        let text = read_until_suffix(&mut client_side, &body);
        assert!(text.ends_with(&body), "round {round}: {text}");
    }
    worker.join().unwrap();
    Ok(())
}

#[tokio::test]
async fn compile_failure_surfaces_numeric_code() {
    let plane = plane();
    // A descriptor that validates but names a runtime whose toolchain is
    // not present in the test environment.
    let (content_type, body) = multipart(r#"{"runtime":"php"}"#, b"<?php echo 1; ?>");
    let err = plane
        .pipeline
        .process(&content_type, body)
        .await
        .unwrap_err();
    let json = err.to_json();
    assert_eq!(json["status"], "error");
    assert_eq!(json["message"], "Compilation failed");
    assert!(
        json["details"]
            .as_str()
            .unwrap()
            .contains("error code: 7"),
        "details: {}",
        json["details"]
    );
}

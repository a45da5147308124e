//! HTTP/1.1 response synthesis. Every response closes the connection and
//! carries an exact `Content-Length`, so clients never wait on the server's
//! FIN — which matters once the descriptor has been handed to a worker.

use std::path::Path;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::HttpError;

/// Cap on the static upload page.
const MAX_PAGE_BYTES: u64 = 1024 * 1024;

const fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Render a full response as bytes. Shared by the gateway's async writers
/// and the worker, which writes to the handed-off descriptor synchronously.
#[must_use]
pub fn format_response(status: u16, content_type: &str, body: &[u8]) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status_text(status),
        body.len(),
    );
    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

pub async fn write_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<(), HttpError> {
    stream
        .write_all(&format_response(status, content_type, body))
        .await?;
    stream.flush().await?;
    Ok(())
}

pub async fn write_json_ok<S: AsyncWrite + Unpin>(
    stream: &mut S,
    body: &str,
) -> Result<(), HttpError> {
    write_response(stream, 200, "application/json", body.as_bytes()).await
}

pub async fn write_not_found<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<(), HttpError> {
    write_response(
        stream,
        404,
        "application/json",
        br#"{"error":"Function not found"}"#,
    )
    .await
}

/// 500 with a `{"error": ...}` body; `message` is JSON-escaped.
pub async fn write_server_error<S: AsyncWrite + Unpin>(
    stream: &mut S,
    message: &str,
) -> Result<(), HttpError> {
    let body = serde_json::json!({ "error": message }).to_string();
    write_response(stream, 500, "application/json", body.as_bytes()).await
}

/// Serve a bounded static HTML file. A missing page is a 404; an empty or
/// oversized one is a server error.
pub async fn serve_html_file<S: AsyncWrite + Unpin>(
    stream: &mut S,
    path: &Path,
) -> Result<(), HttpError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) => {
            warn!(path = %path.display(), %err, "upload page unavailable");
            return write_not_found(stream).await;
        }
    };
    if meta.len() == 0 || meta.len() > MAX_PAGE_BYTES {
        warn!(path = %path.display(), size = meta.len(), "upload page size out of bounds");
        return write_server_error(stream, "File too large or empty").await;
    }
    let content = tokio::fs::read(path).await?;
    write_response(stream, 200, "text/html; charset=utf-8", &content).await
}

//! Bounded HTTP/1.1 request reader.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::HttpError;

/// Header section cap; a request line and headers must fit in this window.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;
/// Request body cap.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

const MAX_METHOD_BYTES: usize = 15;
const MAX_URI_BYTES: usize = 511;
const TERMINATOR: &[u8] = b"\r\n\r\n";

/// The fields of a request the serving plane consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub content_type: String,
    pub content_length: usize,
    pub body: Bytes,
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)
        .map(|at| at + TERMINATOR.len())
}

fn parse_request_line(line: &str) -> Result<(String, String), HttpError> {
    let mut parts = line.split_ascii_whitespace();
    let method = parts.next().ok_or(HttpError::MalformedRequestLine)?;
    let uri = parts.next().ok_or(HttpError::MalformedRequestLine)?;
    if method.len() > MAX_METHOD_BYTES {
        return Err(HttpError::FieldTooLong("method"));
    }
    if uri.len() > MAX_URI_BYTES {
        return Err(HttpError::FieldTooLong("uri"));
    }
    Ok((method.to_owned(), uri.to_owned()))
}

/// Header values are taken verbatim after the separating whitespace; names
/// match case-insensitively.
fn header_value<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    headers.lines().find_map(|line| {
        let (candidate, value) = line.split_once(':')?;
        candidate
            .trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim_start_matches([' ', '\t']))
    })
}

/// Read one request from `stream`: the header section into a bounded buffer,
/// then as many body bytes as `Content-Length` announces (bounded). The
/// connection carries exactly one request.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Request, HttpError> {
    let mut buf = Vec::with_capacity(2048);
    let mut chunk = [0u8; 2048];

    let header_end = loop {
        if let Some(end) = find_terminator(&buf) {
            break Some(end);
        }
        if buf.len() >= MAX_HEADER_BYTES {
            return Err(HttpError::HeadersTooLarge);
        }
        let budget = (MAX_HEADER_BYTES - buf.len()).min(chunk.len());
        let n = stream.read(&mut chunk[..budget]).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(HttpError::UnexpectedEof);
            }
            break None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_section = header_end.map_or(&buf[..], |end| &buf[..end]);
    let headers = std::str::from_utf8(header_section)
        .map_err(|_| HttpError::MalformedRequestLine)?
        .to_owned();

    let first_line = headers
        .split("\r\n")
        .next()
        .ok_or(HttpError::MalformedRequestLine)?;
    let (method, uri) = parse_request_line(first_line)?;

    let content_length = header_value(&headers, "Content-Length")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let content_type = header_value(&headers, "Content-Type")
        .unwrap_or_default()
        .trim_end()
        .to_owned();

    let mut body = Vec::new();
    if let (Some(end), true) = (header_end, content_length > 0) {
        if content_length > MAX_BODY_BYTES {
            return Err(HttpError::BodyTooLarge(content_length));
        }
        let buffered = &buf[end..];
        body.extend_from_slice(&buffered[..buffered.len().min(content_length)]);
        while body.len() < content_length {
            let want = (content_length - body.len()).min(chunk.len());
            let n = stream.read(&mut chunk[..want]).await?;
            if n == 0 {
                // Short body: keep what arrived.
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }

    Ok(Request {
        method,
        uri,
        content_type,
        content_length,
        body: Bytes::from(body),
    })
}

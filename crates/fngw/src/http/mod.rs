//! Minimal HTTP/1.1 surface: a bounded request reader and a
//! `Connection: close` response writer. The gateway must keep the accepted
//! socket as a plain file descriptor so it can hand it to a worker, which
//! rules out framework-owned connections.

mod request;
mod response;

use thiserror::Error;

pub use request::{MAX_BODY_BYTES, MAX_HEADER_BYTES, Request, read_request};
pub use response::{
    format_response, serve_html_file, write_json_ok, write_not_found, write_response,
    write_server_error,
};

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("{0} too long")]
    FieldTooLong(&'static str),
    #[error("header section exceeds {MAX_HEADER_BYTES} bytes")]
    HeadersTooLarge,
    #[error("body of {0} bytes exceeds the {MAX_BODY_BYTES} byte cap")]
    BodyTooLarge(usize),
    #[error("connection closed before a full request arrived")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

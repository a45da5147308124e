//! Request handoff: one `WorkerRequest` plus the accepted client descriptor,
//! sent atomically over a unix stream socket with an `SCM_RIGHTS` control
//! message. After a successful exchange the receiver holds an independent
//! descriptor and owns the response lifetime.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use bincode::{Decode, Encode};
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use thiserror::Error;

use crate::telemetry::WIRE_CONFIG;

pub const MAX_RUNTIME_LEN: usize = 32;
pub const MAX_MODULE_LEN: usize = 256;
pub const MAX_HANDLER_LEN: usize = 128;
pub const MAX_BODY_LEN: usize = 4096;

/// Largest encoded request: four length-prefixed fields at their caps.
pub const MAX_FRAME: usize =
    4 * 8 + MAX_RUNTIME_LEN + MAX_MODULE_LEN + MAX_HANDLER_LEN + MAX_BODY_LEN;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("worker connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("handoff send failed: {0}")]
    Send(#[source] nix::Error),
    #[error("handoff receive failed: {0}")]
    Recv(#[source] nix::Error),
    #[error("control message missing or malformed")]
    NoDescriptor,
    #[error("metadata encode failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("metadata decode failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("{field} exceeds its wire cap")]
    CapExceeded { field: &'static str },
}

/// Metadata accompanying the client descriptor. Field lengths ride the wire
/// as explicit little-endian prefixes; caps are enforced on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct WorkerRequest {
    pub runtime: String,
    pub module: String,
    pub handler: String,
    pub body: Vec<u8>,
}

impl WorkerRequest {
    /// Build a request, truncating the body at its cap. Oversized identity
    /// fields are errors: a truncated module path could execute the wrong
    /// artifact.
    pub fn new(
        runtime: &str,
        module: &str,
        handler: &str,
        body: &[u8],
    ) -> Result<Self, HandoffError> {
        if runtime.len() > MAX_RUNTIME_LEN {
            return Err(HandoffError::CapExceeded { field: "runtime" });
        }
        if module.len() > MAX_MODULE_LEN {
            return Err(HandoffError::CapExceeded { field: "module" });
        }
        if handler.len() > MAX_HANDLER_LEN {
            return Err(HandoffError::CapExceeded { field: "handler" });
        }
        Ok(Self {
            runtime: runtime.to_owned(),
            module: module.to_owned(),
            handler: handler.to_owned(),
            body: body[..body.len().min(MAX_BODY_LEN)].to_vec(),
        })
    }

    #[must_use]
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    fn validate(&self) -> Result<(), HandoffError> {
        if self.runtime.len() > MAX_RUNTIME_LEN {
            return Err(HandoffError::CapExceeded { field: "runtime" });
        }
        if self.module.len() > MAX_MODULE_LEN {
            return Err(HandoffError::CapExceeded { field: "module" });
        }
        if self.handler.len() > MAX_HANDLER_LEN {
            return Err(HandoffError::CapExceeded { field: "handler" });
        }
        if self.body.len() > MAX_BODY_LEN {
            return Err(HandoffError::CapExceeded { field: "body" });
        }
        Ok(())
    }
}

/// Send `request` plus `fd` in a single message. The caller keeps ownership
/// of its descriptor copy; the kernel installs an independent one at the
/// receiver.
pub fn send_request(
    sock: &UnixStream,
    request: &WorkerRequest,
    fd: BorrowedFd<'_>,
) -> Result<(), HandoffError> {
    request.validate()?;
    let payload = bincode::encode_to_vec(request, WIRE_CONFIG)?;
    let iov = [IoSlice::new(&payload)];
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(
        sock.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )
    .map_err(HandoffError::Send)?;
    Ok(())
}

/// Connect to a worker socket and perform the send. The gateway side of the
/// exchange.
pub fn dispatch(
    socket_path: &Path,
    request: &WorkerRequest,
    fd: BorrowedFd<'_>,
) -> Result<(), HandoffError> {
    let sock = UnixStream::connect(socket_path).map_err(HandoffError::Connect)?;
    send_request(&sock, request, fd)
}

/// Receive one handoff. Missing, short, or mismatched control messages are
/// protocol failures; a descriptor that does arrive is owned immediately so
/// every error path releases it.
pub fn recv_request(sock: &UnixStream) -> Result<(WorkerRequest, OwnedFd), HandoffError> {
    let mut buf = [0u8; MAX_FRAME];
    let (bytes, raw_fd) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<()>(
            sock.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::empty(),
        )
        .map_err(HandoffError::Recv)?;

        let mut raw_fd = None;
        for cmsg in msg.cmsgs().map_err(HandoffError::Recv)? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                raw_fd = fds.first().copied();
            }
        }
        (msg.bytes, raw_fd)
    };

    // SAFETY: the kernel just installed this descriptor for us; nothing else
    // owns it.
    let fd = raw_fd.map(|raw| unsafe { OwnedFd::from_raw_fd(raw) });
    let Some(fd) = fd else {
        return Err(HandoffError::NoDescriptor);
    };

    let (request, read) = bincode::decode_from_slice::<WorkerRequest, _>(&buf[..bytes], WIRE_CONFIG)?;
    if read != bytes {
        return Err(HandoffError::NoDescriptor);
    }
    request.validate()?;
    Ok((request, fd))
}

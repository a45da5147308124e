//! Worker-side telemetry sender. Emission is fire-and-forget: a gateway that
//! is down or restarting just misses samples.

use std::io;
use std::path::PathBuf;

use tokio::net::UnixDatagram;
use tracing::trace;

use super::WorkerTelemetry;

pub struct Emitter {
    socket: UnixDatagram,
    target: PathBuf,
}

impl Emitter {
    pub fn new(target: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self {
            socket: UnixDatagram::unbound()?,
            target: target.into(),
        })
    }

    /// Send one record. Errors are dropped by contract.
    pub async fn emit(&self, record: &WorkerTelemetry) {
        let Ok(bytes) = record.encode() else {
            return;
        };
        if let Err(err) = self.socket.send_to(&bytes, &self.target).await {
            trace!(%err, "telemetry emit dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_to_absent_collector_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = Emitter::new(dir.path().join("nobody.sock")).unwrap();
        emitter.emit(&WorkerTelemetry::absent(0)).await;
    }
}

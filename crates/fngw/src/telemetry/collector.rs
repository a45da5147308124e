//! Gateway-side telemetry collector: latest record per worker slot.

use std::io;
use std::path::Path;

use parking_lot::Mutex;
use tokio::net::UnixDatagram;
use tracing::{debug, error, info};

use super::{MAX_DATAGRAM, WorkerTelemetry};

/// Fixed slot array holding the most recent telemetry per worker. Writers
/// and readers copy whole records under a short mutex hold.
pub struct Collector {
    slots: Mutex<Vec<WorkerTelemetry>>,
}

impl Collector {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|id| WorkerTelemetry::absent(u32::try_from(id).unwrap_or(u32::MAX)))
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Replace the slot for `record.worker_id`. Out-of-range ids are
    /// discarded.
    pub fn update(&self, record: WorkerTelemetry) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(record.worker_id as usize) else {
            debug!(worker_id = record.worker_id, "telemetry for unknown worker");
            return;
        };
        *slot = record;
    }

    /// Copy of the slot for `worker_id`.
    #[must_use]
    pub fn get(&self, worker_id: usize) -> Option<WorkerTelemetry> {
        self.slots.lock().get(worker_id).copied()
    }

    /// Copy of every slot, present or not.
    #[must_use]
    pub fn snapshot(&self) -> Vec<WorkerTelemetry> {
        self.slots.lock().clone()
    }

    /// Bind the well-known datagram socket and fold incoming records into
    /// the slots until the socket fails. Malformed datagrams are dropped.
    pub async fn run(&self, socket_path: &Path) -> io::Result<()> {
        // A previous process may have left its socket behind.
        let _ = std::fs::remove_file(socket_path);
        let socket = UnixDatagram::bind(socket_path)?;
        info!(path = %socket_path.display(), "telemetry collector listening");

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let n = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    error!(%err, "telemetry receive failed");
                    let _ = std::fs::remove_file(socket_path);
                    return Err(err);
                }
            };
            match WorkerTelemetry::decode(&buf[..n]) {
                Ok(record) => self.update(record),
                Err(err) => debug!(%err, len = n, "discarding malformed telemetry datagram"),
            }
        }
    }
}

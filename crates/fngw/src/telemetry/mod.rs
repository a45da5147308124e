//! Worker telemetry: sampling, smoothing, and the datagram exchange between
//! workers and the gateway's collector.

mod collector;
mod emitter;
mod sampler;
mod smoother;

use std::sync::OnceLock;
use std::time::Instant;

use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use bincode::{Decode, Encode};
use thiserror::Error;

pub use collector::Collector;
pub use emitter::Emitter;
pub use sampler::ProcessSampler;
pub use smoother::{
    ALPHA, BETA, EMA_FACTOR, GAMMA, MAX_CPU_PERCENT, MAX_IO_KIB_S, MAX_MEM_MIB, Smoother,
    load_score, normalize,
};

/// Cadence at which workers emit telemetry.
pub const EMIT_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// Both wire records use the fixed-width little-endian encoding so emitter
/// and collector agree on layout across process boundaries.
pub const WIRE_CONFIG: Configuration<LittleEndian, Fixint, NoLimit> =
    bincode::config::standard().with_fixed_int_encoding();

/// Upper bound of an encoded telemetry record; receive buffers are sized
/// from it.
pub const MAX_DATAGRAM: usize = 128;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("telemetry encode failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("telemetry decode failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("trailing bytes after telemetry record")]
    TrailingBytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Overloaded,
}

impl WorkerStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Overloaded => "overloaded",
        }
    }
}

/// Latest load snapshot of one worker. `timestamp == 0` marks a slot that has
/// never received a sample; such records never win scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct WorkerTelemetry {
    pub worker_id: u32,
    pub pid: u32,
    pub cpu: f32,
    pub mem: f32,
    pub io: f32,
    pub score: f32,
    pub requests: u64,
    pub errors: u64,
    pub timestamp: u64,
    pub status: WorkerStatus,
}

impl WorkerTelemetry {
    /// Placeholder for a slot with no sample yet.
    #[must_use]
    pub const fn absent(worker_id: u32) -> Self {
        Self {
            worker_id,
            pid: 0,
            cpu: 0.0,
            mem: 0.0,
            io: 0.0,
            score: 0.0,
            requests: 0,
            errors: 0,
            timestamp: 0,
            status: WorkerStatus::Idle,
        }
    }

    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.timestamp > 0
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(bincode::encode_to_vec(self, WIRE_CONFIG)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (record, read) = bincode::decode_from_slice::<Self, _>(buf, WIRE_CONFIG)?;
        if read != buf.len() {
            return Err(WireError::TrailingBytes);
        }
        Ok(record)
    }
}

/// Milliseconds on the process-local monotonic clock. Never returns 0, which
/// is reserved for "no sample yet".
#[must_use]
pub fn timestamp_ms() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = *ORIGIN.get_or_init(Instant::now);
    u64::try_from(origin.elapsed().as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_wire_round_trip() {
        let record = WorkerTelemetry {
            worker_id: 2,
            pid: 4242,
            cpu: 12.5,
            mem: 30.0,
            io: 1.25,
            score: 16.5,
            requests: 7,
            errors: 1,
            timestamp: 12345,
            status: WorkerStatus::Busy,
        };
        let bytes = record.encode().unwrap();
        assert!(bytes.len() <= MAX_DATAGRAM);
        assert_eq!(WorkerTelemetry::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = WorkerTelemetry::absent(0).encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            WorkerTelemetry::decode(&bytes),
            Err(WireError::TrailingBytes)
        ));
    }

    #[test]
    fn decode_rejects_short_datagram() {
        let bytes = WorkerTelemetry::absent(0).encode().unwrap();
        assert!(WorkerTelemetry::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn absent_records_are_not_present() {
        assert!(!WorkerTelemetry::absent(3).is_present());
        let mut live = WorkerTelemetry::absent(3);
        live.timestamp = timestamp_ms();
        assert!(live.is_present());
    }
}

//! Fixed-cadence telemetry emission: sample, smooth, score, send.

use std::path::PathBuf;
use std::sync::Arc;

use fngw::telemetry::{
    EMIT_INTERVAL, Emitter, ProcessSampler, Smoother, WorkerStatus, WorkerTelemetry, load_score,
    timestamp_ms,
};
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::state::WorkerState;

pub async fn run(state: Arc<WorkerState>, collector_socket: PathBuf) {
    let emitter = match Emitter::new(collector_socket) {
        Ok(emitter) => emitter,
        Err(err) => {
            warn!(%err, "telemetry disabled: cannot create socket");
            return;
        }
    };

    let mut sampler = ProcessSampler::new();
    let mut smoother = Smoother::new();
    let mut interval = tokio::time::interval(EMIT_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let cpu_raw = sampler.cpu_percent();
        let mem_raw = sampler.memory_mib();
        let io_raw = sampler.io_rate_kib();
        let (cpu, mem, io) = smoother.update(cpu_raw, mem_raw, io_raw);

        let counters = state.snapshot();
        let record = WorkerTelemetry {
            worker_id: state.worker_id(),
            pid: std::process::id(),
            cpu,
            mem,
            io,
            score: load_score(cpu, mem, io),
            requests: counters.requests,
            errors: counters.errors,
            timestamp: timestamp_ms(),
            status: if counters.busy {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Idle
            },
        };
        emitter.emit(&record).await;
    }
}

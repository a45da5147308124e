//! Per-worker counters shared between the request loop and the telemetry
//! task.

use parking_lot::Mutex;

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub requests: u64,
    pub errors: u64,
    pub busy: bool,
}

pub struct WorkerState {
    worker_id: u32,
    counters: Mutex<Counters>,
}

impl WorkerState {
    pub fn new(worker_id: u32) -> Self {
        Self {
            worker_id,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn begin_request(&self) {
        let mut counters = self.counters.lock();
        counters.busy = true;
        counters.requests += 1;
    }

    pub fn end_request(&self) {
        self.counters.lock().busy = false;
    }

    pub fn record_error(&self) {
        let mut counters = self.counters.lock();
        counters.errors += 1;
        counters.busy = false;
    }

    pub fn snapshot(&self) -> Counters {
        *self.counters.lock()
    }
}

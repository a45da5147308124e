//! Load-aware worker selection with a round-robin cold-start fallback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::telemetry::Collector;

pub struct Scheduler {
    collector: Arc<Collector>,
    pool_size: usize,
    fallback: AtomicU64,
}

impl Scheduler {
    #[must_use]
    pub fn new(collector: Arc<Collector>, pool_size: usize) -> Self {
        Self {
            collector,
            pool_size: pool_size.max(1),
            fallback: AtomicU64::new(0),
        }
    }

    /// Pick the eligible worker with the lowest score; ties fall to the
    /// smallest id. With no telemetry at all, rotate round-robin so cold
    /// starts still spread load.
    pub fn select(&self) -> usize {
        let mut best: Option<(usize, f32)> = None;
        for record in self.collector.snapshot().into_iter().take(self.pool_size) {
            if !record.is_present() {
                continue;
            }
            let id = record.worker_id as usize;
            if best.is_none_or(|(_, score)| record.score < score) {
                best = Some((id, record.score));
            }
        }

        if let Some((id, score)) = best {
            debug!(worker = id, score, "selected worker by score");
            return id;
        }

        let next = self.fallback.fetch_add(1, Ordering::Relaxed);
        let id = usize::try_from(next % self.pool_size as u64).unwrap_or(0);
        debug!(worker = id, "selected worker round-robin (no telemetry)");
        id
    }
}

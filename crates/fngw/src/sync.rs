//! Incremental registry→route-table synchronization.
//!
//! One full scan at startup, then a fixed-cadence poll for rows with
//! `updated > high_water`. Store errors leave `high_water` untouched so the
//! next cycle retries the same window.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task;
use tracing::{debug, info, warn};

use crate::registry::{Registry, RegistryError, RegistryRow};
use crate::table::RouteTable;

pub struct Syncer {
    table: Arc<RouteTable>,
    registry: Registry,
    interval: Duration,
    high_water: i64,
}

fn apply(table: &RouteTable, rows: &[RegistryRow]) -> i64 {
    let mut new_high = 0;
    table.set_all(rows.iter().map(|row| {
        new_high = new_high.max(row.updated);
        (row.key.as_str(), row.value.as_str())
    }));
    new_high
}

impl Syncer {
    /// Load the full registry into `table` and record the high-water stamp.
    pub async fn init(
        table: Arc<RouteTable>,
        registry: Registry,
        interval: Duration,
    ) -> Result<Self, RegistryError> {
        let scan = {
            let registry = registry.clone();
            task::spawn_blocking(move || registry.scan())
                .await
                .expect("registry scan task panicked")?
        };
        let high_water = apply(&table, &scan);
        info!(
            entries = scan.len(),
            high_water, "initial registry load complete"
        );
        Ok(Self {
            table,
            registry,
            interval,
            high_water,
        })
    }

    #[must_use]
    pub fn high_water(&self) -> i64 {
        self.high_water
    }

    /// One poll cycle. Returns the number of rows applied.
    pub async fn poll_once(&mut self) -> usize {
        let registry = self.registry.clone();
        let since = self.high_water;
        let rows = match task::spawn_blocking(move || registry.changed_since(since))
            .await
            .expect("registry poll task panicked")
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%err, "registry poll failed, will retry next cycle");
                return 0;
            }
        };
        if rows.is_empty() {
            debug!(high_water = self.high_water, "no registry changes");
            return 0;
        }
        let new_high = apply(&self.table, &rows);
        if new_high > self.high_water {
            self.high_water = new_high;
        }
        info!(
            updates = rows.len(),
            high_water = self.high_water,
            "registry changes applied"
        );
        rows.len()
    }

    /// Sleep-then-poll loop. The cadence does not stretch with cycle
    /// duration, and the shutdown flag is honored before each poll.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        info!(interval_secs = self.interval.as_secs(), "syncer started");
        loop {
            tokio::time::sleep(self.interval).await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.poll_once().await;
        }
        info!("syncer stopped");
    }
}

//! Session statistics.
//!
//! A single `StatsKeeper` lives in the parent process. Thread-backend
//! workers record outcomes directly; process-backend workers publish
//! [`WorkerEvent`] messages over the event queue and the pool's listener
//! applies them. The controller runs a periodic task that logs a summary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::session::SessionOutcome;

/// Events flowing from worker processes back to the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum WorkerEvent {
    /// Statistics counters to add to the shared keeper.
    #[serde(rename = "statsdelta")]
    StatsDelta { total: u64, scantime: f64 },
    /// A worker announcing its current state string.
    #[serde(rename = "workerstate")]
    WorkerState { name: String, state: String },
}

#[derive(Debug)]
pub struct StatsKeeper {
    started: Instant,
    total: AtomicU64,
    /// Accumulated scan time in microseconds, to stay lock-free.
    scantime_micros: AtomicU64,
}

impl Default for StatsKeeper {
    fn default() -> Self {
        StatsKeeper {
            started: Instant::now(),
            total: AtomicU64::new(0),
            scantime_micros: AtomicU64::new(0),
        }
    }
}

impl StatsKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: &SessionOutcome) {
        self.increase(1, outcome.scantime);
    }

    pub fn increase(&self, total: u64, scantime: f64) {
        self.total.fetch_add(total, Ordering::Relaxed);
        self.scantime_micros
            .fetch_add((scantime * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Mean scan time over all recorded sessions, in seconds.
    pub fn average_scantime(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let micros = self.scantime_micros.load(Ordering::Relaxed);
        micros as f64 / 1_000_000.0 / total as f64
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn log_summary(&self) {
        tracing::info!(
            total = self.total(),
            avg_scantime = format!("{:.4}", self.average_scantime()),
            uptime_secs = self.uptime().as_secs(),
            "session statistics"
        );
    }
}

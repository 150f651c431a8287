// Copyright 2020 Joyent, Inc.

//! Timing and counters for one benchmark run.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_derive::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub requests_sent: u64,
    /// Complete frames received, whether or not they decoded.
    pub responses: u64,
    /// Decoded responses reporting an error.
    pub errors: u64,
    /// Heartbeat and other event frames.
    pub events: u64,
    pub decode_failures: u64,
    pub encode_failures: u64,
    pub reconnects: u32,
}

/// Start of a run. Wall-clock time for reporting, monotonic time for rates.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Timing {
    pub fn start() -> Timing {
        Timing {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finish(
        self,
        pipeline_depth: usize,
        total_requests: usize,
        stats: RunStats,
    ) -> RunReport {
        RunReport {
            started_at: self.started_at,
            finished_at: Utc::now(),
            elapsed: self.started.elapsed(),
            pipeline_depth,
            total_requests,
            stats,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub pipeline_depth: usize,
    pub total_requests: usize,
    pub stats: RunStats,
}

impl RunReport {
    /// Completed responses per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.stats.responses as f64 / secs
        } else {
            0.0
        }
    }
}

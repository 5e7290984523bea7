//! Cumulative byte counters kept for the lifetime of the process.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time read of the byte counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthMetrics {
    pub dashboard_bytes_in: u64,
    pub dashboard_bytes_out: u64,
    pub speedtest_bytes: u64,
    pub since_restart_at: DateTime<Utc>,
}

/// Lock-free counters. Increments never block and never contend with the
/// monitor's cache lock.
#[derive(Debug)]
pub struct BandwidthCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    speedtest_bytes: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Default for BandwidthCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthCounters {
    pub fn new() -> Self {
        Self {
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            speedtest_bytes: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn add_inbound(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_outbound(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_speed_test_bytes(&self, n: u64) {
        self.speedtest_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn snapshot(&self) -> BandwidthMetrics {
        BandwidthMetrics {
            dashboard_bytes_in: self.bytes_in.load(Ordering::Relaxed),
            dashboard_bytes_out: self.bytes_out.load(Ordering::Relaxed),
            speedtest_bytes: self.speedtest_bytes.load(Ordering::Relaxed),
            since_restart_at: self.started_at,
        }
    }
}

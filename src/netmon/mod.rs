//! Network monitor: status probes, segmented speed tests, byte counters.
//!
//! Probes run inline in the calling task. Network I/O happens outside the
//! cache lock; the write lock is held only to swap in the new result.

pub mod collab;
pub mod counters;
pub mod speedtest;
pub mod status;

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use crate::config::UpstreamConfig;

pub use self::counters::{BandwidthCounters, BandwidthMetrics};
pub use self::speedtest::{SegmentResult, SpeedTestResult, SpeedTester};
pub use self::status::{NetworkStatus, StatusChecker};

/// The upstream provider whose reachability and throughput are measured.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub name: String,
    pub host: String,
    pub health_url: String,
    pub speed_url: String,
}

impl From<&UpstreamConfig> for UpstreamTarget {
    fn from(cfg: &UpstreamConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            host: cfg.host.clone(),
            health_url: cfg.health_url.clone(),
            speed_url: cfg.speed_url.clone(),
        }
    }
}

pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[derive(Default)]
struct Cache {
    status: Option<Arc<NetworkStatus>>,
    speed_test: Option<Arc<SpeedTestResult>>,
}

pub struct Monitor {
    checker: StatusChecker,
    tester: SpeedTester,
    cache: RwLock<Cache>,
    counters: BandwidthCounters,
}

impl Monitor {
    pub fn new(checker: StatusChecker, tester: SpeedTester) -> Self {
        Self {
            checker,
            tester,
            cache: RwLock::new(Cache::default()),
            counters: BandwidthCounters::new(),
        }
    }

    /// Run a status check and cache it. Never fails; problems land in
    /// `last_error`.
    pub async fn probe_status(&self) -> Arc<NetworkStatus> {
        let status = Arc::new(self.checker.check().await);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .status = Some(status.clone());
        status
    }

    pub fn cached_status(&self) -> Option<Arc<NetworkStatus>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
            .clone()
    }

    /// Run the segmented speed test and cache it. The upstream segment needs a
    /// non-empty credential.
    pub async fn probe_speed_test(&self, credential: Option<&str>) -> Arc<SpeedTestResult> {
        let result = Arc::new(self.tester.run(credential, &self.counters).await);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .speed_test = Some(result.clone());
        result
    }

    pub fn last_speed_test(&self) -> Option<Arc<SpeedTestResult>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .speed_test
            .clone()
    }

    pub fn bandwidth(&self) -> BandwidthMetrics {
        self.counters.snapshot()
    }

    pub fn add_inbound(&self, n: u64) {
        self.counters.add_inbound(n);
    }

    pub fn add_outbound(&self, n: u64) {
        self.counters.add_outbound(n);
    }

    pub fn add_speed_test_bytes(&self, n: u64) {
        self.counters.add_speed_test_bytes(n);
    }

    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.counters.started_at()
    }

    /// Direct egress IP, empty when unresolved.
    pub async fn machine_ip(&self) -> String {
        self.checker.ip_resolver().machine_ip().await
    }
}

//! Segmented throughput test.
//!
//! Segment 1 measures local egress into the tunnel against a public speed
//! endpoint. Segment 2 measures from the tunnel to the upstream provider and
//! only runs with a provider credential. The segments are independent: a
//! missing segment in the result is the failure signal for that hop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::collab::{ClientProvider, IpResolver};
use super::counters::BandwidthCounters;
use super::{elapsed_ms, UpstreamTarget};

pub const EGRESS_SEGMENT_TIMEOUT: Duration = Duration::from_secs(30);
pub const UPSTREAM_SEGMENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentResult {
    pub speed_mbps: f64,
    /// Time to first byte (response headers).
    pub latency_ms: u64,
    pub bytes_transferred: u64,
    pub source_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_egress: Option<SegmentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<SegmentResult>,
    pub total_latency_ms: u64,
    pub tested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpeedTestResult {
    /// Segments that completed, in test order.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentResult> {
        self.local_egress.iter().chain(self.upstream.iter())
    }
}

/// Megabits per second; zero when nothing was transferred or no time passed.
pub fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if bytes == 0 || secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / secs / 1_000_000.0
}

struct Transfer {
    latency_ms: u64,
    bytes: u64,
    body_elapsed: Duration,
}

impl Transfer {
    fn speed_mbps(&self) -> f64 {
        throughput_mbps(self.bytes, self.body_elapsed)
    }
}

/// Timed GET. Every chunk is credited to the speed-test counter as it
/// arrives, so a transfer that fails midway still shows up in the totals.
async fn download(
    client: &Client,
    url: &str,
    timeout: Duration,
    bearer: Option<&str>,
    counters: &BandwidthCounters,
) -> Result<Transfer> {
    let mut req = client.get(url).timeout(timeout);
    if let Some(token) = bearer {
        req = req.bearer_auth(token);
    }

    let start = Instant::now();
    let mut resp = req.send().await?.error_for_status()?;
    let latency_ms = elapsed_ms(start);

    let body_start = Instant::now();
    let mut bytes = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        let n = chunk.len() as u64;
        counters.add_speed_test_bytes(n);
        bytes += n;
    }

    Ok(Transfer {
        latency_ms,
        bytes,
        body_elapsed: body_start.elapsed(),
    })
}

pub struct SpeedTester {
    ips: Arc<dyn IpResolver>,
    clients: Arc<dyn ClientProvider>,
    upstream: UpstreamTarget,
    egress_url: String,
}

impl SpeedTester {
    pub fn new(
        ips: Arc<dyn IpResolver>,
        clients: Arc<dyn ClientProvider>,
        upstream: UpstreamTarget,
        egress_url: impl Into<String>,
    ) -> Self {
        Self {
            ips,
            clients,
            upstream,
            egress_url: egress_url.into(),
        }
    }

    pub async fn run(&self, credential: Option<&str>, counters: &BandwidthCounters) -> SpeedTestResult {
        let mut result = SpeedTestResult {
            local_egress: None,
            upstream: None,
            total_latency_ms: 0,
            tested_at: Utc::now(),
            error: None,
        };

        match self.egress_segment(counters).await {
            Ok(seg) => result.local_egress = Some(seg),
            Err(e) => {
                warn!(error = %e, "Egress segment failed");
                result.error = Some(format!("egress: {}", e));
            }
        }

        if let Some(token) = credential.filter(|c| !c.is_empty()) {
            match self.upstream_segment(token, counters).await {
                Ok(seg) => result.upstream = Some(seg),
                Err(e) => {
                    warn!(provider = %self.upstream.name, error = %e, "Upstream segment failed");
                    if result.error.is_none() {
                        result.error = Some(format!("{}: {}", self.upstream.name, e));
                    }
                }
            }
        }

        result.total_latency_ms = result.segments().map(|s| s.latency_ms).sum();
        info!(
            egress_mbps = ?result.local_egress.as_ref().map(|s| s.speed_mbps),
            upstream_mbps = ?result.upstream.as_ref().map(|s| s.speed_mbps),
            total_latency_ms = result.total_latency_ms,
            "Speed test finished"
        );
        result
    }

    async fn egress_segment(&self, counters: &BandwidthCounters) -> Result<SegmentResult> {
        let client = self.clients.tunnel_forced_client();
        let t = download(&client, &self.egress_url, EGRESS_SEGMENT_TIMEOUT, None, counters).await?;

        let source_ip = self.ips.machine_ip().await;
        let dest_ip = self.ips.tunnel_ip().await.ok().filter(|ip| !ip.is_empty());

        Ok(SegmentResult {
            speed_mbps: t.speed_mbps(),
            latency_ms: t.latency_ms,
            bytes_transferred: t.bytes,
            source_ip,
            dest_ip,
        })
    }

    async fn upstream_segment(&self, token: &str, counters: &BandwidthCounters) -> Result<SegmentResult> {
        let client = self.clients.tunnel_forced_client();
        let t = download(
            &client,
            &self.upstream.speed_url,
            UPSTREAM_SEGMENT_TIMEOUT,
            Some(token),
            counters,
        )
        .await?;

        let source_ip = self.ips.tunnel_ip().await.unwrap_or_default();

        Ok(SegmentResult {
            speed_mbps: t.speed_mbps(),
            latency_ms: t.latency_ms,
            bytes_transferred: t.bytes,
            source_ip,
            dest_ip: Some(self.upstream.host.clone()),
        })
    }
}

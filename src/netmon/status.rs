//! Network status snapshot: which IP each egress presents, whether the tunnel
//! is carrying traffic, and whether the upstream provider answers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::collab::{fetch_ip, AsnInfo, AsnLookup, ClientProvider, IpResolver};
use super::{elapsed_ms, UpstreamTarget};

pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(10);

/// One status snapshot. Probe failures are carried in `last_error` (first one
/// wins) instead of failing the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub machine_ip: String,
    pub tunnel_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tunnel_asn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tunnel_org: String,
    pub tunnel_active: bool,
    pub upstream_ok: bool,
    pub upstream_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_seen_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// The tunnel is active only when it resolved to an address other than the
/// direct one.
pub fn is_tunnel_active(machine_ip: &str, tunnel_ip: &str) -> bool {
    !tunnel_ip.is_empty() && tunnel_ip != machine_ip
}

#[derive(Debug, Default)]
struct UpstreamCheck {
    ok: bool,
    latency_ms: u64,
    seen_ip: Option<String>,
    error: Option<String>,
}

pub struct StatusChecker {
    ips: Arc<dyn IpResolver>,
    clients: Arc<dyn ClientProvider>,
    asn: Arc<dyn AsnLookup>,
    upstream: UpstreamTarget,
    seen_ip_url: String,
}

impl StatusChecker {
    pub fn new(
        ips: Arc<dyn IpResolver>,
        clients: Arc<dyn ClientProvider>,
        asn: Arc<dyn AsnLookup>,
        upstream: UpstreamTarget,
        seen_ip_url: impl Into<String>,
    ) -> Self {
        Self {
            ips,
            clients,
            asn,
            upstream,
            seen_ip_url: seen_ip_url.into(),
        }
    }

    pub fn ip_resolver(&self) -> &Arc<dyn IpResolver> {
        &self.ips
    }

    /// Run every step in order: machine IP, tunnel IP, ASN, upstream.
    pub async fn check(&self) -> NetworkStatus {
        let machine_ip = self.ips.machine_ip().await;

        let mut last_error = None;
        let tunnel_ip = match self.ips.tunnel_ip().await {
            Ok(ip) => ip,
            Err(e) => {
                last_error = Some(format!("tunnel: {}", e));
                String::new()
            }
        };
        let tunnel_active = is_tunnel_active(&machine_ip, &tunnel_ip);

        let asn = if tunnel_ip.is_empty() {
            AsnInfo::default()
        } else {
            self.asn.lookup(&tunnel_ip).await.unwrap_or_default()
        };

        let upstream = self.check_upstream().await;
        if let Some(e) = upstream.error {
            if last_error.is_none() {
                last_error = Some(format!("{}: {}", self.upstream.name, e));
            }
        }

        let status = NetworkStatus {
            machine_ip,
            tunnel_ip,
            tunnel_asn: asn.asn,
            tunnel_org: asn.org,
            tunnel_active,
            upstream_ok: upstream.ok,
            upstream_latency_ms: upstream.latency_ms,
            upstream_seen_ip: upstream.seen_ip,
            last_error,
            checked_at: Utc::now(),
        };
        debug!(
            machine_ip = %status.machine_ip,
            tunnel_ip = %status.tunnel_ip,
            tunnel_active = status.tunnel_active,
            upstream_ok = status.upstream_ok,
            "Status check finished"
        );
        status
    }

    async fn check_upstream(&self) -> UpstreamCheck {
        let client = self.clients.tunnel_forced_client();

        let seen_ip = match fetch_ip(&client, &self.seen_ip_url).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                debug!(error = %e, "Could not resolve the IP seen upstream");
                None
            }
        };

        let start = Instant::now();
        let resp = match client
            .get(&self.upstream.health_url)
            .timeout(REACHABILITY_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return UpstreamCheck {
                    seen_ip,
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };
        let latency_ms = elapsed_ms(start);

        let status = resp.status();
        // Drain so the connection can go back to the pool.
        let _ = resp.bytes().await;

        UpstreamCheck {
            ok: status == StatusCode::OK,
            latency_ms,
            seen_ip,
            error: (status != StatusCode::OK).then(|| format!("unexpected status {}", status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netmon::testutil::{spawn_server, upstream_target, PlainClients, StaticAsn, StaticIps};
    use axum::{http::StatusCode as HttpStatus, routing::get, Router};
    use std::sync::atomic::Ordering;

    fn upstream_router(health: HttpStatus) -> Router {
        Router::new()
            .route("/time", get(move || async move { (health, "20261014T120000") }))
            .route("/ip", get(|| async { "104.28.0.9\n" }))
    }

    fn checker(ips: StaticIps, asn: Arc<StaticAsn>, base: &str) -> StatusChecker {
        StatusChecker::new(
            Arc::new(ips),
            Arc::new(PlainClients),
            asn,
            upstream_target(base),
            format!("{}/ip", base),
        )
    }

    #[test]
    fn test_tunnel_active_rule() {
        let cases = [
            ("1.1.1.1", "2.2.2.2", true),
            ("1.1.1.1", "1.1.1.1", false),
            ("1.1.1.1", "", false),
            ("", "", false),
            ("", "2.2.2.2", true),
        ];
        for (machine, tunnel, expected) in cases {
            assert_eq!(is_tunnel_active(machine, tunnel), expected, "{machine} / {tunnel}");
        }
    }

    #[tokio::test]
    async fn test_healthy_tunnel_and_upstream() {
        let base = spawn_server(upstream_router(HttpStatus::OK)).await;
        let asn = Arc::new(StaticAsn::new(Some(AsnInfo {
            asn: "AS13335".to_string(),
            org: "Cloudflare".to_string(),
        })));
        let status = checker(StaticIps::ok("203.0.113.5", "104.28.0.9"), asn.clone(), &base)
            .check()
            .await;

        assert_eq!(status.machine_ip, "203.0.113.5");
        assert_eq!(status.tunnel_ip, "104.28.0.9");
        assert!(status.tunnel_active);
        assert_eq!(status.tunnel_asn, "AS13335");
        assert_eq!(status.tunnel_org, "Cloudflare");
        assert!(status.upstream_ok);
        assert_eq!(status.upstream_seen_ip.as_deref(), Some("104.28.0.9"));
        assert!(status.last_error.is_none());
        assert_eq!(asn.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tunnel_failure_is_recorded_and_wins() {
        // Upstream is unreachable too, but the tunnel error came first.
        let asn = Arc::new(StaticAsn::new(None));
        let status = checker(
            StaticIps::tunnel_err("203.0.113.5", "connection refused"),
            asn.clone(),
            "http://127.0.0.1:9",
        )
        .check()
        .await;

        assert_eq!(status.machine_ip, "203.0.113.5");
        assert!(status.tunnel_ip.is_empty());
        assert!(!status.tunnel_active);
        assert!(!status.upstream_ok);
        let err = status.last_error.unwrap();
        assert!(err.starts_with("tunnel:"), "{err}");
        assert!(err.contains("connection refused"));
        // No tunnel IP means no ASN lookup.
        assert_eq!(asn.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_200_upstream_is_annotated() {
        let base = spawn_server(upstream_router(HttpStatus::SERVICE_UNAVAILABLE)).await;
        let status = checker(
            StaticIps::ok("203.0.113.5", "104.28.0.9"),
            Arc::new(StaticAsn::new(None)),
            &base,
        )
        .check()
        .await;

        assert!(status.tunnel_active);
        assert!(!status.upstream_ok);
        assert!(status.tunnel_asn.is_empty());
        let err = status.last_error.unwrap();
        assert!(err.starts_with("realdebrid: "), "{err}");
        assert!(err.contains("503"));
    }

    #[tokio::test]
    async fn test_same_ip_means_tunnel_inactive() {
        let base = spawn_server(upstream_router(HttpStatus::OK)).await;
        let status = checker(
            StaticIps::ok("203.0.113.5", "203.0.113.5"),
            Arc::new(StaticAsn::new(None)),
            &base,
        )
        .check()
        .await;

        assert!(!status.tunnel_active);
        assert!(status.upstream_ok);
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_status_json_round_trip() {
        let status = NetworkStatus {
            machine_ip: "203.0.113.5".to_string(),
            tunnel_ip: String::new(),
            tunnel_asn: String::new(),
            tunnel_org: String::new(),
            tunnel_active: false,
            upstream_ok: false,
            upstream_latency_ms: 0,
            upstream_seen_ip: None,
            last_error: Some("tunnel: timed out".to_string()),
            checked_at: Utc::now(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("tunnel_asn").is_none());
        assert!(json.get("upstream_seen_ip").is_none());

        let back: NetworkStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }
}

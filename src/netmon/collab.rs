//! Collaborators the probes depend on: IP resolution, tunnel-routed HTTP
//! clients, and ASN lookup. Each is a trait so probes can run against
//! fixtures, with reqwest-backed defaults for production.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

pub const IP_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const ASN_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves the public address presented on each egress path.
#[async_trait]
pub trait IpResolver: Send + Sync {
    /// Direct egress IP. Empty when it cannot be resolved.
    async fn machine_ip(&self) -> String;

    /// IP presented when routed through the tunnel.
    async fn tunnel_ip(&self) -> Result<String>;
}

/// Hands out HTTP clients. Clients are cheap handles over a shared pool and
/// are safe to use from concurrent probes.
pub trait ClientProvider: Send + Sync {
    /// Client that always routes through the configured tunnel.
    fn tunnel_forced_client(&self) -> Client;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AsnInfo {
    #[serde(rename = "as", default)]
    pub asn: String,
    #[serde(default)]
    pub org: String,
}

/// Best-effort autonomous-system lookup.
#[async_trait]
pub trait AsnLookup: Send + Sync {
    async fn lookup(&self, ip: &str) -> Option<AsnInfo>;
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TunnelClients {
    direct: Client,
    tunnel: Client,
}

impl TunnelClients {
    pub fn new(proxy_url: Option<&str>) -> Result<Self> {
        let direct = Client::builder()
            .no_proxy()
            .build()
            .context("Failed to build direct HTTP client")?;

        let tunnel = match proxy_url.filter(|u| !u.is_empty()) {
            Some(url) => {
                let proxy = reqwest::Proxy::all(url)
                    .with_context(|| format!("Invalid tunnel proxy URL '{}'", url))?;
                Client::builder()
                    .proxy(proxy)
                    .build()
                    .context("Failed to build tunnel HTTP client")?
            }
            None => {
                warn!("No tunnel proxy configured; tunnel-forced requests go out directly");
                direct.clone()
            }
        };

        Ok(Self { direct, tunnel })
    }

    pub fn direct_client(&self) -> Client {
        self.direct.clone()
    }
}

impl ClientProvider for TunnelClients {
    fn tunnel_forced_client(&self) -> Client {
        self.tunnel.clone()
    }
}

// ---------------------------------------------------------------------------
// IP resolution
// ---------------------------------------------------------------------------

/// GET a plain-text IP echo endpoint and validate the body.
pub async fn fetch_ip(client: &Client, url: &str) -> Result<String> {
    let body = client
        .get(url)
        .timeout(IP_RESOLVE_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let ip = body.trim();
    ip.parse::<IpAddr>()
        .with_context(|| format!("IP echo returned {:?}", ip))?;
    Ok(ip.to_string())
}

/// Resolves both addresses against the same echo URL, once directly and once
/// through the tunnel. The machine IP is resolved once and then reused.
pub struct HttpIpResolver {
    direct: Client,
    tunnel: Client,
    check_url: String,
    machine: OnceCell<String>,
}

impl HttpIpResolver {
    pub fn new(clients: &TunnelClients, check_url: impl Into<String>) -> Self {
        Self::with_clients(
            clients.direct_client(),
            clients.tunnel_forced_client(),
            check_url,
        )
    }

    pub fn with_clients(direct: Client, tunnel: Client, check_url: impl Into<String>) -> Self {
        Self {
            direct,
            tunnel,
            check_url: check_url.into(),
            machine: OnceCell::new(),
        }
    }
}

#[async_trait]
impl IpResolver for HttpIpResolver {
    async fn machine_ip(&self) -> String {
        match self
            .machine
            .get_or_try_init(|| fetch_ip(&self.direct, &self.check_url))
            .await
        {
            Ok(ip) => ip.clone(),
            Err(e) => {
                warn!(error = %e, "Failed to resolve machine IP");
                String::new()
            }
        }
    }

    async fn tunnel_ip(&self) -> Result<String> {
        fetch_ip(&self.tunnel, &self.check_url).await
    }
}

// ---------------------------------------------------------------------------
// ASN lookup
// ---------------------------------------------------------------------------

/// ip-api.com style lookup: `GET {base}/{ip}?fields=as,org`.
pub struct IpApiAsnLookup {
    client: Client,
    base_url: String,
}

impl IpApiAsnLookup {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn try_lookup(&self, ip: &str) -> Result<AsnInfo> {
        let url = format!("{}/{}?fields=as,org", self.base_url.trim_end_matches('/'), ip);
        let info = self
            .client
            .get(&url)
            .timeout(ASN_LOOKUP_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<AsnInfo>()
            .await?;
        Ok(info)
    }
}

#[async_trait]
impl AsnLookup for IpApiAsnLookup {
    async fn lookup(&self, ip: &str) -> Option<AsnInfo> {
        match self.try_lookup(ip).await {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(%ip, error = %e, "ASN lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netmon::testutil::{plain_client, spawn_server};
    use axum::{extract::Path, routing::get, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fetch_ip_trims_body() {
        let base = spawn_server(Router::new().route("/", get(|| async { "203.0.113.7\n" }))).await;
        let ip = fetch_ip(&plain_client(), &base).await.unwrap();
        assert_eq!(ip, "203.0.113.7");
    }

    #[tokio::test]
    async fn test_fetch_ip_rejects_non_ip_body() {
        let base = spawn_server(Router::new().route("/", get(|| async { "<html>captive</html>" }))).await;
        assert!(fetch_ip(&plain_client(), &base).await.is_err());
    }

    #[tokio::test]
    async fn test_machine_ip_is_resolved_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "198.51.100.1"
                }
            }),
        );
        let base = spawn_server(router).await;
        let resolver = HttpIpResolver::with_clients(plain_client(), plain_client(), base);

        assert_eq!(resolver.machine_ip().await, "198.51.100.1");
        assert_eq!(resolver.machine_ip().await, "198.51.100.1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The tunnel path is never cached.
        resolver.tunnel_ip().await.unwrap();
        resolver.tunnel_ip().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_machine_ip_failure_is_empty() {
        let resolver = HttpIpResolver::with_clients(
            plain_client(),
            plain_client(),
            "http://127.0.0.1:9/unreachable",
        );
        assert_eq!(resolver.machine_ip().await, "");
        assert!(resolver.tunnel_ip().await.is_err());
    }

    #[tokio::test]
    async fn test_asn_lookup_parses_fields() {
        let router = Router::new().route(
            "/json/{ip}",
            get(|Path(ip): Path<String>| async move {
                assert_eq!(ip, "104.28.0.1");
                Json(serde_json::json!({ "as": "AS13335 Cloudflare, Inc.", "org": "Cloudflare WARP" }))
            }),
        );
        let base = spawn_server(router).await;
        let lookup = IpApiAsnLookup::new(plain_client(), format!("{}/json/", base));

        let info = lookup.lookup("104.28.0.1").await.unwrap();
        assert_eq!(info.asn, "AS13335 Cloudflare, Inc.");
        assert_eq!(info.org, "Cloudflare WARP");
    }

    #[tokio::test]
    async fn test_asn_lookup_swallows_errors() {
        let router = Router::new().route("/json/{ip}", get(|| async { "not json" }));
        let base = spawn_server(router).await;
        let lookup = IpApiAsnLookup::new(plain_client(), format!("{}/json", base));
        assert!(lookup.lookup("104.28.0.1").await.is_none());
    }

    #[test]
    fn test_clients_build_with_and_without_proxy() {
        assert!(TunnelClients::new(Some("socks5h://127.0.0.1:1080")).is_ok());
        assert!(TunnelClients::new(Some("")).is_ok());
        assert!(TunnelClients::new(None).is_ok());
    }
}

//! tunnelmon -- network-health probe and multi-hop throughput tester.
//!
//! This crate reports which IP the server presents on its direct and
//! tunnelled egress, whether the upstream provider is reachable, and how fast
//! each hop is. Results are cached in a [`netmon::Monitor`] and persisted to
//! SQLite for history and retention-based pruning.

pub mod api;
pub mod config;
pub mod netmon;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::netmon::collab::{ClientProvider, HttpIpResolver, IpApiAsnLookup, IpResolver, TunnelClients};
use crate::netmon::{Monitor, SpeedTester, StatusChecker, UpstreamTarget};
use crate::storage::MetricsStore;

/// Wire the production collaborators into a monitor.
pub fn build_monitor(cfg: &MonitorConfig) -> Result<Monitor> {
    let clients = TunnelClients::new(cfg.tunnel.proxy_url.as_deref())?;
    let ips: Arc<dyn IpResolver> = Arc::new(HttpIpResolver::new(&clients, &cfg.probe.ip_check_url));
    let asn = Arc::new(IpApiAsnLookup::new(
        clients.direct_client(),
        &cfg.probe.asn_lookup_url,
    ));
    let clients: Arc<dyn ClientProvider> = Arc::new(clients);
    let upstream = UpstreamTarget::from(&cfg.upstream);

    let checker = StatusChecker::new(
        ips.clone(),
        clients.clone(),
        asn,
        upstream.clone(),
        &cfg.probe.seen_ip_url,
    );
    let tester = SpeedTester::new(ips, clients, upstream, &cfg.probe.egress_speed_url);
    Ok(Monitor::new(checker, tester))
}

/// Open the metrics database and drop records past the retention window.
pub fn open_store(cfg: &MonitorConfig) -> Result<MetricsStore> {
    info!(db_path = %cfg.server.db_path.display(), "Initializing database");
    let pool = storage::open_pool(&cfg.server.db_path)?;
    let store = MetricsStore::new(pool);

    match store.prune_older_than(cfg.retention.max_age()) {
        Ok(removed) => info!(removed, "Pruned expired metrics"),
        Err(e) => warn!(error = %e, "Failed to prune expired metrics"),
    }
    Ok(store)
}

/// Start the tunnelmon daemon: storage, monitor, and API server.
pub async fn serve(cfg: MonitorConfig) -> Result<()> {
    let store = open_store(&cfg)?;
    let monitor = Arc::new(build_monitor(&cfg)?);

    let state = api::state::AppState {
        monitor,
        store,
        upstream: Arc::new(cfg.upstream.clone()),
    };

    let addr: std::net::SocketAddr = cfg.server.bind.parse()?;
    let app = api::router(state);

    info!(%addr, "tunnelmon listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

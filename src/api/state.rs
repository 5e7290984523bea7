use std::sync::Arc;

use crate::config::UpstreamConfig;
use crate::netmon::Monitor;
use crate::storage::MetricsStore;

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor>,
    pub store: MetricsStore,
    pub upstream: Arc<UpstreamConfig>,
}

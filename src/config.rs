//! TOML configuration for tunnelmon.
//!
//! Lookup order: an explicit path, the `TUNNELMON_CONFIG` environment
//! variable, `/etc/tunnelmon/tunnelmon.toml`, then compiled-in defaults.
//! Every section is optional and missing keys take their default.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "TUNNELMON_CONFIG";
const SYSTEM_CONFIG_PATH: &str = "/etc/tunnelmon/tunnelmon.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration for the process.
    ///
    /// An explicit path must load; a broken env or system file only warns
    /// and falls through to the next source.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{} set but file could not be loaded, trying fallback",
                        CONFIG_ENV
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            db_path: PathBuf::from("data/tunnelmon.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tunnel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Proxy URL for the tunnel egress, e.g. `socks5h://127.0.0.1:1080`.
    /// Without one, tunnel-forced requests go out directly.
    pub proxy_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Probe endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Plain-text IP echo used for machine and tunnel IP resolution.
    pub ip_check_url: String,
    /// Plain-text IP echo used to learn the address the upstream provider sees.
    pub seen_ip_url: String,
    /// ASN lookup base; the IP and a field selector are appended.
    pub asn_lookup_url: String,
    /// Fixed-size download used for the local egress segment.
    pub egress_speed_url: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ip_check_url: "https://api.ipify.org".to_string(),
            seen_ip_url: "https://checkip.amazonaws.com".to_string(),
            asn_lookup_url: "http://ip-api.com/json".to_string(),
            egress_speed_url: "https://speed.cloudflare.com/__down?bytes=5000000".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Upstream provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Short name used as the error prefix, e.g. `realdebrid: timed out`.
    pub name: String,
    /// Host identifier reported as the destination of the upstream segment.
    pub host: String,
    pub health_url: String,
    pub speed_url: String,
    /// API tokens by user; `*` applies to everyone without their own entry.
    pub tokens: HashMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            name: "realdebrid".to_string(),
            host: "real-debrid.com".to_string(),
            health_url: "https://api.real-debrid.com/time".to_string(),
            speed_url: "https://real-debrid.com/speedtest".to_string(),
            tokens: HashMap::new(),
        }
    }
}

impl UpstreamConfig {
    pub fn token_for(&self, user: &str) -> Option<&str> {
        self.tokens
            .get(user)
            .or_else(|| self.tokens.get("*"))
            .map(String::as_str)
            .filter(|t| !t.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_age_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_hours: 7 * 24,
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_hours.saturating_mul(3600))
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

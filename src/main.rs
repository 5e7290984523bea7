use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tunnelmon::config::{LoggingConfig, MonitorConfig};

#[derive(Parser)]
#[command(
    name = "tunnelmon",
    about = "Network-health probe and multi-hop throughput tester for tunnelled egress",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one network status probe and print it as JSON
    Status {
        /// Do not persist the result
        #[arg(long)]
        no_save: bool,
    },

    /// Run the segmented speed test and print it as JSON
    SpeedTest {
        /// Upstream provider token (defaults to the configured `*` token)
        #[arg(long)]
        token: Option<String>,

        /// Do not persist the result
        #[arg(long)]
        no_save: bool,
    },

    /// Print persisted statuses and speed tests
    History {
        /// Window to show, e.g. 24h or 7d
        #[arg(long, default_value = "24h")]
        range: String,
    },

    /// Delete persisted records older than the retention window
    Prune {
        /// Override the configured retention, in hours
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = MonitorConfig::resolve(cli.config.as_deref())?;
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            tracing::info!(bind = %cfg.server.bind, "Starting tunnelmon daemon");
            tunnelmon::serve(cfg).await?;
        }
        Commands::Status { no_save } => {
            let monitor = tunnelmon::build_monitor(&cfg)?;
            let status = monitor.probe_status().await;
            if !no_save {
                let store = tunnelmon::open_store(&cfg)?;
                if let Err(e) = store.save_status(&status) {
                    tracing::warn!(error = %e, "Failed to persist network status");
                }
            }
            println!("{}", serde_json::to_string_pretty(status.as_ref())?);
        }
        Commands::SpeedTest { token, no_save } => {
            let monitor = tunnelmon::build_monitor(&cfg)?;
            let token = token
                .as_deref()
                .or_else(|| cfg.upstream.token_for("*"));
            tracing::info!(upstream = token.is_some(), "Running speed test");
            let result = monitor.probe_speed_test(token).await;
            if !no_save {
                let store = tunnelmon::open_store(&cfg)?;
                if let Err(e) = store.save_speed_test(&result) {
                    tracing::warn!(error = %e, "Failed to persist speed test result");
                }
            }
            println!("{}", serde_json::to_string_pretty(result.as_ref())?);
        }
        Commands::History { range } => {
            let window = tunnelmon::storage::parse_window(&range)
                .with_context(|| format!("Invalid range '{}', expected e.g. 24h or 7d", range))?;
            let store = tunnelmon::open_store(&cfg)?;
            let history = serde_json::json!({
                "statuses": store.recent_statuses(window)?,
                "speed_tests": store.recent_speed_tests(window)?,
            });
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Commands::Prune { older_than_hours } => {
            let age = older_than_hours
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))
                .unwrap_or_else(|| cfg.retention.max_age());
            let pool = tunnelmon::storage::open_pool(&cfg.server.db_path)?;
            let removed = tunnelmon::storage::MetricsStore::new(pool).prune_older_than(age)?;
            println!("Removed {} record(s) older than {}h.", removed, age.as_secs() / 3600);
        }
    }

    Ok(())
}

//! VTON Cache Server
//!
//! Serves preprocessing and try-on generation over HTTP, backed by the
//! tiered preprocessing cache.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        VTON Cache Server                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    hyper     │───▶│ TryOnService │───▶│ TieredCache  │       │
//! │  │   routes     │    │              │    │  L1 → L2     │       │
//! │  └──────────────┘    └──────┬───────┘    └──────────────┘       │
//! │                             ▼                                    │
//! │                 GenerationGate → generator                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vton_cache::cache::{
    CacheConfig, GuardConfig, InMemoryOriginStore, L2Config, LocalOriginStore, OriginClient, OriginStore,
    TieredCache,
};
use vton_cache::error::{Error, Result};
use vton_cache::generation::{GateConfig, GenerationGate};
use vton_cache::models::{ModelSet, ReferenceConfig};
use vton_cache::server::{self, ServerConfig};
use vton_cache::service::{ServiceConfig, TryOnService};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

// =============================================================================
// CLI Arguments
// =============================================================================

/// VTON Cache - tiered preprocessing cache for virtual try-on
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP bind address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8001")]
    listen_addr: String,

    /// Root directory of the disk tier
    #[arg(long, env = "L2_ROOT", default_value = "/var/cache/vton/l2")]
    l2_root: String,

    /// Disk tier quota in GiB
    #[arg(long, env = "L2_QUOTA_GB", default_value = "50")]
    l2_quota_gb: f64,

    /// Fraction of the quota a sweep trims usage down to
    #[arg(long, env = "L2_TARGET_RATIO", default_value = "0.5")]
    l2_target_ratio: f64,

    /// Age in seconds after which an abandoned L2 staging directory is reclaimed
    #[arg(long, env = "L2_STALE_AFTER_SECS", default_value = "3600")]
    l2_stale_after_secs: u64,

    /// L1 capacity of each human-body family
    #[arg(long, env = "L1_MAX_USERS", default_value = "10")]
    l1_max_users: usize,

    /// L1 capacity of the garment and text families
    #[arg(long, env = "L1_MAX_GARMENTS", default_value = "100")]
    l1_max_garments: usize,

    /// Base L1 TTL in hours
    #[arg(long, env = "CACHE_TTL_HOURS", default_value = "24")]
    ttl_hours: u64,

    /// Longest a request waits on another request's load of the same key
    #[arg(long, env = "STAMPEDE_WAIT_SECS", default_value = "30")]
    stampede_wait_secs: u64,

    /// Per-key lock registry size that triggers an idle sweep
    #[arg(long, env = "LOCK_SWEEP_THRESHOLD", default_value = "4096")]
    lock_sweep_threshold: usize,

    /// Generation queue timeout in seconds (0 waits forever)
    #[arg(long, env = "GENERATION_TIMEOUT_SECS", default_value = "120")]
    generation_timeout_secs: u64,

    /// Directory backing the origin store (in-memory when unset)
    #[arg(long, env = "ORIGIN_DIR")]
    origin_dir: Option<String>,

    /// Seconds between maintenance passes
    #[arg(long, env = "MAINTENANCE_INTERVAL_SECS", default_value = "300")]
    maintenance_interval_secs: u64,

    /// Request body limit in MiB
    #[arg(long, env = "MAX_BODY_MB", default_value = "32")]
    max_body_mb: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn cache_config(&self) -> Result<CacheConfig> {
        if !(self.l2_target_ratio > 0.0 && self.l2_target_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "l2-target-ratio must be in (0, 1], got {}",
                self.l2_target_ratio
            )));
        }
        if self.l2_quota_gb < 0.0 {
            return Err(Error::Config(format!("l2-quota-gb must not be negative, got {}", self.l2_quota_gb)));
        }

        Ok(CacheConfig {
            l1_max_users: self.l1_max_users,
            l1_max_garments: self.l1_max_garments,
            base_ttl: CacheConfig::base_ttl_from_hours(self.ttl_hours)?,
            l2: L2Config {
                root: self.l2_root.clone().into(),
                quota_bytes: (self.l2_quota_gb * GIB) as u64,
                target_ratio: self.l2_target_ratio,
                stale_after: Duration::from_secs(self.l2_stale_after_secs),
            },
            guard: GuardConfig {
                wait_timeout: Duration::from_secs(self.stampede_wait_secs),
                sweep_threshold: self.lock_sweep_threshold,
            },
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting VTON cache server");
    info!("  Listen address: {}", args.listen_addr);
    info!("  L2 root: {} (quota {} GiB)", args.l2_root, args.l2_quota_gb);
    info!(
        "  L1 capacity: {} per human family, {} garment/text",
        args.l1_max_users, args.l1_max_garments
    );
    info!("  Generation queue timeout: {}s", args.generation_timeout_secs);

    let cache = Arc::new(TieredCache::open(args.cache_config()?).map_err(|e| {
        error!("Failed to open cache: {}", e);
        e
    })?);

    let store: Arc<dyn OriginStore> = match &args.origin_dir {
        Some(dir) => {
            info!("  Origin: directory {}", dir);
            Arc::new(LocalOriginStore::new(dir)?)
        }
        None => {
            info!("  Origin: in-memory (not persisted)");
            Arc::new(InMemoryOriginStore::new())
        }
    };

    let gate = GenerationGate::with_config(GateConfig::from_secs(args.generation_timeout_secs));
    let service = Arc::new(TryOnService::new(
        cache,
        OriginClient::new(store),
        ModelSet::reference(ReferenceConfig::default()),
        gate,
        ServiceConfig::default(),
    ));

    let shutdown = CancellationToken::new();

    // Maintenance loop
    let maintenance = tokio::spawn(run_maintenance(
        service.clone(),
        Duration::from_secs(args.maintenance_interval_secs.max(1)),
        shutdown.clone(),
    ));

    // Ctrl-C
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let config = ServerConfig {
        addr: args.listen_addr.clone(),
        max_body_bytes: args.max_body_mb * 1024 * 1024,
    };
    let served = server::serve(&config, service, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = maintenance.await {
        error!("Maintenance task panicked: {}", e);
    }

    info!("Server shutdown complete");
    served
}

// =============================================================================
// Maintenance
// =============================================================================

async fn run_maintenance(service: Arc<TryOnService>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it so startup is not a sweep.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = service.maintenance().await;
                info!(
                    l2_records_removed = report.l2_sweep.records_removed,
                    l2_bytes_removed = report.l2_sweep.bytes_removed,
                    l2_stale_reclaimed = report.l2_stale_reclaimed,
                    lock_slots_swept = report.lock_slots_swept,
                    "Maintenance pass complete"
                );
            }
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

//! Repligate - S3-compatible replicating reverse proxy
//!
//! Clients speak plain S3 against one logical endpoint; the proxy fans
//! every request out to the replicas of a consistent-hash-picked shard,
//! records write intents in a durable consistency log, and runs a
//! background reconciler that repairs replicas that missed a write.

mod metrics;
mod proxy;
mod setup;
mod technical;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use metrics::ProxyMetrics;
use proxy::AppState;
use repligate_common::ProxyConfig;
use repligate_reconciler::{
    MigrationExecutor, Reconciler, ReconcilerConfig, S3VersionFetcher, WalFilter,
};
use repligate_sharding::{Authenticator, RegionRouter};
use repligate_watchdog::{ConsistencyLog, RedbConsistencyLog};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "repligate-proxy")]
#[command(about = "S3-compatible replicating reverse proxy")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/repligate/config.yaml")]
    config: String,

    /// Storage name under which the proxy's own credentials are filed
    #[arg(long, default_value = "repligate")]
    service_name: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(path: &str) -> Result<ProxyConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {path}"))?;
    let config = ProxyConfig::from_yaml(&text).context("parsing config")?;
    config.validate().context("validating config")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Repligate proxy");

    // A config problem at startup is fatal (non-zero exit)
    let config = load_config(&args.config)?;
    let body_max_size = config.body_max_size_bytes().context("parsing body_max_size")?;

    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(config.client.connect_timeout_ms))
        .pool_max_idle_per_host(config.client.idle_per_host)
        .build()
        .context("building backend HTTP client")?;

    let store = setup::build_credential_store(&config)?;
    let log: Arc<dyn ConsistencyLog> = Arc::new(
        RedbConsistencyLog::open(&config.watchdog.log_path)
            .with_context(|| format!("opening consistency log at {:?}", config.watchdog.log_path))?,
    );
    info!("Consistency log at {:?}", config.watchdog.log_path);

    let regions = setup::build_regions(&config, &store, &log, &http_client)?;
    info!("Serving {} domain(s)", regions.len());
    let router = Arc::new(RegionRouter::new(regions));

    let metrics = Arc::new(ProxyMetrics::new());
    let authenticator = Arc::new(Authenticator::new(Arc::clone(&store), &args.service_name));

    // Background reconciler
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reconciler = Reconciler::new(
        ReconcilerConfig {
            scan_interval: Duration::from_millis(config.watchdog.scan_interval_ms),
            lanes: config.watchdog.worker_lanes,
            ..ReconcilerConfig::default()
        },
        Arc::clone(&log),
        WalFilter::new(
            Arc::clone(&router),
            Arc::new(S3VersionFetcher::new(
                http_client.clone(),
                config.watchdog.object_version_header_name.clone(),
            )),
            Arc::clone(&store),
        ),
        MigrationExecutor::new(
            http_client.clone(),
            config.watchdog.object_version_header_name.clone(),
            config.watchdog.migration_concurrency,
        ),
    );
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx));
    info!(
        "Reconciler running: scan every {}ms, {} lane(s)",
        config.watchdog.scan_interval_ms, config.watchdog.worker_lanes
    );

    // Config reload on SIGHUP swaps the routing layer in place
    spawn_reload_task(
        args.config.clone(),
        Arc::clone(&router),
        Arc::clone(&store),
        Arc::clone(&log),
        http_client.clone(),
    );

    // Technical listener
    let technical_addr: SocketAddr = config.technical_endpoint_listen.parse()?;
    let technical_app = technical::technical_router(Arc::clone(&metrics));
    let technical_listener = TcpListener::bind(technical_addr)
        .await
        .with_context(|| format!("binding technical endpoint {technical_addr}"))?;
    info!("Technical endpoint on {technical_addr}");
    tokio::spawn(async move {
        if let Err(error) = axum::serve(technical_listener, technical_app).await {
            tracing::error!(%error, "technical endpoint failed");
        }
    });

    // Client listener
    let state = Arc::new(AppState {
        router,
        authenticator,
        body_max_size,
        metrics,
    });
    let app = Router::new()
        .fallback(proxy::proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config.listen.parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding listen address {addr}"))?;
    info!("Accepting S3 requests on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    // Stop the reconciler and wait for its lanes to drain
    shutdown_tx.send(true).ok();
    reconciler_handle.await.ok();

    info!("Proxy shut down gracefully");
    Ok(())
}

/// Reload the config on SIGHUP and atomically publish the new region map
fn spawn_reload_task(
    config_path: String,
    router: Arc<RegionRouter>,
    store: Arc<dyn repligate_auth::CredentialStore>,
    log: Arc<dyn ConsistencyLog>,
    http_client: reqwest::Client,
) {
    tokio::spawn(async move {
        let Ok(mut hangup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            tracing::warn!("cannot install SIGHUP handler, config reload disabled");
            return;
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading configuration");
            match load_config(&config_path) {
                Ok(config) => {
                    match setup::build_regions(&config, &store, &log, &http_client) {
                        Ok(regions) => {
                            router.replace(regions);
                            info!(
                                generation = router.generation(),
                                "new region map published"
                            );
                        }
                        Err(error) => {
                            tracing::error!(%error, "reload failed, keeping the old map")
                        }
                    }
                }
                Err(error) => tracing::error!(%error, "reload failed, keeping the old map"),
            }
        }
    });
}

//! homedns
//!
//! A small DNS server for home and lab networks: answers from a local record
//! file, forwards everything else to one upstream and caches the answers.

use std::sync::Arc;

use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use homedns::{
    cache::{run_sweeper, DnsCache},
    config::{ServerConfig, SettingsHandle},
    db::RecordStore,
    errors::DnsError,
    forwarder::Forwarder,
    resolver::QueryPipeline,
    server::Server,
    stats::Stats,
};

#[tokio::main]
async fn main() -> Result<(), DnsError> {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    // Load the settings file and environment overrides
    let (config, config_path) = ServerConfig::from_env()?;
    info!("Using settings from {}", config_path.display());

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| DnsError::Config(format!("Failed to start metrics exporter: {e}")))?;
        info!("Metrics exporter listening on {}", addr);
    }

    let files = config.file_locations.clone();
    let records = Arc::new(RecordStore::open(files.dnsrecords_file.clone())?);

    let cache = Arc::new(DnsCache::new(config.cache_capacity));
    match cache.load(&files.cache_file) {
        Ok(restored) => info!("Restored {} cached records", restored),
        Err(e) => warn!("Ignoring cache snapshot: {}", e),
    }

    let settings = Arc::new(SettingsHandle::new(config, Some(config_path))?);
    let pipeline = QueryPipeline::new(
        records,
        cache.clone(),
        settings,
        Arc::new(Forwarder::new()),
        Arc::new(Stats::new()),
    );

    // Set up cache cleanup task
    let sweeper_shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(run_sweeper(
        cache.clone(),
        Some(files.cache_file.clone()),
        sweeper_shutdown.clone(),
    ));

    let server = Server::new(pipeline);
    server.start().await?;

    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Initiating graceful shutdown...");

    server.stop().await;
    sweeper_shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Cache sweeper failed: {}", e);
    }
    if let Err(e) = cache.save(&files.cache_file) {
        warn!("Failed to save cache snapshot: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}

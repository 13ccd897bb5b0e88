//! # mdx-runner
//!
//! Main entry point for the market-data publisher.
//!
//! Loads a JSON configuration file, creates the shared book caches and symbol
//! tables, starts one market-data thread per configured source and serves
//! the consumer control channel until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! mdx-runner config.json --log-level info
//! ```

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use mdx_pub::{
    CacheRegistry, ControlChannel, MarketDataSource, Publisher, PublisherSettings, SourceHandle, feed::StaticFeed,
};
use tracing::{error, info};

/// Shared-memory market-data publisher.
#[derive(Parser)]
#[command(name = "mdx-runner", about = "Shared-memory market-data publisher")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output; overrides `module.log_path`.
    #[arg(long)]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = mdx_core::config::load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    // 2. Initialize logging (guard flushes the file writer on exit)
    let log_dir = cli.log_dir.clone().or_else(|| config.log_path());
    let _log_guard = mdx_core::logging::init_logging(&cli.log_level, log_dir.as_deref(), &config.module_name());

    info!(
        "mdx-runner starting, config={} log_level={} - {} cache(s), {} source(s)",
        cli.config.display(),
        cli.log_level,
        config.book_caches.len(),
        config.sources.len()
    );

    // 3. Book caches and symbol tables
    let shm_dir = config.publisher.effective_shm_dir();
    let registry = CacheRegistry::from_config(&config, Path::new(&shm_dir))?;

    // 4. One market-data thread per source; source i owns data queue i
    let stop = Arc::new(AtomicBool::new(false));
    let heartbeat_ms = config.publisher.effective_heartbeat_interval_ms();
    let mut handles: Vec<SourceHandle> = Vec::new();
    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    for (idx, source_cfg) in config.sources.iter().enumerate() {
        let queue_index =
            u8::try_from(idx).ok().filter(|&i| i < mdx_core::protocol::STREAM_ID_CONTROL).ok_or_else(|| {
                anyhow!("too many sources: data queue index {idx} collides with the control stream id")
            })?;
        let entry = registry
            .get(source_cfg.exchange)
            .ok_or_else(|| anyhow!("source[{idx}]: exchange {} has no book cache", source_cfg.exchange))?;
        let feed = StaticFeed::new(format!("source{idx}-ex{}", source_cfg.exchange), &source_cfg.instruments);
        let (source, handle) = MarketDataSource::new(source_cfg, queue_index, feed, entry, heartbeat_ms);

        let stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name(format!("md-{}", source_cfg.exchange))
            .spawn(move || source.run(stop))
            .with_context(|| format!("spawning market-data thread for source[{idx}]"))?;
        info!("source[{idx}]: exchange {} on queue {queue_index}", source_cfg.exchange);
        handles.push(handle);
        threads.push(thread);
    }

    // 5. Control channel
    let publisher = Publisher::new(PublisherSettings::from(&config.publisher), Arc::new(registry), handles);
    let mut control = ControlChannel::start(config.publisher.listen_addr()?, publisher).await?;
    info!("control channel on {} - press Ctrl+C to stop", control.local_addr());

    // 6. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // 7. Stop the control plane first so consumers are dropped cleanly
    control.stop().await;
    stop.store(true, Ordering::Relaxed);
    for thread in threads {
        if thread.join().is_err() {
            error!("market-data thread panicked");
        }
    }

    info!("all sources stopped, goodbye");
    Ok(())
}

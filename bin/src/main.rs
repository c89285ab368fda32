#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use coordination::{CoordinationBackend, MEMORY_SCHEME, MemoryCoordinator};
use discovery::DiscoveryConfig;
use tokio::{runtime::Builder, signal};
use tracing::*;

mod config;

use config::{cli, trace};

fn main() -> Result<()> {
    // parses from cli or environment var, after loading .env
    let (config, dotenv) = cli::Config::load_from(std::env::args_os());
    let trace_config = trace::Config::parse(&config.macondo_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start macondo"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!(path = %config.config_path.display(), "parsing discovery config");
    let discovery_cfg = DiscoveryConfig::parse(&config.config_path)
        .with_context(|| format!("failed to load {}", config.config_path.display()))?;
    let backend = backend_for(&discovery_cfg)?;

    let discovery = discovery::from_config(discovery_cfg, backend);
    discovery
        .start()
        .await
        .context("discovery failed to start")?;
    discovery.on_ready().await;
    info!(state = %discovery.state(), "macondo running, waiting for ctrl-c");

    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    info!("shutting down");
    discovery.stop().await;
    log_metrics();
    ret
}

fn log_metrics() {
    match discovery::metrics::encode_text() {
        Ok(text) => info!(metrics = %text, "final discovery metrics"),
        Err(err) => error!(?err, "error text encoding prometheus metrics"),
    }
}

/// Pick the backend serving `coordination.url`. Disabled or incomplete configs
/// get the in-process backend; `start` reports what is missing.
fn backend_for(cfg: &DiscoveryConfig) -> Result<Arc<dyn CoordinationBackend>> {
    let url = cfg.coordination.url.as_deref().unwrap_or_default().trim();
    if !cfg.is_enabled() || url.is_empty() || url.starts_with(MEMORY_SCHEME) {
        return Ok(Arc::new(MemoryCoordinator::new()));
    }
    #[cfg(feature = "etcd")]
    {
        if url.starts_with(coordination::ETCD_SCHEME) {
            return Ok(Arc::new(coordination::EtcdBackend::new()));
        }
    }
    Err(anyhow!("no coordination backend for url '{url}'"))
}

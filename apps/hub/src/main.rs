mod analytics;
mod config;
mod errors;
mod http;
mod indexer;
mod logs;
mod metrics;
mod registry;
mod supervisor;
mod telemetry;

use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Arc::new(config::load_config()?);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let telemetry = metrics::HubTelemetry::new();

    tracing::info!("hub starting");
    tracing::info!(
        bind_addr = %cfg.bind_addr,
        rpc_url = %cfg.chain_rpc_url,
        entry_point = %cfg.entry_point,
        paymaster = %cfg.paymaster,
        "config loaded"
    );

    let url: Url = cfg.chain_rpc_url.parse().context("parse chain rpc url")?;
    let provider = DynProvider::new(ProviderBuilder::new().connect_http(url));
    provider.get_chain_id().await.context("eth_chainId")?;

    let registry = Arc::new(registry::Registry::new());
    let (log_store, log_writer) = logs::LogStore::new(&cfg.data_dir, cfg.log_ring_capacity).await?;
    let logs = Arc::new(log_store);
    let telemetry_store = Arc::new(telemetry::TelemetryStore::new(cfg.active_session_window));
    let analytics = Arc::new(analytics::AnalyticsStore::new(cfg.analytics_cap));
    let supervisor = Arc::new(supervisor::Supervisor::new(
        cfg.clone(),
        registry.clone(),
        logs.clone(),
        telemetry.clone(),
    ));
    let indexer = indexer::Indexer::new(cfg.clone(), provider.clone(), analytics.clone(), telemetry.clone());

    let http_state = http::AppState {
        cfg: cfg.clone(),
        registry: registry.clone(),
        supervisor: supervisor.clone(),
        logs: logs.clone(),
        telemetry: telemetry_store.clone(),
        analytics: analytics.clone(),
        metrics: telemetry.clone(),
        provider: provider.clone(),
        started_at_ms: now_ms(),
    };

    let shutdown = CancellationToken::new();

    let mut join_set: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();
    join_set.spawn(log_writer);
    {
        let shutdown = shutdown.clone();
        join_set.spawn(async move { indexer.run(shutdown).await });
    }
    {
        let supervisor = supervisor.clone();
        let shutdown = shutdown.clone();
        join_set.spawn(async move { supervisor.run_health_probe_loop(shutdown).await });
    }
    {
        let shutdown = shutdown.clone();
        join_set.spawn(async move { http::serve(http_state, shutdown).await });
    }

    tracing::info!("hub started");

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown requested");
        },
        res = join_set.join_next() => {
            if let Some(res) = res {
                let res = res.context("hub task panicked")?;
                match res {
                    Ok(()) => fatal = Some(anyhow::anyhow!("hub task exited unexpectedly")),
                    Err(e) => fatal = Some(e.context("hub task failed")),
                }
            }
        }
    }

    shutdown.cancel();

    while let Some(res) = join_set.join_next().await {
        let res = res.context("hub task panicked")?;
        if let Err(e) = res {
            fatal.get_or_insert_with(|| e.context("hub task failed"));
        }
    }

    fatal.map_or(Ok(()), Err)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("ctrl-c")?;
        Ok(())
    }
}

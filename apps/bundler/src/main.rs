mod admission;
mod bundler;
mod config;
mod errors;
mod mempool;
mod metrics;
mod observability;
mod receipts;
mod rpc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = config::load_config()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let telemetry = metrics::BundlerTelemetry::new();

    tracing::info!("bundler starting");
    tracing::info!(
        instance_id = %cfg.instance_id,
        rpc_url = %cfg.chain_rpc_url,
        entry_point = %cfg.entry_point,
        strict = cfg.strict,
        "config loaded"
    );

    let shutdown = CancellationToken::new();
    let engine = bundler::Engine::new(cfg, telemetry).await?;
    engine
        .observability
        .emit_startup(&engine.config.instance_id);

    let mut join_set: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();
    {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        join_set.spawn(async move { engine.run_bundling_loop(shutdown).await });
    }
    {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        join_set.spawn(async move { rpc::serve(engine, shutdown).await });
    }

    tracing::info!("bundler started");

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown requested");
        },
        res = join_set.join_next() => {
            if let Some(res) = res {
                let res = res.context("bundler task panicked")?;
                match res {
                    Ok(()) => fatal = Some(anyhow::anyhow!("bundler task exited unexpectedly")),
                    Err(e) => fatal = Some(e.context("bundler task failed")),
                }
            }
        }
    }

    shutdown.cancel();

    while let Some(res) = join_set.join_next().await {
        let res = res.context("bundler task panicked")?;
        if let Err(e) = res {
            fatal.get_or_insert_with(|| e.context("bundler task failed"));
        }
    }

    fatal.map_or(Ok(()), Err)
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

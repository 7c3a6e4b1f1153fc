//! `tollgated`: one paywalled site, one process.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tollgate_server::config::Config;
use tollgate_server::context::AppContext;
use tollgate_server::notify::NotificationHub;
use tollgate_server::{routes, tasks};

/// Self-hosted static-site publisher that gates content behind
/// per-request micropayments.
#[derive(Parser)]
#[command(name = "tollgated", version)]
struct Args {
    /// Path to the site's JSON configuration document.
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let cancel = CancellationToken::new();
    let hub = Arc::new(NotificationHub::new());
    let ctx = AppContext::open(config, hub).context("failed to open site")?;

    let background = tasks::spawn_all(&ctx, &cancel);

    let listener = tokio::net::TcpListener::bind(ctx.config.listen)
        .await
        .with_context(|| format!("failed to bind {}", ctx.config.listen))?;
    tracing::info!(
        "worker {} serving {} on {}",
        ctx.config.worker_id,
        ctx.config.domain,
        ctx.config.listen
    );

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutting down");
            cancel.cancel();
        }
    };

    axum::serve(listener, routes::router(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;

    cancel.cancel();
    for task in background {
        let _ = task.await;
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

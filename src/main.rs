//! modelswap - on-demand model swapping for local inference servers
//!
//! Loads the YAML config, builds the proxy stack, and serves it. SIGHUP
//! re-reads the config file and applies it without dropping compatible
//! running backends.

use anyhow::{Context, Result};
use clap::Parser;
use modelswap::{Config, ConfigFileChangedEvent, RingLogger, build_app};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "modelswap")]
#[command(about = "On-demand model swapping reverse proxy for local inference servers")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The proxy log ring doubles as a tracing writer so /api/events can
    // replay recent proxy logs to new clients.
    let proxy_log = RingLogger::new();

    let filter = if args.verbose {
        EnvFilter::new("modelswap=debug,upstream=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(proxy_log.clone()),
        )
        .init();

    info!("starting modelswap");

    let mut config = Config::load(&args.config)
        .await
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    info!(
        models = ?config.models.keys().collect::<Vec<_>>(),
        listen = %config.listen,
        "configuration loaded"
    );

    let listen = config.listen.clone();
    let metrics_port = config.metrics_port;

    let (app, metrics_router, pm) = build_app(config, proxy_log)
        .await
        .context("failed to build application")?;

    if let (Some(port), Some(metrics_router)) = (metrics_port, metrics_router) {
        let metrics_addr = format!("0.0.0.0:{port}");
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("failed to bind metrics to {metrics_addr}"))?;
        info!(addr = %metrics_addr, "serving metrics");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                tracing::error!(error = %e, "metrics server error");
            }
        });
    }

    // SIGHUP reloads the config file and hot-applies it.
    #[cfg(unix)]
    {
        let pm = pm.clone();
        let config_path = args.config.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let Ok(mut hangup) = signal(SignalKind::hangup()) else {
                return;
            };
            while hangup.recv().await.is_some() {
                match Config::load(&config_path).await {
                    Ok(new_config) => {
                        pm.apply_config(new_config).await;
                        pm.bus().publish_config_changed(ConfigFileChangedEvent);
                        info!("configuration reloaded");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "config reload failed, keeping previous config");
                    }
                }
            }
        });
    }

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind to {listen}"))?;
    info!(addr = %listen, "listening for requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    pm.shutdown().await;
    Ok(())
}

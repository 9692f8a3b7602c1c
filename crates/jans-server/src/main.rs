//! # Janssen authentication engine
//!
//! Main entry point.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use jans_reload::ConfigSnapshot;
use jans_server::{telemetry, ConfigWatcher, Engine, ServerArgs};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::from_env();

    let text = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("cannot read {}", args.config.display()))?;
    let snapshot = ConfigSnapshot::from_toml_str(&text)
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;
    if args.check {
        println!("{}: configuration is valid", args.config.display());
        return Ok(());
    }

    let log = telemetry::init(&snapshot.logging, args.log_format.map(Into::into))?;
    tracing::info!(config = %args.config.display(), "Janssen engine starting");

    let engine = Engine::builder(snapshot)
        .log_control(Arc::new(log))
        .start()
        .await?;

    let watcher = Arc::new(ConfigWatcher::new(
        &args.config,
        engine.coordinator().clone(),
        args.watch_interval(),
    ));
    watcher.mark_applied(text);
    let (stop, stopped) = watch::channel(false);
    let watch_task = {
        let watcher = Arc::clone(&watcher);
        tokio::spawn(async move { watcher.run(stopped).await })
    };

    shutdown_signal().await;
    tracing::info!("shutting down");

    let _ = stop.send(true);
    if let Err(e) = watch_task.await {
        tracing::warn!(error = %e, "configuration watcher ended abnormally");
    }
    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

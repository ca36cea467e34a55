//! furlongd: deterministic race simulation and broadcast daemon.
//!
//! Startup: read options from the environment, assemble the engine, spawn
//! the cycle driver, serve HTTP + WebSocket subscribers.
//!
//! Shutdown ordering on SIGINT/SIGTERM: stop the tick loop at its next
//! boundary, then close subscriber connections, then let the in-flight
//! persistence finish.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use furlong_server::options::EngineOptions;
use furlong_server::{http, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = EngineOptions::from_env();
    let bind_addr = options.bind_addr;
    let engine = Arc::new(Engine::new(options).context("engine init")?);

    let (driver_stop, driver_stop_rx) = watch::channel(false);
    let driver = engine.driver();
    let driver_task = tokio::spawn(async move { driver.run(driver_stop_rx).await });

    let (server_stop, mut server_stop_rx) = watch::channel(false);
    let app = http::router(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    info!(addr = %bind_addr, "furlongd listening");

    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_stop_rx.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    info!("shutdown requested");

    // Tick loop first: no further frames after the next boundary.
    let _ = driver_stop.send(true);
    let _ = driver_task.await;

    // Then the fabric: subscriber connections close with the server.
    let _ = server_stop.send(true);
    let _ = server_task.await;

    info!("furlongd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

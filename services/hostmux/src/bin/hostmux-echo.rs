//! Echo server that runs either standalone or as a hostmux worker.
//!
//! Usage: `hostmux-echo [port]` (default 8080). Under a multiplexer the port
//! is opened through the control socket; otherwise it is bound directly.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hostmux::{PrefixedStream, ServiceListener, WorkerControl};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .map(|v| v.parse())
        .transpose()
        .context("port must be an integer")?
        .unwrap_or(8080);

    let control = WorkerControl::from_env()?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = ServiceListener::bind(control.as_ref(), addr)
        .await
        .with_context(|| format!("failed to listen on port {port}"))?;
    info!(port, handoff = listener.is_handoff(), "Echo listening");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            conn = listener.accept() => match conn {
                Ok(conn) => {
                    tokio::spawn(echo(conn));
                }
                Err(e) => {
                    info!(error = %e, "Listener closed");
                    break;
                }
            },
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
        }
    }

    let _ = listener.close().await;
    info!("Echo stopped");
    Ok(())
}

async fn echo(conn: PrefixedStream) {
    let peer = conn.peer_addr().ok();
    let (mut reader, mut writer) = tokio::io::split(conn);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => debug!(peer = ?peer, bytes, "Echo finished"),
        Err(e) => debug!(peer = ?peer, error = %e, "Echo failed"),
    }
}

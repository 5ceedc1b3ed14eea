//! hostmux daemon
//!
//! Shares TCP ports between services by hostname.
//!
//! This service:
//! - Registers the configured redirects on their shared ports
//! - Starts the configured worker commands with a control socket each
//! - Routes every accepted connection by HTTP `Host` or TLS SNI
//! - Closes everything on SIGINT or SIGTERM

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hostmux::{parse_matcher, PortRegistry, Redirect, RegistryConfig, UnixCmd};

mod config;

/// How long workers get to exit after being interrupted.
const WORKER_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to HOSTMUX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        bind_ip = %config.bind_ip,
        sniff_timeout_ms = config.sniff_timeout.map(|t| t.as_millis() as u64),
        redirect_count = config.redirects.len(),
        command_count = config.commands.len(),
        "Starting hostmux"
    );

    let registry = PortRegistry::new(RegistryConfig {
        bind_ip: config.bind_ip,
        sniff_timeout: config.sniff_timeout,
        ..RegistryConfig::default()
    });

    let mut redirects: Vec<Redirect> = Vec::with_capacity(config.redirects.len());
    for entry in &config.redirects {
        let matcher = parse_matcher(&entry.matcher).context("empty matcher")?;
        let redirect = registry
            .add_redirect(matcher, entry.port, &entry.network, &entry.address)
            .await
            .with_context(|| format!("failed to redirect port {}", entry.port))?;
        info!(
            port = entry.port,
            matcher = %entry.matcher,
            destination = %redirect.destination(),
            "Redirect registered"
        );
        redirects.push(redirect);
    }

    let mut commands: Vec<UnixCmd> = Vec::with_capacity(config.commands.len());
    for entry in &config.commands {
        let matcher = parse_matcher(&entry.matcher).context("empty matcher")?;
        let mut cmd = Command::new(&entry.program);
        cmd.args(&entry.args);
        let worker = UnixCmd::spawn(&registry, matcher, cmd)
            .with_context(|| format!("failed to start {}", entry.program))?;
        info!(
            program = %entry.program,
            matcher = %entry.matcher,
            pid = worker.pid(),
            "Worker started"
        );
        commands.push(worker);
    }

    wait_for_shutdown().await?;
    info!("Shutting down");

    for redirect in &redirects {
        redirect.close();
    }
    for worker in &commands {
        if let Err(e) = worker.close() {
            warn!(pid = worker.pid(), error = %e, "Failed to close worker");
        }
    }

    match tokio::time::timeout(WORKER_EXIT_TIMEOUT, wait_for_workers(&commands)).await {
        Ok(()) => info!("All workers exited"),
        Err(_) => error!("Timed out waiting for workers to exit"),
    }

    let stats = registry.stats();
    info!(
        accepted = stats.connections_accepted.load(Ordering::Relaxed),
        unmatched = stats.unmatched.load(Ordering::Relaxed),
        "Stopped"
    );
    Ok(())
}

async fn wait_for_workers(commands: &[UnixCmd]) {
    for worker in commands {
        let status = worker.wait().await;
        info!(pid = worker.pid(), status = ?status, "Worker exited");
    }
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

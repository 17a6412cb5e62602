//! dnsmux - a forwarding DNS proxy.
//!
//! Receives DNS queries over UDP, forwards each one to a single configured
//! upstream resolver under a fresh transaction ID, and relays the reply
//! back to the originating client with its original ID restored.

mod cache;
mod config;
mod correlator;
mod engine;
mod proto_utils;
mod stats;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ServerSettings;
use crate::engine::Engine;

#[derive(Parser, Debug)]
#[command(author, version, about = "Forwarding DNS proxy with transaction-id multiplexing", long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(default_value_t = 53)]
    listen_port: u16,

    /// Upstream resolver, hostname or address, resolved once at startup
    #[arg(default_value = "8.8.8.8")]
    upstream_address: String,

    /// Upstream resolver port
    #[arg(default_value_t = 53)]
    upstream_port: u16,

    /// Enable debug logging
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Processor worker count (default: CPU core count)
    #[arg(long, default_value_t = 0)]
    processors: usize,

    /// Enable the response cache
    #[arg(long, default_value_t = false)]
    cache: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let upstream_addr = resolve_upstream(&args.upstream_address, args.upstream_port)
        .await
        .with_context(|| format!("resolve upstream dns server {}", args.upstream_address))?;

    let processors = if args.processors > 0 {
        args.processors
    } else {
        num_cpus::get()
    };

    let settings = ServerSettings {
        listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.listen_port),
        upstream_addr,
        processors,
        cache: args.cache,
        ..Default::default()
    };

    let engine = Engine::bind(settings.clone()).context("start server")?;
    info!(
        listen = %settings.listen_addr,
        upstream = %settings.upstream_addr,
        processors,
        cache = settings.cache,
        "dns proxy started"
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    engine.run(shutdown).await;

    let snap = engine.stats().snapshot();
    info!(
        packets_in = snap.packets_in,
        packets_out = snap.packets_out,
        requests = snap.requests,
        served = snap.served,
        time_outs = snap.time_outs,
        processing = snap.processing,
        "shutdown complete"
    );

    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Resolve the upstream once at startup; the address is never re-resolved.
/// Takes the first address the host resolver hands back.
async fn resolve_upstream(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs
        .next()
        .ok_or_else(|| anyhow::anyhow!("no address found for {host}"))
}

/// Wire SIGINT and SIGTERM to the shutdown token. Handlers stay installed
/// for the process lifetime; repeated signals re-cancel the token, which is
/// a no-op.
#[cfg(unix)]
fn spawn_signal_handler(shutdown: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            };
            info!(signal = received, "received signal, shutting down");
            shutdown.cancel();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handler(shutdown: CancellationToken) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down");
            shutdown.cancel();
        }
    });
    Ok(())
}

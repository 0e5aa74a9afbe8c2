mod config;
mod connection;
mod connector;
mod deflate;
mod dns;
mod fallback;
mod geoip;
mod identity;
mod protocol;
mod relay;
mod server;
mod session;
mod sniff;
mod subscription;
mod web;

use crate::config::{Cli, ProxyConfig};
use crate::connection::SessionGuard;
use crate::dns::{DohResolver, Resolve};
use crate::fallback::{CloseFallback, Fallback, ForwardFallback};
use crate::server::{handle_connection, ServerContext};
use clap::Parser;
use color_eyre::eyre::Result;
use socket2::SockRef;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

/// How long shutdown waits for open tunnel sessions
const DRAIN_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("muxtun=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();

    if !args.enabled {
        info!("Tunnel endpoint disabled, exiting");
        return Ok(());
    }
    if args.uuid.trim().is_empty() {
        warn!("No UUID configured, tunnel endpoint not started");
        return Ok(());
    }

    let config = Arc::new(ProxyConfig::from_cli(args)?);

    geoip::spawn_lookup(config.geoip_url.clone());

    let resolver: Arc<dyn Resolve> = Arc::new(DohResolver::new(config.doh_url.clone())?);
    let fallback: Arc<dyn Fallback> = match &config.fallback {
        Some(addr) => {
            info!("Non-HTTP traffic forwarded to {}", addr);
            Arc::new(ForwardFallback::new(addr.clone(), config.connect_timeout))
        }
        None => {
            info!("No fallback configured, non-HTTP connections will be closed");
            Arc::new(CloseFallback)
        }
    };

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("Listening on {}", config.listen_addr);
    info!("Subscription path: /{}", config.sub_path);

    let ctx = Arc::new(ServerContext::new(Arc::clone(&config), resolver, fallback));

    // Periodic status line; quiet while idle
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300));
        let mut last_active_count = 0;

        loop {
            interval.tick().await;

            let active = SessionGuard::active_count();
            if active > 0 || active != last_active_count {
                let (up, down) = connection::traffic();
                info!(
                    "Status - Active sessions: {}, relayed {}↑ {}↓ bytes",
                    active, up, down
                );
            }
            if active > 10_000 {
                warn!("High session load: {} active", active);
            }

            last_active_count = active;
        }
    });

    // Graceful shutdown signal handling
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }

        info!("Shutdown signal received");

        let active = SessionGuard::active_count();
        if active > 0 {
            info!("Waiting for {} sessions to close...", active);

            for i in 1..=DRAIN_SECS {
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                let remaining = SessionGuard::active_count();

                if remaining == 0 {
                    info!("All sessions closed gracefully");
                    break;
                }

                if i % 5 == 0 {
                    info!(
                        "Still waiting for {} sessions... ({}/{}s)",
                        remaining, i, DRAIN_SECS
                    );
                }
            }

            let final_count = SessionGuard::active_count();
            if final_count > 0 {
                warn!("Forced shutdown with {} sessions still active", final_count);
            }
        }
    };

    // Main server loop
    let server = async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
                        debug!("Failed to enable keepalive for {}: {}", peer_addr, e);
                    }
                    let ctx = Arc::clone(&ctx);
                    tokio::task::spawn(handle_connection(stream, peer_addr, ctx));
                }
                Err(e) => {
                    warn!("Accept error: {} (continuing)", e);
                    continue;
                }
            }
        }
    };

    tokio::select! {
        _ = server => {
            warn!("Server loop terminated");
        }
        _ = shutdown => {
            info!("Server shutdown complete");
        }
    }

    Ok(())
}

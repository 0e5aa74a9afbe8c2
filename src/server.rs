use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::config::ProxyConfig;
use crate::dns::Resolve;
use crate::fallback::Fallback;
use crate::sniff::{sniff, Route};
use crate::web;

/// Shared state handed to every accepted connection
pub struct ServerContext {
    pub config: Arc<ProxyConfig>,
    pub resolver: Arc<dyn Resolve>,
    pub fallback: Arc<dyn Fallback>,
}

impl ServerContext {
    pub fn new(
        config: Arc<ProxyConfig>,
        resolver: Arc<dyn Resolve>,
        fallback: Arc<dyn Fallback>,
    ) -> Self {
        Self {
            config,
            resolver,
            fallback,
        }
    }

    #[cfg(test)]
    pub fn for_tests(resolver: Arc<dyn Resolve>) -> Self {
        Self::new(
            Arc::new(crate::config::tests::test_config()),
            resolver,
            Arc::new(crate::fallback::CloseFallback),
        )
    }
}

/// Sniff the first bytes of a connection and route it once.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, ctx: Arc<ServerContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let sniffed = match ctx.config.sniff_timeout {
        Some(limit) => match tokio::time::timeout(limit, sniff(stream)).await {
            Ok(res) => res,
            Err(_) => {
                debug!("[{}] no data within {:?}, closing", peer, limit);
                return;
            }
        },
        None => sniff(stream).await,
    };

    match sniffed {
        Ok(Some((Route::Web, stream))) => web::serve(stream, peer, ctx).await,
        Ok(Some((Route::Fallback, stream))) => {
            debug!("[{}] first byte {:#04x}, using fallback", peer, stream.prefix()[0]);
            let fallback = Arc::clone(&ctx.fallback);
            fallback.handle(Box::new(stream), peer).await;
        }
        Ok(None) => debug!("[{}] closed before sending data", peer),
        Err(e) => debug!("[{}] read error while sniffing: {}", peer, e),
    }
}

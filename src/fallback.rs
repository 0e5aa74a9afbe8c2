//! Handlers for connections whose first byte is not an HTTP method.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Receives the raw connection with the sniffed bytes still unread
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn handle(&self, stream: BoxedStream, peer: SocketAddr);
}

/// Splices the connection onto a fixed TCP backend
pub struct ForwardFallback {
    addr: String,
    connect_timeout: Duration,
}

impl ForwardFallback {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Fallback for ForwardFallback {
    async fn handle(&self, mut stream: BoxedStream, peer: SocketAddr) {
        let mut upstream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    warn!("[{}] fallback {} unreachable: {}", peer, self.addr, e);
                    return;
                }
                Err(_) => {
                    warn!("[{}] fallback {} timed out", peer, self.addr);
                    return;
                }
            };
        match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
            Ok((up, down)) => debug!("[{}] fallback done: {}↑ {}↓ bytes", peer, up, down),
            Err(e) => debug!("[{}] fallback ended: {}", peer, e),
        }
    }
}

/// Used when no fallback backend is configured
pub struct CloseFallback;

#[async_trait]
impl Fallback for CloseFallback {
    async fn handle(&self, mut stream: BoxedStream, peer: SocketAddr) {
        info!("[{}] non-HTTP traffic and no fallback configured, closing", peer);
        let _ = stream.shutdown().await;
    }
}

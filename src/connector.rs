use socket2::SockRef;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::dns::{is_ip_literal, Resolve};

/// Error type for outbound connection attempts
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("connect to {addr} failed: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Opens the single outbound connection of a tunnel session
pub struct Connector<'a> {
    resolver: &'a dyn Resolve,
    timeout: Duration,
}

impl<'a> Connector<'a> {
    pub fn new(resolver: &'a dyn Resolve, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    /// Resolve `host` (best effort) and connect with keepalive enabled.
    /// No retry is made on failure.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, ConnectError> {
        let resolved = if is_ip_literal(host) {
            host.to_string()
        } else {
            self.resolver.resolve(host).await
        };
        let addr = format!("{}:{}", resolved, port);
        debug!("connecting to {} ({}:{})", addr, host, port);

        let connect = TcpStream::connect((resolved.as_str(), port));
        let stream = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| ConnectError::Timeout {
                addr: addr.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| ConnectError::Io {
                addr: addr.clone(),
                source,
            })?;

        if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
            debug!("failed to enable keepalive on {}: {}", addr, e);
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY on {}: {}", addr, e);
        }

        Ok(stream)
    }
}

//! First-byte protocol detection for freshly accepted connections.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Size of the initial read used to make the routing decision
const SNIFF_BUF: usize = 4096;

/// Leading characters of the HTTP methods we serve (GET, POST, PUT, PATCH,
/// HEAD, DELETE, OPTIONS, CONNECT, TRACE)
const HTTP_LEADS: &[u8] = b"GPHDOCT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// HTTP request or WebSocket upgrade
    Web,
    /// Anything else, handed to the fallback service untouched
    Fallback,
}

pub fn classify(first: u8) -> Route {
    if HTTP_LEADS.contains(&first) {
        Route::Web
    } else {
        Route::Fallback
    }
}

/// Wait for the first bytes of `stream` and decide where the connection goes.
///
/// The bytes read while deciding are replayed in front of the stream, so the
/// returned `PrefixedStream` yields exactly what the peer sent. `Ok(None)` means
/// the peer closed before sending anything.
pub async fn sniff<S>(mut stream: S) -> io::Result<Option<(Route, PrefixedStream<S>)>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; SNIFF_BUF];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);

    let route = classify(buf[0]);
    Ok(Some((route, PrefixedStream::new(stream, buf))))
}

/// A stream that first yields `prefix`, then reads from `inner`
pub struct PrefixedStream<S> {
    inner: S,
    prefix: Vec<u8>,
    pos: usize,
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            prefix,
            pos: 0,
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix[self.pos..]
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            if self.pos == self.prefix.len() {
                self.prefix = Vec::new();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

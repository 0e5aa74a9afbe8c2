//! Full-duplex pump between a WebSocket channel and a TCP stream.
//!
//! Each direction reads one chunk, writes it to the peer, and only then reads
//! again, so at most one chunk per direction is ever buffered.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::connection;

/// Read size for the outbound socket; each read becomes one binary frame
const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("websocket: {0}")]
    WebSocket(#[from] WsError),

    #[error("outbound: {0}")]
    Io(#[from] io::Error),
}

/// Which side ended the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    Inbound,
    Outbound,
}

/// Bytes moved in each direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transferred {
    pub up: u64,
    pub down: u64,
}

/// Relay until either side ends.
///
/// When one side finishes, the other is closed only after pending writes to it
/// were flushed: the outbound socket is shut down, the WebSocket gets a Close
/// frame. A failed write ends the relay and drops both sides.
pub async fn relay<I, O>(inbound: I, outbound: O) -> Result<(Closed, Transferred), RelayError>
where
    I: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = inbound.split::<Message>();
    let (mut out_rx, mut out_tx) = tokio::io::split(outbound);
    let mut stats = Transferred::default();

    let up = async {
        let mut total = 0u64;
        while let Some(msg) = ws_rx.next().await {
            match msg? {
                Message::Binary(data) => {
                    out_tx.write_all(&data).await?;
                    out_tx.flush().await?;
                    total += data.len() as u64;
                    connection::add_up(data.len() as u64);
                }
                Message::Close(_) => break,
                // ping replies are queued by tungstenite itself; text is not tunnel data
                _ => {}
            }
        }
        out_tx.shutdown().await?;
        Ok::<u64, RelayError>(total)
    };

    let down = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = out_rx.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            ws_tx.send(Message::Binary(buf[..n].to_vec())).await?;
            total += n as u64;
            connection::add_down(n as u64);
        }
        ws_tx.close().await?;
        Ok::<u64, RelayError>(total)
    };

    let closed = tokio::select! {
        res = up => {
            stats.up = res?;
            debug!("inbound finished after {} bytes", stats.up);
            Closed::Inbound
        }
        res = down => {
            stats.down = res?;
            debug!("outbound finished after {} bytes", stats.down);
            Closed::Outbound
        }
    };

    if closed == Closed::Inbound {
        // flushes the Close reply tungstenite queued when the client's Close arrived
        if let Err(e) = ws_tx.close().await {
            debug!("close reply not delivered: {}", e);
        }
    }
    Ok((closed, stats))
}

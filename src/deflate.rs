//! permessage-deflate (RFC 7692) for messages sent by the client.
//!
//! Compressed client messages are inflated below the WebSocket layer and
//! handed up as ordinary masked frames. Server messages always go out
//! uncompressed, which the extension allows, so nothing is deflated here.

use bytes::{BufMut, BytesMut};
use flate2::{Decompress, FlushDecompress, Status};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub const EXTENSION: &str = "permessage-deflate";

/// Largest compressed or inflated message accepted; matches the frame limit
/// of the WebSocket layer above, since an inflated message becomes one frame
const MAX_MESSAGE: usize = 16 << 20;

/// Trailer stripped by the sender after a sync flush (RFC 7692 section 7.2.2)
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const OP_CONTINUATION: u8 = 0x0;
const FIN: u8 = 0x80;
const RSV1: u8 = 0x40;
const MASK: u8 = 0x80;

/// Pick the first acceptable `permessage-deflate` offer from the
/// `Sec-WebSocket-Extensions` header values and build the response value.
pub fn negotiate<'a>(header_values: impl IntoIterator<Item = &'a str>) -> Option<String> {
    header_values
        .into_iter()
        .flat_map(|v| v.split(','))
        .find_map(accept_offer)
}

fn accept_offer(offer: &str) -> Option<String> {
    let mut parts = offer.split(';').map(str::trim);
    if !parts.next()?.eq_ignore_ascii_case(EXTENSION) {
        return None;
    }

    let mut seen: Vec<String> = Vec::new();
    let mut response = vec![EXTENSION.to_string()];
    for param in parts.filter(|p| !p.is_empty()) {
        let (name, value) = match param.split_once('=') {
            Some((n, v)) => {
                let value = v.trim().trim_matches('"');
                (n.trim().to_ascii_lowercase(), Some(value))
            }
            None => (param.to_ascii_lowercase(), None),
        };
        if seen.contains(&name) {
            return None;
        }

        match (name.as_str(), value) {
            ("server_no_context_takeover", None) => response.push(name.clone()),
            ("client_no_context_takeover", None) => {}
            ("server_max_window_bits", Some(v)) => {
                let bits = window_bits(v)?;
                response.push(format!("server_max_window_bits={}", bits));
            }
            ("client_max_window_bits", None) => {}
            ("client_max_window_bits", Some(v)) => {
                window_bits(v)?;
            }
            _ => return None,
        }
        seen.push(name);
    }
    Some(response.join("; "))
}

fn window_bits(value: &str) -> Option<u8> {
    value.parse::<u8>().ok().filter(|b| (8..=15).contains(b))
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

struct FrameHeader {
    fin: bool,
    rsv1: bool,
    opcode: u8,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: usize,
}

impl FrameHeader {
    fn is_control(&self) -> bool {
        self.opcode & 0x08 != 0
    }
}

/// Parse a frame header, `None` until enough bytes are buffered
fn parse_header(buf: &[u8]) -> io::Result<Option<FrameHeader>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let masked = buf[1] & MASK != 0;
    let (len_bytes, len7) = match buf[1] & 0x7f {
        126 => (2, None),
        127 => (8, None),
        n => (0, Some(n as u64)),
    };
    let header_len = 2 + len_bytes + if masked { 4 } else { 0 };
    if buf.len() < header_len {
        return Ok(None);
    }

    let payload_len = match len7 {
        Some(n) => n,
        None => buf[2..2 + len_bytes]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
    };
    if payload_len > MAX_MESSAGE as u64 {
        return Err(invalid("websocket frame too large"));
    }

    let mask = masked.then(|| {
        let at = 2 + len_bytes;
        [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]
    });

    Ok(Some(FrameHeader {
        fin: buf[0] & FIN != 0,
        rsv1: buf[0] & RSV1 != 0,
        opcode: buf[0] & 0x0f,
        mask,
        header_len,
        payload_len: payload_len as usize,
    }))
}

/// Append a final, masked frame with an all-zero key (payload stays as-is)
fn write_frame(out: &mut BytesMut, opcode: u8, payload: &[u8]) {
    out.put_u8(FIN | opcode);
    match payload.len() {
        n if n < 126 => out.put_u8(MASK | n as u8),
        n if n <= u16::MAX as usize => {
            out.put_u8(MASK | 126);
            out.put_u16(n as u16);
        }
        n => {
            out.put_u8(MASK | 127);
            out.put_u64(n as u64);
        }
    }
    out.put_slice(&[0; 4]);
    out.put_slice(payload);
}

/// Raw-deflate decoder keeping the client's window across messages
struct Inflater {
    inner: Decompress,
}

impl Inflater {
    fn new() -> Self {
        Self {
            inner: Decompress::new(false),
        }
    }

    fn inflate(&mut self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TAIL);

        let mut rest: &[u8] = &input;
        let mut out = Vec::with_capacity((payload.len() * 4).clamp(1024, MAX_MESSAGE));
        loop {
            if out.len() == out.capacity() {
                if out.len() >= MAX_MESSAGE {
                    return Err(invalid("inflated message too large"));
                }
                out.reserve(out.len().min(MAX_MESSAGE - out.len()).max(1024));
            }

            let before_in = self.inner.total_in();
            let before_out = out.len();
            let status = self
                .inner
                .decompress_vec(rest, &mut out, FlushDecompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let used = (self.inner.total_in() - before_in) as usize;
            rest = &rest[used..];

            if status == Status::StreamEnd {
                // sender finished the deflate stream; the next message starts fresh
                self.inner.reset(false);
            }
            if rest.is_empty() && out.len() < out.capacity() {
                break;
            }
            if used == 0 && out.len() == before_out && status != Status::StreamEnd {
                return Err(invalid("deflate stream stalled"));
            }
        }
        Ok(out)
    }
}

/// Compressed data message being reassembled from its fragments
struct Pending {
    opcode: u8,
    payload: Vec<u8>,
}

/// Client-side byte stream with compressed messages rewritten as plain frames.
///
/// With the extension off, reads and writes go straight to `inner`.
pub struct InflateStream<S> {
    inner: S,
    inflater: Option<Inflater>,
    raw: BytesMut,
    ready: BytesMut,
    pending: Option<Pending>,
    eof: bool,
}

impl<S> InflateStream<S> {
    pub fn new(inner: S, enabled: bool) -> Self {
        Self {
            inner,
            inflater: enabled.then(Inflater::new),
            raw: BytesMut::new(),
            ready: BytesMut::new(),
            pending: None,
            eof: false,
        }
    }

    /// Move every complete frame in `raw` to `ready`, inflating as needed
    fn process(&mut self) -> io::Result<()> {
        let Some(inflater) = self.inflater.as_mut() else {
            self.ready.extend_from_slice(&self.raw.split());
            return Ok(());
        };

        while let Some(h) = parse_header(&self.raw)? {
            let total = h.header_len + h.payload_len;
            if self.raw.len() < total {
                break;
            }
            let frame = self.raw.split_to(total);

            let compressed = match (&mut self.pending, h.opcode) {
                _ if h.is_control() => false,
                (Some(_), OP_CONTINUATION) if h.rsv1 => {
                    return Err(invalid("RSV1 set on a continuation frame"))
                }
                (Some(_), OP_CONTINUATION) => true,
                (None, OP_CONTINUATION) => false,
                (Some(_), _) => return Err(invalid("new message inside a fragmented one")),
                (None, _) => h.rsv1,
            };
            if !compressed {
                self.ready.extend_from_slice(&frame);
                continue;
            }

            let mut payload = frame[h.header_len..].to_vec();
            if let Some(key) = h.mask {
                payload
                    .iter_mut()
                    .enumerate()
                    .for_each(|(i, b)| *b ^= key[i % 4]);
            }

            let pending = self.pending.get_or_insert(Pending {
                opcode: h.opcode,
                payload: Vec::new(),
            });
            if pending.payload.len() + payload.len() > MAX_MESSAGE {
                return Err(invalid("compressed message too large"));
            }
            pending.payload.extend_from_slice(&payload);

            if h.fin {
                if let Some(done) = self.pending.take() {
                    let plain = inflater.inflate(&done.payload)?;
                    write_frame(&mut self.ready, done.opcode, &plain);
                }
            }
        }
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for InflateStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.inflater.is_none() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        loop {
            if !this.ready.is_empty() {
                let n = buf.remaining().min(this.ready.len());
                buf.put_slice(&this.ready.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let mut chunk = [0u8; 8 * 1024];
            let mut read = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read))?;
            if read.filled().is_empty() {
                // hand any partial frame up so the WebSocket layer reports it
                this.eof = true;
                let rest = this.raw.split();
                this.ready.extend_from_slice(&rest);
                continue;
            }
            this.raw.extend_from_slice(read.filled());
            this.process()?;
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for InflateStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::{Compress, Compression, FlushCompress};
    use futures_util::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    /// Deflate one message the way a client does: sync flush, tail removed
    pub fn deflate_message(compressor: &mut Compress, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        compressor
            .compress_vec(data, &mut out, FlushCompress::Sync)
            .unwrap();
        assert!(out.ends_with(&DEFLATE_TAIL));
        out.truncate(out.len() - DEFLATE_TAIL.len());
        out
    }

    pub fn compressor() -> Compress {
        Compress::new(Compression::default(), false)
    }

    /// Masked client frame with explicit FIN/RSV1 bits
    pub fn client_frame(fin: bool, rsv1: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut out = BytesMut::new();
        let mut b0 = opcode;
        if fin {
            b0 |= FIN;
        }
        if rsv1 {
            b0 |= RSV1;
        }
        out.put_u8(b0);
        match payload.len() {
            n if n < 126 => out.put_u8(MASK | n as u8),
            n => {
                out.put_u8(MASK | 126);
                out.put_u16(n as u16);
            }
        }
        out.put_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out.to_vec()
    }

    type ServerWs = WebSocketStream<InflateStream<tokio::io::DuplexStream>>;

    async fn server_over(enabled: bool) -> (ServerWs, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let inflate = InflateStream::new(server, enabled);
        let ws = WebSocketStream::from_raw_socket(inflate, Role::Server, None).await;
        (ws, client)
    }

    /// Next data message, skipping control frames
    async fn next_binary(ws: &mut ServerWs) -> Vec<u8> {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return data,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected binary, got {:?}", other),
            }
        }
    }

    #[test]
    fn accepts_plain_offer() {
        assert_eq!(
            negotiate(["permessage-deflate"]).as_deref(),
            Some("permessage-deflate")
        );
        assert_eq!(
            negotiate(["permessage-deflate; client_max_window_bits"]).as_deref(),
            Some("permessage-deflate")
        );
    }

    #[test]
    fn echoes_server_parameters() {
        let offer = "permessage-deflate; server_no_context_takeover; server_max_window_bits=10";
        assert_eq!(negotiate([offer]).as_deref(), Some(offer));
    }

    #[test]
    fn declines_bad_offers() {
        assert_eq!(negotiate(["x-webkit-deflate-frame"]), None);
        assert_eq!(negotiate(["permessage-deflate; foo"]), None);
        assert_eq!(negotiate(["permessage-deflate; server_max_window_bits=20"]), None);
        assert_eq!(negotiate(["permessage-deflate; server_max_window_bits"]), None);
        let repeated = "permessage-deflate; client_no_context_takeover; client_no_context_takeover";
        assert_eq!(negotiate([repeated]), None);
        assert_eq!(negotiate(Vec::<&str>::new()), None);
    }

    #[test]
    fn falls_through_to_next_offer() {
        let offers = "permessage-deflate; foo=1, permessage-deflate; client_max_window_bits=12";
        assert_eq!(negotiate([offers]).as_deref(), Some("permessage-deflate"));
        let resp = negotiate(["x-custom", "permessage-deflate"]);
        assert_eq!(resp.as_deref(), Some("permessage-deflate"));
    }

    #[tokio::test]
    async fn compressed_messages_share_the_client_window() {
        let (mut ws, mut client) = server_over(true).await;
        let mut c = compressor();

        let first = b"hello hello hello hello".to_vec();
        let second = b"hello hello hello again".to_vec();
        client
            .write_all(&client_frame(true, true, 0x2, &deflate_message(&mut c, &first)))
            .await
            .unwrap();
        client
            .write_all(&client_frame(true, true, 0x2, &deflate_message(&mut c, &second)))
            .await
            .unwrap();

        assert_eq!(next_binary(&mut ws).await, first);
        assert_eq!(next_binary(&mut ws).await, second);
    }

    #[tokio::test]
    async fn fragmented_compressed_message_is_reassembled() {
        let (mut ws, mut client) = server_over(true).await;
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let compressed = deflate_message(&mut compressor(), &data);
        let (a, b) = compressed.split_at(compressed.len() / 2);

        client.write_all(&client_frame(false, true, 0x2, a)).await.unwrap();
        client.write_all(&client_frame(true, false, 0x9, b"p")).await.unwrap();
        client
            .write_all(&client_frame(true, false, OP_CONTINUATION, b))
            .await
            .unwrap();

        assert_eq!(next_binary(&mut ws).await, data);
    }

    #[tokio::test]
    async fn uncompressed_frames_pass_through() {
        let (mut ws, mut client) = server_over(true).await;
        client
            .write_all(&client_frame(false, false, 0x2, b"plain "))
            .await
            .unwrap();
        client
            .write_all(&client_frame(true, false, OP_CONTINUATION, b"text"))
            .await
            .unwrap();
        assert_eq!(next_binary(&mut ws).await, b"plain text");
    }

    #[tokio::test]
    async fn compressed_frame_rejected_when_not_negotiated() {
        let (mut ws, mut client) = server_over(false).await;
        let compressed = deflate_message(&mut compressor(), b"data");
        client
            .write_all(&client_frame(true, true, 0x2, &compressed))
            .await
            .unwrap();
        assert!(matches!(ws.next().await, Some(Err(_))));
    }

    #[tokio::test]
    async fn corrupt_deflate_data_is_an_error() {
        let (mut ws, mut client) = server_over(true).await;
        client
            .write_all(&client_frame(true, true, 0x2, &[0xff, 0xff, 0xff, 0xff]))
            .await
            .unwrap();
        assert!(matches!(ws.next().await, Some(Err(_))));
    }
}

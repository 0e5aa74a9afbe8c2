//! Per-connection tunnel state after the WebSocket upgrade.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::connection::SessionGuard;
use crate::connector::{ConnectError, Connector};
use crate::protocol::parse_first_frame;
use crate::relay::{relay, RelayError};
use crate::server::ServerContext;

/// Session stages; a session only ever moves forward through these
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    AwaitingFirstFrame,
    Established,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("websocket: {0}")]
    WebSocket(#[from] WsError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("writing initial payload: {0}")]
    Payload(#[source] io::Error),

    #[error("relay: {0}")]
    Relay(#[from] RelayError),
}

/// One upgraded WebSocket channel and the tunnel it carries
pub struct Session<I> {
    inbound: I,
    peer: SocketAddr,
    stage: Stage,
    first_frame_consumed: bool,
    _guard: SessionGuard,
}

impl<I> Session<I>
where
    I: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    pub fn new(inbound: I, peer: SocketAddr) -> Self {
        Self {
            inbound,
            peer,
            stage: Stage::AwaitingFirstFrame,
            first_frame_consumed: false,
            _guard: SessionGuard::new(),
        }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next >= self.stage, "stage {:?} -> {:?}", self.stage, next);
        self.stage = next;
    }

    /// Wait for the first binary frame. Control and text frames before it are
    /// skipped; pings are answered by the WebSocket layer.
    async fn first_frame(&mut self) -> Option<Vec<u8>> {
        if self.first_frame_consumed {
            return None;
        }
        while let Some(msg) = self.inbound.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    self.first_frame_consumed = true;
                    return Some(data);
                }
                Ok(Message::Close(_)) => {
                    // send the queued Close reply before the channel is dropped
                    if let Err(e) = self.inbound.close().await {
                        debug!("[{}] close reply not delivered: {}", self.peer, e);
                    }
                    return None;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("[{}] read before first frame failed: {}", self.peer, e);
                    return None;
                }
            }
        }
        None
    }

    /// Authenticate, connect and relay until either side is done.
    ///
    /// Frames that match neither protocol end the session without a reply.
    pub async fn run(mut self, ctx: &ServerContext) -> Result<(), SessionError> {
        let Some(frame) = self.first_frame().await else {
            self.advance(Stage::Closed);
            return Ok(());
        };

        let Some(request) = parse_first_frame(&frame, &ctx.config.identity) else {
            debug!("[{}] first frame matched no protocol, closing", self.peer);
            self.advance(Stage::Closed);
            return Ok(());
        };
        self.advance(Stage::Established);

        if let Some(reply) = request.response(frame[0]) {
            self.inbound.send(Message::Binary(reply.to_vec())).await?;
        }

        info!(
            "[{}] {} -> {}:{}",
            self.peer, request.protocol, request.host, request.port
        );

        let connector = Connector::new(ctx.resolver.as_ref(), ctx.config.connect_timeout);
        let mut outbound = match connector.connect(&request.host, request.port).await {
            Ok(stream) => stream,
            Err(e) => {
                self.advance(Stage::Closed);
                return Err(e.into());
            }
        };

        if !request.payload.is_empty() {
            outbound
                .write_all(&request.payload)
                .await
                .map_err(SessionError::Payload)?;
        }

        let peer = self.peer;
        let result = relay(self.inbound, outbound).await;
        match result {
            Ok((closed, stats)) => {
                debug!(
                    "[{}] tunnel closed by {:?}: {}↑ {}↓ bytes",
                    peer, closed, stats.up, stats.down
                );
                Ok(())
            }
            Err(e) => {
                warn!("[{}] tunnel error: {}", peer, e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::tests::StaticResolver;
    use crate::protocol::tests::{identity, trojan_domain, vless_ipv4};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    type Ws = WebSocketStream<tokio::io::DuplexStream>;

    async fn ws_pair() -> (Ws, Ws) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn context(resolver: StaticResolver) -> Arc<ServerContext> {
        Arc::new(ServerContext::for_tests(Arc::new(resolver)))
    }

    fn spawn_session(
        server: Ws,
        ctx: Arc<ServerContext>,
    ) -> tokio::task::JoinHandle<Result<(), SessionError>> {
        tokio::spawn(async move { Session::new(server, peer()).run(&ctx).await })
    }

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::AwaitingFirstFrame < Stage::Established);
        assert!(Stage::Established < Stage::Closed);
    }

    #[tokio::test]
    async fn vless_replies_once_then_relays() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        let (server, mut client) = ws_pair().await;
        let task = spawn_session(server, context(StaticResolver::default()));

        let id = identity();
        client
            .send(Message::Binary(vless_ipv4(&id, [127, 0, 0, 1], port, b"hello")))
            .await
            .unwrap();

        match client.next().await {
            Some(Ok(Message::Binary(data))) => assert_eq!(data, vec![0, 0]),
            other => panic!("expected vless reply, got {:?}", other),
        }

        let (mut remote, _) = target.accept().await.unwrap();
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        remote.write_all(b"world").await.unwrap();
        match client.next().await {
            Some(Ok(Message::Binary(data))) => assert_eq!(data, b"world"),
            other => panic!("expected relayed data, got {:?}", other),
        }

        client.close(None).await.unwrap();
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn trojan_sends_nothing_before_data() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        let (server, mut client) = ws_pair().await;
        let resolver = StaticResolver::with("backend.test", "127.0.0.1");
        let task = spawn_session(server, context(resolver));

        let id = identity();
        client
            .send(Message::Binary(trojan_domain(&id, "backend.test", port, b"GET /")))
            .await
            .unwrap();

        let (mut remote, _) = target.accept().await.unwrap();
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /");

        remote.write_all(b"200").await.unwrap();
        // the very first frame the client sees is relayed data
        match client.next().await {
            Some(Ok(Message::Binary(data))) => assert_eq!(data, b"200"),
            other => panic!("expected relayed data, got {:?}", other),
        }

        drop(remote);
        while let Some(Ok(msg)) = client.next().await {
            assert!(!matches!(msg, Message::Binary(_)));
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bad_uuid_closes_silently() {
        let (server, mut client) = ws_pair().await;
        let task = spawn_session(server, context(StaticResolver::default()));

        let id = identity();
        let mut frame = vless_ipv4(&id, [127, 0, 0, 1], 9, b"x");
        frame[5] ^= 0xff;
        client.send(Message::Binary(frame)).await.unwrap();

        task.await.unwrap().unwrap();
        // no reply frame, just a dropped connection
        match client.next().await {
            Some(Ok(Message::Binary(b))) => panic!("unexpected reply {:?}", b),
            Some(Ok(Message::Text(t))) => panic!("unexpected reply {:?}", t),
            _ => {}
        }
    }

    #[tokio::test]
    async fn control_frames_before_first_binary_are_skipped() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        let (server, mut client) = ws_pair().await;
        let _task = spawn_session(server, context(StaticResolver::default()));

        client.send(Message::Text("hi".into())).await.unwrap();
        client.send(Message::Ping(b"p".to_vec())).await.unwrap();
        let id = identity();
        client
            .send(Message::Binary(vless_ipv4(&id, [127, 0, 0, 1], port, b"")))
            .await
            .unwrap();

        let mut saw_pong = false;
        loop {
            match client.next().await {
                Some(Ok(Message::Pong(p))) => {
                    assert_eq!(p, b"p");
                    saw_pong = true;
                }
                Some(Ok(Message::Binary(data))) => {
                    assert_eq!(data, vec![0, 0]);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(saw_pong);
        let accepted = tokio::time::timeout(Duration::from_secs(2), target.accept()).await;
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn close_before_first_frame_is_answered() {
        let (server, mut client) = ws_pair().await;
        let task = spawn_session(server, context(StaticResolver::default()));

        client.close(None).await.unwrap();
        match client.next().await {
            Some(Ok(Message::Close(_))) => {}
            other => panic!("expected close reply, got {:?}", other),
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connect_failure_ends_session() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        drop(target);

        let (server, mut client) = ws_pair().await;
        let task = spawn_session(server, context(StaticResolver::default()));

        let id = identity();
        client
            .send(Message::Binary(vless_ipv4(&id, [127, 0, 0, 1], port, b"x")))
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Connect(_)));
    }
}

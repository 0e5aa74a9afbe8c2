//! HTTP side of the multiplexer: static pages and the WebSocket upgrade.

use bytes::Bytes;
use http::header::{
    HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::deflate::{self, InflateStream};
use crate::geoip;
use crate::server::ServerContext;
use crate::session::Session;
use crate::subscription::subscription_body;

const DENIED_BODY: &str = "This is a Discord bot endpoint. Access denied.";
const NOT_FOUND_BODY: &str = "Not Found\n";

/// Serve HTTP/1.1 on a sniffed connection until it closes or is upgraded.
pub async fn serve<S>(stream: S, peer: SocketAddr, ctx: Arc<ServerContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| handle(req, peer, Arc::clone(&ctx)));

    if let Err(err) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        // Only log connection errors, not normal endings
        if !err.is_incomplete_message() {
            debug!("[{}] http connection error: {}", peer, err);
        }
    }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if is_websocket_upgrade(&req) {
        return Ok(upgrade(req, peer, ctx));
    }

    // the whole request target, so absolute-form URIs never match a route
    let target = req.uri().to_string();
    let (status, content_type, body) = static_page(&target, &ctx.config, geoip::display_label());
    debug!("[{}] {} {} -> {}", peer, req.method(), target, status.as_u16());
    Ok(text_response(status, content_type, body))
}

/// Resolve a non-upgrade request target to its fixed response
fn static_page(
    target: &str,
    config: &ProxyConfig,
    isp: &str,
) -> (StatusCode, &'static str, String) {
    if target == "/" {
        return (
            StatusCode::FORBIDDEN,
            "text/plain; charset=utf-8",
            DENIED_BODY.to_string(),
        );
    }
    if target.strip_prefix('/') == Some(config.sub_path.as_str()) {
        return (StatusCode::OK, "text/plain", subscription_body(config, isp));
    }
    (StatusCode::NOT_FOUND, "text/plain", NOT_FOUND_BODY.to_string())
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get_all(UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("websocket"))
}

/// Answer the opening handshake and hand the channel to a tunnel session.
fn upgrade(
    req: Request<hyper::body::Incoming>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let version_ok = req
        .headers()
        .get(SEC_WEBSOCKET_VERSION)
        .is_some_and(|v| v.as_bytes() == b"13");
    let key = req.headers().get(SEC_WEBSOCKET_KEY).map(|k| k.as_bytes().to_vec());

    let key = match key {
        Some(key) if version_ok && req.method() == Method::GET => key,
        _ => {
            debug!("[{}] rejected websocket handshake", peer);
            return unsupported_version();
        }
    };

    let accept = derive_accept_key(&key);
    let extensions = req
        .headers()
        .get_all(SEC_WEBSOCKET_EXTENSIONS)
        .iter()
        .filter_map(|v| v.to_str().ok());
    let compression = deflate::negotiate(extensions);

    let inflate = compression.is_some();
    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let io = InflateStream::new(TokioIo::new(upgraded), inflate);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                if let Err(e) = Session::new(ws, peer).run(&ctx).await {
                    warn!("[{}] session ended: {}", peer, e);
                }
            }
            Err(e) => warn!("[{}] upgrade error: {}", peer, e),
        }
    });

    let mut resp = Response::new(empty());
    *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = resp.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(v) = HeaderValue::from_str(&accept) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, v);
    }
    if let Some(v) = compression.and_then(|c| HeaderValue::from_str(&c).ok()) {
        headers.insert(SEC_WEBSOCKET_EXTENSIONS, v);
    }
    resp
}

/// 426 with the version this server speaks; the connection stays open
fn unsupported_version() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = StatusCode::UPGRADE_REQUIRED;
    resp.headers_mut()
        .insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    resp.headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    resp
}

fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let len = body.len();
    let mut resp = Response::new(full(body));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    resp
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn root_is_forbidden() {
        let cfg = test_config();
        let (status, ctype, body) = static_page("/", &cfg, "Unknown");
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(ctype, "text/plain; charset=utf-8");
        assert_eq!(body, "This is a Discord bot endpoint. Access denied.");
    }

    #[test]
    fn subscription_path_serves_links() {
        let cfg = test_config();
        let target = format!("/{}", cfg.sub_path);
        let (status, ctype, body) = static_page(&target, &cfg, "Unknown");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ctype, "text/plain");
        assert_eq!(body, subscription_body(&cfg, "Unknown"));
    }

    #[test]
    fn everything_else_is_not_found() {
        let cfg = test_config();
        for target in ["/index.html", "/?x=1", "//", "/dc85e5a3ac19", "http://h/"] {
            let (status, _, body) = static_page(target, &cfg, "Unknown");
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", target);
            assert_eq!(body, "Not Found\n");
        }
    }

    #[test]
    fn upgrade_header_is_case_insensitive() {
        let req = Request::builder()
            .header(UPGRADE, "WebSocket")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&req));

        let req = Request::builder()
            .header(UPGRADE, "h2c, websocket")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&req));

        let req = Request::builder().header(UPGRADE, "h2c").body(()).unwrap();
        assert!(!is_websocket_upgrade(&req));
        assert!(!is_websocket_upgrade(&Request::new(())));
    }

    #[test]
    fn text_response_sets_length_and_close() {
        let resp = text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found\n".into());
        assert_eq!(resp.headers()[CONTENT_LENGTH], "10");
        assert_eq!(resp.headers()[CONNECTION], "close");
    }
}

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::identity::Identity;

/// Used when neither --port/PORT nor server.properties provide one
pub const DEFAULT_PORT: u16 = 25565;

/// Command line interface configuration
///
/// Every option can also be supplied through the environment, which is how
/// the service is normally deployed next to the fallback server.
#[derive(Parser, Debug, Clone)]
#[command(
    author, version,
    about = "Single-port VLESS/Trojan over WebSocket endpoint with protocol sniffing",
    long_about = "muxtun shares one TCP port between a WebSocket tunnel endpoint and another service.\n\nThe first byte of every connection decides the route:\n- HTTP methods -> static pages, subscription link, or WebSocket upgrade into VLESS/Trojan\n- anything else -> the fallback service (--fallback)\n"
)]
pub struct Cli {
    /// Enable the tunnel endpoint
    #[arg(
        long,
        env = "WS_ENABLED",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value_t = true
    )]
    pub enabled: bool,

    /// User id shared by VLESS (raw bytes) and Trojan (SHA-224 password)
    #[arg(long, env = "WS_UUID", default_value = "b64c9a01-3f09-4dea-a0f1-dc85e5a3ac19")]
    pub uuid: String,

    /// Public domain advertised as SNI and Host in subscription links
    #[arg(long, env = "WS_DOMAIN", default_value = "www.abc123.com")]
    pub domain: String,

    /// WebSocket path advertised in subscription links (already URL-encoded, no leading slash)
    #[arg(long, env = "WS_PATH")]
    pub ws_path: Option<String>,

    /// Subscription path, served at /<sub-path>
    #[arg(long, env = "WS_SUB_PATH", default_value = "dc85e5a3ac19/sub")]
    pub sub_path: String,

    /// Node name prefixed to the ISP label in subscription links
    #[arg(long, env = "WS_NAME", default_value = "limbo")]
    pub name: String,

    /// Listen port (falls back to server-port in ./server.properties, then 25565)
    #[arg(short, long, env = "PORT")]
    pub port: Option<String>,

    /// IP address to bind
    #[arg(long, env = "WS_LISTEN_IP", default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// CDN host clients dial, as written into subscription links
    #[arg(long, env = "WS_CDN_HOST", default_value = "cdns.doon.eu.org")]
    pub cdn_host: String,

    /// CDN port clients dial
    #[arg(long, env = "WS_CDN_PORT", default_value_t = 443)]
    pub cdn_port: u16,

    /// Where non-HTTP connections are forwarded (host:port); closed when unset
    #[arg(long, env = "WS_FALLBACK", value_name = "HOST:PORT")]
    pub fallback: Option<String>,

    /// Outbound connect timeout in seconds
    #[arg(long, env = "WS_CONNECT_TIMEOUT", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Seconds to wait for the first byte of a new connection (0 = forever)
    #[arg(long, env = "WS_SNIFF_TIMEOUT", default_value_t = 0)]
    pub sniff_timeout: u64,

    /// DNS-over-HTTPS JSON endpoint used for destination lookups
    #[arg(long, env = "WS_DOH_URL", default_value = "https://dns.google/resolve")]
    pub doh_url: String,

    /// GeoIP endpoint used to label subscription entries
    #[arg(long, env = "WS_GEOIP_URL", default_value = "https://api.ip.sb/geoip")]
    pub geoip_url: String,
}

/// Runtime configuration derived from CLI arguments; immutable after startup
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub identity: Identity,
    pub domain: String,
    pub ws_path: String,
    pub sub_path: String,
    pub name: String,
    pub listen_addr: SocketAddr,
    pub cdn_host: String,
    pub cdn_port: u16,
    pub fallback: Option<String>,
    pub connect_timeout: Duration,
    pub sniff_timeout: Option<Duration>,
    pub doh_url: String,
    pub geoip_url: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// `api/v1/user?token=<first 8 uuid chars>&lang=en`, form-url-encoded
pub fn default_ws_path(uuid: &str) -> String {
    let token: String = uuid.chars().take(8).collect();
    let raw = format!("api/v1/user?token={}&lang=en", token);
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

/// Read `server-port` from a Java-style properties file
fn port_from_properties(path: &Path) -> Option<u16> {
    let text = std::fs::read_to_string(path).ok()?;
    text.lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#') && !l.starts_with('!'))
        .filter_map(|l| l.split_once(|c| c == '=' || c == ':'))
        .find(|(k, _)| k.trim() == "server-port")
        .and_then(|(_, v)| v.trim().parse().ok())
}

/// PORT/--port first, then server.properties, then the default
pub fn resolve_port(explicit: Option<&str>, properties: &Path) -> u16 {
    explicit
        .and_then(|p| p.trim().parse().ok())
        .or_else(|| port_from_properties(properties))
        .unwrap_or(DEFAULT_PORT)
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        let identity = Identity::parse(&args.uuid)
            .map_err(|e| color_eyre::eyre::eyre!("Invalid --uuid {:?}: {}", args.uuid, e))?;

        let ws_path = non_empty(args.ws_path).unwrap_or_else(|| default_ws_path(&args.uuid));

        let port = resolve_port(
            non_empty(args.port).as_deref(),
            Path::new("server.properties"),
        );

        let fallback = non_empty(args.fallback);
        if let Some(addr) = &fallback {
            if addr.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_none() {
                return Err(color_eyre::eyre::eyre!(
                    "Invalid --fallback {:?}, expected host:port",
                    addr
                ));
            }
        }

        Ok(Self {
            identity,
            domain: args.domain,
            ws_path,
            sub_path: args.sub_path.trim_start_matches('/').to_string(),
            name: args.name,
            listen_addr: SocketAddr::new(args.listen_ip, port),
            cdn_host: args.cdn_host,
            cdn_port: args.cdn_port,
            fallback,
            connect_timeout: Duration::from_secs(args.connect_timeout.max(1)),
            sniff_timeout: (args.sniff_timeout > 0)
                .then(|| Duration::from_secs(args.sniff_timeout)),
            doh_url: args.doh_url,
            geoip_url: args.geoip_url,
        })
    }
}

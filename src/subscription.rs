use base64::engine::general_purpose;
use base64::Engine;

use crate::config::ProxyConfig;

/// Fragment shown by clients as the node name
fn node_label(name: &str, isp: &str) -> String {
    if name.is_empty() {
        isp.to_string()
    } else {
        format!("{}-{}", name, isp)
    }
}

pub fn vless_uri(config: &ProxyConfig, label: &str) -> String {
    format!(
        "vless://{}@{}:{}?encryption=none&security=tls&sni={}&fp=firefox&type=ws&host={}&path=%2F{}#{}",
        config.identity.dashed(),
        config.cdn_host,
        config.cdn_port,
        config.domain,
        config.domain,
        config.ws_path,
        label
    )
}

pub fn trojan_uri(config: &ProxyConfig, label: &str) -> String {
    format!(
        "trojan://{}@{}:{}?security=tls&sni={}&fp=firefox&type=ws&host={}&path=%2F{}#{}",
        config.identity.dashed(),
        config.cdn_host,
        config.cdn_port,
        config.domain,
        config.domain,
        config.ws_path,
        label
    )
}

/// Body served at the subscription path: base64 of both URIs, newline-terminated
pub fn subscription_body(config: &ProxyConfig, isp: &str) -> String {
    let label = node_label(&config.name, isp);
    let links = format!("{}\n{}", vless_uri(config, &label), trojan_uri(config, &label));
    let mut body = general_purpose::STANDARD.encode(links);
    body.push('\n');
    body
}

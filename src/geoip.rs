use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Published once by the background lookup; readers see "Unknown" until then
static DISPLAY_LABEL: OnceLock<String> = OnceLock::new();

#[derive(Debug, Deserialize)]
struct GeoIp {
    country_code: Option<String>,
    isp: Option<String>,
}

pub fn display_label() -> &'static str {
    DISPLAY_LABEL.get().map(String::as_str).unwrap_or(UNKNOWN_LABEL)
}

fn label_from(geo: GeoIp) -> String {
    let country = geo.country_code.unwrap_or_else(|| "XX".to_string());
    let isp = geo
        .isp
        .map(|s| s.replace(' ', "_"))
        .unwrap_or_else(|| UNKNOWN_LABEL.to_string());
    format!("{}-{}", country, isp)
}

async fn lookup(url: &str) -> reqwest::Result<String> {
    let client = reqwest::Client::builder()
        .connect_timeout(LOOKUP_TIMEOUT)
        .timeout(LOOKUP_TIMEOUT)
        .build()?;
    let geo: GeoIp = client.get(url).send().await?.json().await?;
    Ok(label_from(geo))
}

/// Start the one-shot ISP lookup in the background
pub fn spawn_lookup(url: String) {
    tokio::spawn(async move {
        match lookup(&url).await {
            Ok(label) => {
                info!("ISP detected: {}", label);
                let _ = DISPLAY_LABEL.set(label);
            }
            Err(e) => warn!("Failed to fetch ISP: {}", e),
        }
    });
}

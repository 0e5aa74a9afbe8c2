//! Best-effort hostname resolution for tunnel destinations.

use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

const DOH_TIMEOUT: Duration = Duration::from_secs(5);
const RR_TYPE_A: u16 = 1;

/// Maps a hostname to something `connect` can use.
///
/// Implementations never fail: on any problem they hand back the input so a
/// connect attempt is still made.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str) -> String;
}

/// True for literals that need no lookup
pub fn is_ip_literal(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: i32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    rr_type: u16,
    data: String,
}

/// First A record of a DNS-over-HTTPS JSON answer, if the query succeeded
fn first_a_record(body: &str) -> Option<String> {
    let resp: DohResponse = serde_json::from_str(body).ok()?;
    if resp.status != 0 {
        return None;
    }
    resp.answer
        .into_iter()
        .find(|a| a.rr_type == RR_TYPE_A)
        .map(|a| a.data)
}

/// Resolver backed by a DNS-over-HTTPS JSON endpoint (`?name=..&type=A`)
pub struct DohResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl DohResolver {
    pub fn new(endpoint: impl Into<String>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(DOH_TIMEOUT)
            .timeout(DOH_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    async fn query(&self, host: &str) -> reqwest::Result<Option<String>> {
        let body = self
            .client
            .get(&self.endpoint)
            .query(&[("name", host), ("type", "A")])
            .header("Accept", "application/dns-json")
            .send()
            .await?
            .text()
            .await?;
        Ok(first_a_record(&body))
    }
}

#[async_trait]
impl Resolve for DohResolver {
    async fn resolve(&self, host: &str) -> String {
        if is_ip_literal(host) {
            return host.to_string();
        }
        match self.query(host).await {
            Ok(Some(addr)) => {
                debug!("doh: {} -> {}", host, addr);
                addr
            }
            Ok(None) => {
                debug!("doh: no A record for {}", host);
                host.to_string()
            }
            Err(e) => {
                debug!("doh lookup for {} failed: {}", host, e);
                host.to_string()
            }
        }
    }
}

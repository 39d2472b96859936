//! Best-effort sender-country detection.
//!
//! Never blocks correctness: any failure — private address, network
//! error, lookup service hiccup, unparseable response — degrades to
//! `None` and is not retried.

use std::net::IpAddr;
use std::sync::OnceLock;

use serde::Deserialize;
use tracing::debug;

/// Shared HTTP client for all geolocation requests.
fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent("slowpost/0.1")
            .build()
            .expect("Failed to create HTTP client")
    })
}

/// Request-derived hints for the country lookup.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Country injected by an edge proxy (x-vercel-ip-country,
    /// cf-ipcountry), if any.
    pub country_header: Option<String>,
    /// Best-guess client address: first X-Forwarded-For hop, else the
    /// socket peer.
    pub client_ip: Option<IpAddr>,
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    status: String,
    #[serde(default)]
    country: Option<String>,
}

/// Resolve the sender's country. Header hint first; otherwise a
/// geolocation lookup on a public client address.
pub async fn resolve_country(meta: &RequestMeta) -> Option<String> {
    if let Some(country) = meta
        .country_header
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
    {
        return Some(country.to_string());
    }

    let ip = meta.client_ip?;
    if !is_public(&ip) {
        return None;
    }
    lookup(ip).await
}

async fn lookup(ip: IpAddr) -> Option<String> {
    let url = format!("http://ip-api.com/json/{ip}?fields=status,country");
    let response = match http_client().get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!("Country lookup failed for {ip}: {e}");
            return None;
        }
    };
    let geo: GeoResponse = match response.json().await {
        Ok(geo) => geo,
        Err(e) => {
            debug!("Country lookup returned unparseable body for {ip}: {e}");
            return None;
        }
    };
    if geo.status != "success" {
        return None;
    }
    geo.country.filter(|c| !c.is_empty())
}

/// Addresses a geolocation service could plausibly resolve.
fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            // fc00::/7 is the unique-local range.
            let unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local)
        }
    }
}

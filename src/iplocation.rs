//! Geolocation of miner multiaddrs.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("no multiaddr could be resolved to a location")]
    CantResolve,
    #[error("invalid location resolver url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("location lookup failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn is_empty(&self) -> bool {
        self.country.is_empty() && self.latitude == 0.0 && self.longitude == 0.0
    }
}

/// Resolves a host's multiaddrs to a physical location.
#[async_trait]
pub trait LocationResolver: Send + Sync {
    async fn resolve(&self, multiaddrs: &[String]) -> Result<Location, LocationError>;
}

pub type SharedLocationResolver = Arc<dyn LocationResolver>;

/// Extracts the IP component of a textual multiaddr such as
/// `/ip4/1.2.3.4/tcp/24001`. DNS and relay addresses yield `None`.
pub fn ip_from_multiaddr(multiaddr: &str) -> Option<IpAddr> {
    let mut parts = multiaddr.split('/').filter(|p| !p.is_empty());
    while let Some(proto) = parts.next() {
        let value = parts.next()?;
        if matches!(proto, "ip4" | "ip6") {
            return value.parse().ok();
        }
    }
    None
}

/// Response body of `GET <base>/<ip>`.
#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default, alias = "country_name")]
    country: String,
    #[serde(default, alias = "lat")]
    latitude: f64,
    #[serde(default, alias = "lon")]
    longitude: f64,
}

/// Resolver backed by a JSON geo-IP lookup service.
pub struct HttpLocationResolver {
    http: reqwest::Client,
    base: Url,
}

impl HttpLocationResolver {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, LocationError> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base })
    }

    async fn lookup(&self, ip: IpAddr) -> Result<Location, LocationError> {
        let url = self.base.join(&ip.to_string())?;
        let body: LookupResponse = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(Location {
            country: body.country,
            latitude: body.latitude,
            longitude: body.longitude,
        })
    }
}

#[async_trait]
impl LocationResolver for HttpLocationResolver {
    async fn resolve(&self, multiaddrs: &[String]) -> Result<Location, LocationError> {
        for ma in multiaddrs {
            let Some(ip) = ip_from_multiaddr(ma) else {
                debug!(multiaddr = %ma, "Multiaddr has no ip component");
                continue;
            };
            match self.lookup(ip).await {
                Ok(location) if !location.is_empty() => return Ok(location),
                Ok(_) => debug!(%ip, "No location info for ip"),
                Err(err) => debug!(%ip, error = %err, "Location lookup failed"),
            }
        }
        Err(LocationError::CantResolve)
    }
}

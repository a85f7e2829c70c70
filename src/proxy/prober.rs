//! Reachability probing
//!
//! The scheduler only talks to the [`Prober`] trait, so the transport can be
//! swapped out (tests use in-memory probers). [`HttpProber`] is the default:
//! it measures TCP connect latency to the proxy endpoint and enriches the
//! result with geolocation from an MMDB file or a JSON HTTP endpoint.

use crate::config::ProberSettings;
use crate::error::ProbeError;
use crate::proxy::geo::{is_reserved_ip, GeoInfo, GeoLocator};
use crate::proxy::models::{ProxyRecord, RecordId, Scheme};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Timeout for the geolocation request, independent of the probe deadline
const GEO_TIMEOUT_SECS: u64 = 5;

/// Snapshot of the record fields a probe needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub id: RecordId,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl From<&ProxyRecord> for ProbeTarget {
    fn from(record: &ProxyRecord) -> Self {
        Self {
            id: record.id,
            scheme: record.scheme,
            host: record.host.clone(),
            port: record.port,
        }
    }
}

/// Successful probe measurement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub latency_ms: i64,
    pub geo: Option<GeoInfo>,
}

impl ProbeReport {
    pub fn new(latency_ms: i64) -> Self {
        Self {
            latency_ms,
            geo: None,
        }
    }

    pub fn with_geo(mut self, geo: GeoInfo) -> Self {
        self.geo = Some(geo);
        self
    }
}

/// A single reachability measurement against one proxy endpoint
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> std::result::Result<ProbeReport, ProbeError>;
}

/// Response shape of ip-api compatible endpoints
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeoApiResponse {
    status: String,
    query: Option<String>,
    country_code: Option<String>,
    country: Option<String>,
    message: Option<String>,
}

/// Default prober: TCP connect latency plus optional geolocation
pub struct HttpProber {
    client: Client,
    geo_endpoint: Option<String>,
    geo_locator: Option<GeoLocator>,
}

impl HttpProber {
    /// Create a prober from settings
    ///
    /// An unreadable MMDB file is not fatal; the prober falls back to the
    /// HTTP endpoint.
    pub fn with_settings(settings: &ProberSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(GEO_TIMEOUT_SECS))
            .user_agent(&settings.user_agent)
            .build()?;

        let geo_locator = settings.mmdb_path.as_ref().and_then(|path| {
            GeoLocator::from_path(path)
                .map_err(|e| debug!("MMDB {} unavailable: {}", path, e))
                .ok()
        });

        Ok(Self {
            client,
            geo_endpoint: settings.geo_endpoint.clone(),
            geo_locator,
        })
    }

    pub fn new() -> Result<Self> {
        Self::with_settings(&ProberSettings::default())
    }

    async fn resolve(target: &ProbeTarget) -> std::result::Result<SocketAddr, ProbeError> {
        let mut addrs = tokio::net::lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|e| ProbeError::Resolve(e.to_string()))?;
        addrs
            .next()
            .ok_or_else(|| ProbeError::Resolve(format!("no address for {}", target.host)))
    }

    /// Resolve, then time the TCP handshake alone
    async fn resolve_and_connect(target: &ProbeTarget) -> std::result::Result<(IpAddr, i64), ProbeError> {
        let addr = Self::resolve(target).await?;
        let latency_ms = connect_latency(addr).await?;
        Ok((addr.ip(), latency_ms))
    }

    /// Geolocate a peer address; any failure yields `None`
    async fn locate(&self, ip: IpAddr) -> Option<GeoInfo> {
        if is_reserved_ip(&ip) {
            return Some(GeoInfo::private(ip));
        }

        if let Some(ref locator) = self.geo_locator {
            return locator
                .lookup_ip(ip)
                .map_err(|e| debug!("MMDB lookup for {} failed: {}", ip, e))
                .ok();
        }

        let endpoint = self.geo_endpoint.as_ref()?;
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), ip);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Geo request for {} failed: {}", ip, e);
                return None;
            }
        };
        let body: GeoApiResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                debug!("Malformed geo response for {}: {}", ip, e);
                return None;
            }
        };

        Self::interpret_geo(ip, body)
    }

    fn interpret_geo(ip: IpAddr, body: GeoApiResponse) -> Option<GeoInfo> {
        if body.status == "success" {
            let ip = body
                .query
                .as_deref()
                .and_then(|q| q.parse().ok())
                .unwrap_or(ip);
            return Some(GeoInfo::new(ip, body.country_code, body.country));
        }

        match body.message.as_deref() {
            Some(msg) if msg.contains("private") || msg.contains("reserved") => {
                Some(GeoInfo::private(ip))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> std::result::Result<ProbeReport, ProbeError> {
        // The deadline covers resolution too, the latency only the handshake
        let (ip, latency_ms) = match tokio::time::timeout(timeout, Self::resolve_and_connect(target)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ProbeError::Timeout),
        };

        let report = ProbeReport::new(latency_ms);
        Ok(match self.locate(ip).await {
            Some(geo) => report.with_geo(geo),
            None => report,
        })
    }
}

/// Milliseconds taken by a TCP handshake with an already resolved address
async fn connect_latency(addr: SocketAddr) -> std::result::Result<i64, ProbeError> {
    let start = Instant::now();
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ProbeError::Connect(e.to_string()))?;
    let latency_ms = start.elapsed().as_millis() as i64;
    drop(stream);
    Ok(latency_ms)
}

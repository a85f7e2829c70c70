//! Geolocation for probed proxies
//!
//! Two sources are supported: an offline MMDB file read through
//! [`GeoLocator`], and the JSON endpoint queried by the HTTP prober.

use crate::Result;
use maxminddb::{geoip2, Reader};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;

/// Geolocation attached to a successful probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeoInfo {
    /// Address the proxy host resolved to
    pub ip: Option<String>,
    /// ISO 3166-1 alpha-2 country code (e.g., "US", "DE")
    pub country_code: Option<String>,
    /// Country name in English
    pub country_name: Option<String>,
    /// Set when the address is private or reserved; such results are not applied
    pub is_private: bool,
}

impl GeoInfo {
    pub fn new(ip: IpAddr, country_code: Option<String>, country_name: Option<String>) -> Self {
        Self {
            ip: Some(ip.to_string()),
            country_code,
            country_name,
            is_private: is_reserved_ip(&ip),
        }
    }

    /// Geo info for an address that must not be published
    pub fn private(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip.to_string()),
            is_private: true,
            ..Default::default()
        }
    }

    /// Check if the location has any meaningful data
    pub fn is_empty(&self) -> bool {
        self.ip.is_none() && self.country_code.is_none() && self.country_name.is_none()
    }

    /// Whether the scheduler may copy this onto a record
    pub fn is_publishable(&self) -> bool {
        !self.is_private && !self.is_empty()
    }
}

impl std::fmt::Display for GeoInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.country_name, &self.country_code) {
            (Some(name), Some(code)) => write!(f, "{} ({})", name, code),
            (Some(name), None) => write!(f, "{}", name),
            (None, Some(code)) => write!(f, "{}", code),
            (None, None) => write!(f, "Unknown Location"),
        }
    }
}

/// Whether an address is private, loopback, link-local or otherwise reserved
pub fn is_reserved_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_reserved_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_reserved_v4(&v4),
            None => is_reserved_v6(v6),
        },
    }
}

fn is_reserved_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..=127).contains(&b))
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b == 18 || b == 19))
        || a >= 240
}

fn is_reserved_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link-local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}

/// GeoLocator for looking up IP addresses in MMDB databases
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Create a new GeoLocator from an MMDB file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Look up country data for an address
    pub fn lookup_ip(&self, ip: IpAddr) -> Result<GeoInfo> {
        if is_reserved_ip(&ip) {
            return Ok(GeoInfo::private(ip));
        }

        let lookup_result = self.reader.lookup(ip)?;
        let city: Option<geoip2::City> = lookup_result.decode()?;

        let Some(city) = city else {
            return Ok(GeoInfo::new(ip, None, None));
        };

        Ok(GeoInfo::new(
            ip,
            city.country.iso_code.map(String::from),
            city.country.names.english.map(String::from),
        ))
    }
}

impl Clone for GeoLocator {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
        }
    }
}

//! Proxy inventory data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// Latency value meaning "no valid measurement".
pub const LATENCY_UNKNOWN: i64 = -1;

/// Maximum number of samples kept in a record's latency history
pub const HISTORY_CAP: usize = 10;

/// Opaque, immutable record identifier
pub type RecordId = Uuid;

/// Connection-string scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Vmess,
    Vless,
    Shadowsocks,
    Trojan,
    #[default]
    Unknown,
}

impl Scheme {
    /// URI prefix for this scheme, without `://`
    pub fn prefix(&self) -> Option<&'static str> {
        match self {
            Scheme::Vmess => Some("vmess"),
            Scheme::Vless => Some("vless"),
            Scheme::Shadowsocks => Some("ss"),
            Scheme::Trojan => Some("trojan"),
            Scheme::Unknown => None,
        }
    }

    pub fn from_prefix(prefix: &str) -> Self {
        match prefix.to_ascii_lowercase().as_str() {
            "vmess" => Scheme::Vmess,
            "vless" => Scheme::Vless,
            "ss" => Scheme::Shadowsocks,
            "trojan" => Scheme::Trojan,
            _ => Scheme::Unknown,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Vmess => write!(f, "VMess"),
            Scheme::Vless => write!(f, "VLESS"),
            Scheme::Shadowsocks => write!(f, "Shadowsocks"),
            Scheme::Trojan => write!(f, "Trojan"),
            Scheme::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Test status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    #[default]
    Untested,
    Testing,
    Active,
    Slow,
    Inactive,
}

impl ProxyStatus {
    /// Whether a manual run picks this record up by default
    pub fn needs_test(&self) -> bool {
        matches!(self, ProxyStatus::Untested | ProxyStatus::Inactive)
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyStatus::Untested => write!(f, "untested"),
            ProxyStatus::Testing => write!(f, "testing"),
            ProxyStatus::Active => write!(f, "active"),
            ProxyStatus::Slow => write!(f, "slow"),
            ProxyStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// A single proxy in the inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: RecordId,
    pub raw: String,
    pub scheme: Scheme,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub resolved_ip: Option<String>,
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    /// Last measured latency, [`LATENCY_UNKNOWN`] when untested or failed
    pub latency_ms: i64,
    /// Newest first, at most [`HISTORY_CAP`] entries
    pub latency_history: VecDeque<i64>,
    pub status: ProxyStatus,
    pub score: u8,
    pub speed_kbps: u32,
    pub manual_group: Option<String>,
    /// Names of the smart groups currently matching; recomputed, never stored
    #[serde(skip)]
    pub dynamic_groups: Vec<String>,
    pub last_tested_at: Option<DateTime<Utc>>,
}

impl ProxyRecord {
    /// Create an untested record with a fresh id
    pub fn new(raw: String, scheme: Scheme, name: String, host: String, port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw,
            scheme,
            name,
            host,
            port,
            resolved_ip: None,
            country_code: None,
            country_name: None,
            latency_ms: LATENCY_UNKNOWN,
            latency_history: VecDeque::with_capacity(HISTORY_CAP),
            status: ProxyStatus::Untested,
            score: 0,
            speed_kbps: 0,
            manual_group: None,
            dynamic_groups: Vec::new(),
            last_tested_at: None,
        }
    }

    /// Prepend a latency sample, dropping the oldest beyond the cap
    pub fn push_latency_sample(&mut self, sample: i64) {
        self.latency_history.push_front(sample);
        self.latency_history.truncate(HISTORY_CAP);
    }

    /// Latency, if a valid measurement exists
    pub fn latency(&self) -> Option<i64> {
        (self.latency_ms >= 0).then_some(self.latency_ms)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Last-tested timestamp for display
    pub fn last_tested_display(&self) -> String {
        self.last_tested_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| String::from("Never"))
    }

    /// Whether the record is in the manual group or a matching smart group
    pub fn in_group(&self, group: &str) -> bool {
        self.manual_group.as_deref() == Some(group) || self.dynamic_groups.iter().any(|g| g == group)
    }
}

impl fmt::Display for ProxyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.name, self.scheme, self.address())
    }
}

//! Proxy records and the collaborators around them
//!
//! This module provides functionality for:
//! - Decoding and encoding connection strings (vmess, vless, ss, trojan)
//! - Probing proxy endpoints for reachability and latency
//! - Geolocating resolved addresses
//! - Fetching subscriptions of connection strings

pub mod geo;
pub mod link;
pub mod models;
pub mod prober;
pub mod subscription;

pub use geo::{is_reserved_ip, GeoInfo, GeoLocator};
pub use link::{decode_base64_lenient, DecodedLink, LinkCodec};
pub use models::{ProxyRecord, ProxyStatus, RecordId, Scheme, HISTORY_CAP, LATENCY_UNKNOWN};
pub use prober::{HttpProber, ProbeReport, ProbeTarget, Prober};
pub use subscription::{
    extract_links, split_subscription, FetchResult, FetcherConfig, Subscription, SubscriptionFetcher,
};

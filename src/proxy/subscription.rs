//! Subscription fetching
//!
//! This module provides functionality for:
//! - Fetching subscription bodies over HTTP
//! - Decoding base64 bodies, falling back to plain text
//! - Extracting connection strings from arbitrary text such as HTML pages

use crate::proxy::link::decode_base64_lenient;
use crate::Result;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Subscriptions fetched at the same time
const FETCH_CONCURRENCY: usize = 4;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = "v2rayN/6.0";

/// Regex pattern to match connection strings embedded in text
static LINK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:vmess|vless|ss|trojan)://[^\s"'<>]+"#).expect("Invalid link regex")
});

/// A remote source of connection strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Subscription {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            url: url.to_string(),
            enabled: true,
        }
    }
}

/// Result of fetching a single subscription
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Name of the subscription that was fetched
    pub source: String,
    /// Connection strings found in the body
    pub links: Vec<String>,
    /// Error message if fetching failed
    pub error: Option<String>,
}

impl FetchResult {
    pub fn success(source: String, links: Vec<String>) -> Self {
        Self {
            source,
            links,
            error: None,
        }
    }

    pub fn failure(source: String, error: String) -> Self {
        Self {
            source,
            links: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Configuration for the subscription fetcher
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// HTTP fetcher for subscription bodies
pub struct SubscriptionFetcher {
    client: Client,
}

impl SubscriptionFetcher {
    pub fn new() -> Result<Self> {
        Self::with_config(FetcherConfig::default())
    }

    pub fn with_config(config: FetcherConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { client })
    }

    /// Fetch a URL and split its body into connection strings
    pub async fn fetch_url(&self, url: &str) -> Result<Vec<String>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let content = response.text().await?;
        Ok(split_subscription(&content))
    }

    /// Fetch every enabled subscription, one result per source in input order
    pub async fn fetch_all(&self, subscriptions: &[Subscription]) -> Vec<FetchResult> {
        stream::iter(subscriptions.iter().filter(|s| s.enabled))
            .map(|subscription| async move {
                match self.fetch_url(&subscription.url).await {
                    Ok(links) => {
                        info!("Fetched {} links from {}", links.len(), subscription.name);
                        FetchResult::success(subscription.name.clone(), links)
                    }
                    Err(e) => {
                        warn!("Failed to fetch {}: {}", subscription.name, e);
                        FetchResult::failure(subscription.name.clone(), e.to_string())
                    }
                }
            })
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await
    }
}

/// Split a subscription body into connection strings
///
/// The body is decoded as base64 first; when that fails it is treated as
/// plain text. Blank lines and `#` comments are skipped. If no line looks
/// like a link, links embedded anywhere in the text are extracted instead.
pub fn split_subscription(content: &str) -> Vec<String> {
    let decoded = decode_base64_lenient(content)
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .filter(|text| text.contains("://"));
    let text = decoded.as_deref().unwrap_or(content);

    let links: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| looks_like_link(line))
        .map(String::from)
        .collect();

    if links.is_empty() {
        return extract_links(text);
    }

    links
}

/// A line starting with `scheme://`
fn looks_like_link(line: &str) -> bool {
    line.split_once("://").is_some_and(|(scheme, _)| {
        !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Extract connection strings embedded in arbitrary text
pub fn extract_links(content: &str) -> Vec<String> {
    LINK_REGEX
        .find_iter(content)
        .map(|m| m.as_str().to_string())
        .collect()
}

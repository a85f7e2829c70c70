//! Link codec for proxy connection strings
//!
//! Supported formats:
//! - `vmess://BASE64(JSON)`
//! - `vless://UUID@HOST:PORT?PARAMS#NAME`
//! - `ss://BASE64(METHOD:PASSWORD)@HOST:PORT#NAME` and the legacy
//!   `ss://BASE64(METHOD:PASSWORD@HOST:PORT)#NAME`
//! - `trojan://PASSWORD@HOST:PORT?PARAMS#NAME`
//!
//! Decoding is total: anything that cannot be decoded becomes a placeholder
//! record instead of an error.

use crate::error::LinkError;
use crate::proxy::models::{ProxyRecord, Scheme};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;
use serde_json::{Map, Value};
use tracing::debug;

/// Display name used when a link cannot be decoded
pub const PLACEHOLDER_NAME: &str = "Unnamed Config";

/// Host used when a link cannot be decoded
pub const PLACEHOLDER_HOST: &str = "unknown.host";

/// Characters escaped in userinfo, query and fragment components
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Structured form of a connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLink {
    pub scheme: Scheme,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// UUID, password, or `method:password` for Shadowsocks
    pub credential: Option<String>,
    pub params: Vec<(String, String)>,
}

impl DecodedLink {
    /// Record shape for input that could not be decoded
    pub fn placeholder() -> Self {
        Self {
            scheme: Scheme::Unknown,
            name: PLACEHOLDER_NAME.to_string(),
            host: PLACEHOLDER_HOST.to_string(),
            port: 0,
            credential: None,
            params: Vec::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.scheme == Scheme::Unknown
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Build a fresh inventory record carrying the original string
    pub fn into_record(self, raw: &str) -> ProxyRecord {
        ProxyRecord::new(raw.to_string(), self.scheme, self.name, self.host, self.port)
    }
}

/// Decoder and encoder for connection strings
pub struct LinkCodec;

impl LinkCodec {
    /// Decode a connection string, degrading to a placeholder on any failure
    pub fn decode(raw: &str) -> DecodedLink {
        match Self::try_decode(raw) {
            Ok(link) => link,
            Err(e) => {
                debug!("Falling back to placeholder for {:?}: {}", truncate(raw), e);
                DecodedLink::placeholder()
            }
        }
    }

    /// Decode a connection string straight into a new record
    pub fn to_record(raw: &str) -> ProxyRecord {
        Self::decode(raw).into_record(raw)
    }

    /// Decode a connection string, reporting why it failed
    pub fn try_decode(raw: &str) -> Result<DecodedLink, LinkError> {
        let raw = raw.trim();
        let (prefix, payload) = raw
            .split_once("://")
            .ok_or_else(|| LinkError::UnsupportedScheme(String::new()))?;

        match Scheme::from_prefix(prefix) {
            Scheme::Vmess => Self::decode_vmess(payload),
            Scheme::Shadowsocks => Self::decode_uri(&expand_legacy_shadowsocks(payload), Scheme::Shadowsocks),
            scheme @ (Scheme::Vless | Scheme::Trojan) => Self::decode_uri(raw, scheme),
            Scheme::Unknown => Err(LinkError::UnsupportedScheme(prefix.to_string())),
        }
    }

    /// Encode a decoded link back into a connection string
    pub fn encode(link: &DecodedLink) -> String {
        match link.scheme {
            Scheme::Vmess => Self::encode_vmess(link),
            Scheme::Unknown => String::new(),
            scheme => Self::encode_uri(link, scheme),
        }
    }

    fn decode_vmess(payload: &str) -> Result<DecodedLink, LinkError> {
        let bytes = decode_base64_lenient(payload).ok_or(LinkError::Base64)?;
        let config: Map<String, Value> = serde_json::from_slice(&bytes)?;

        let host = json_string(config.get("add")).ok_or(LinkError::MissingHost)?;
        let port = match config.get("port") {
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| LinkError::InvalidPort(n.to_string()))?,
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| LinkError::InvalidPort(s.clone()))?,
            _ => 0,
        };
        let name = json_string(config.get("ps")).unwrap_or_else(|| default_name(Scheme::Vmess));
        let credential = json_string(config.get("id"));

        let params = config
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "v" | "ps" | "add" | "port" | "id"))
            .filter_map(|(key, value)| json_string(Some(value)).map(|v| (key.clone(), v)))
            .collect();

        Ok(DecodedLink {
            scheme: Scheme::Vmess,
            name,
            host,
            port,
            credential,
            params,
        })
    }

    fn decode_uri(raw: &str, scheme: Scheme) -> Result<DecodedLink, LinkError> {
        let url = Url::parse(raw).map_err(|e| LinkError::Uri(e.to_string()))?;

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or(LinkError::MissingHost)?
            .to_string();
        let port = url.port().unwrap_or(0);

        let name = url
            .fragment()
            .map(|f| percent_decode_str(f).decode_utf8_lossy().trim().to_string())
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| default_name(scheme));

        let user = percent_decode_str(url.username()).decode_utf8_lossy().to_string();
        let credential = match (scheme, url.password()) {
            (_, Some(password)) => Some(format!(
                "{}:{}",
                user,
                percent_decode_str(password).decode_utf8_lossy()
            )),
            // SIP002 carries base64(method:password) as the user part
            (Scheme::Shadowsocks, None) if !user.is_empty() => Some(
                decode_base64_lenient(&user)
                    .and_then(|b| String::from_utf8(b).ok())
                    .unwrap_or(user),
            ),
            (_, None) if !user.is_empty() => Some(user),
            _ => None,
        };

        let params = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(DecodedLink {
            scheme,
            name,
            host,
            port,
            credential,
            params,
        })
    }

    fn encode_vmess(link: &DecodedLink) -> String {
        let mut config = Map::new();
        config.insert("v".to_string(), Value::from("2"));
        config.insert("ps".to_string(), Value::from(link.name.clone()));
        config.insert("add".to_string(), Value::from(link.host.clone()));
        config.insert("port".to_string(), Value::from(link.port));
        config.insert(
            "id".to_string(),
            Value::from(link.credential.clone().unwrap_or_default()),
        );
        for (key, value) in &link.params {
            config.insert(key.clone(), Value::from(value.clone()));
        }

        format!("vmess://{}", STANDARD.encode(Value::Object(config).to_string()))
    }

    fn encode_uri(link: &DecodedLink, scheme: Scheme) -> String {
        let prefix = scheme.prefix().unwrap_or_default();

        let userinfo = match (&link.credential, scheme) {
            (Some(cred), Scheme::Shadowsocks) => format!("{}@", URL_SAFE_NO_PAD.encode(cred)),
            (Some(cred), _) => format!("{}@", utf8_percent_encode(cred, COMPONENT)),
            (None, _) => String::new(),
        };

        let host = if link.host.contains(':') {
            format!("[{}]", link.host)
        } else {
            link.host.clone()
        };

        let query = if link.params.is_empty() {
            String::new()
        } else {
            let pairs: Vec<String> = link
                .params
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}={}",
                        utf8_percent_encode(k, COMPONENT),
                        utf8_percent_encode(v, COMPONENT)
                    )
                })
                .collect();
            format!("?{}", pairs.join("&"))
        };

        format!(
            "{}://{}{}:{}{}#{}",
            prefix,
            userinfo,
            host,
            link.port,
            query,
            utf8_percent_encode(&link.name, COMPONENT)
        )
    }
}

/// Decode base64 in either alphabet, padded or not, ignoring whitespace
pub fn decode_base64_lenient(input: &str) -> Option<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let unpadded = cleaned.trim_end_matches('=');
    if unpadded.is_empty() {
        return None;
    }

    if unpadded.contains(['-', '_']) {
        URL_SAFE_NO_PAD.decode(unpadded).ok()
    } else {
        STANDARD_NO_PAD.decode(unpadded).ok()
    }
}

/// Rewrite `ss://BASE64(method:pass@host:port)#name` into SIP002-like form.
///
/// Returns a full `ss://` string either way.
fn expand_legacy_shadowsocks(payload: &str) -> String {
    let (body, fragment) = match payload.split_once('#') {
        Some((body, fragment)) => (body, Some(fragment)),
        None => (payload, None),
    };

    let expanded = if body.contains('@') {
        None
    } else {
        decode_base64_lenient(body)
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|plain| plain.contains('@'))
    };

    let body = expanded.as_deref().unwrap_or(body);
    match fragment {
        Some(fragment) => format!("ss://{}#{}", body, fragment),
        None => format!("ss://{}", body),
    }
}

fn default_name(scheme: Scheme) -> String {
    format!("{} Config", scheme)
}

fn json_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn truncate(raw: &str) -> String {
    raw.chars().take(48).collect()
}

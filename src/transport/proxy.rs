//! Proxy rotation stage
//!
//! Picks the next egress endpoint round-robin and routes the call through a
//! client bound to that endpoint. Each endpoint gets its own client (own cookie
//! jar and connection pool); clients are created lazily and cached for the
//! lifetime of the stage.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};
use url::Url;

use super::http::HttpTransport;
use super::Transport;
use crate::error::{FetchError, ProxyError, Result};
use crate::models::{FetchRequest, FetchResponse};

/// Proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
    Socks5h,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks5 => "socks5",
            ProxyScheme::Socks5h => "socks5h",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyScheme::Http),
            "https" => Some(ProxyScheme::Https),
            "socks5" => Some(ProxyScheme::Socks5),
            "socks5h" => Some(ProxyScheme::Socks5h),
            _ => None,
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            ProxyScheme::Http => 80,
            ProxyScheme::Https => 443,
            ProxyScheme::Socks5 | ProxyScheme::Socks5h => 1080,
        }
    }
}

/// A parsed egress proxy address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    url: Url,
    scheme: ProxyScheme,
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

impl ProxyEndpoint {
    /// Parse `scheme://[user:pass@]host[:port]`; a bare `host:port` means http
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FetchError::InvalidProxyAddress("empty proxy address".into()));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| FetchError::InvalidProxyAddress(format!("{}: {}", redact(raw), e)))?;

        if url.fragment().is_some() || url.query().is_some() {
            return Err(FetchError::InvalidProxyAddress(format!(
                "{}: must not include query/fragment",
                redact(raw)
            )));
        }
        if !(url.path().is_empty() || url.path() == "/") {
            return Err(FetchError::InvalidProxyAddress(format!(
                "{}: must not include a path",
                redact(raw)
            )));
        }

        let scheme = ProxyScheme::from_name(url.scheme()).ok_or_else(|| {
            FetchError::InvalidProxyAddress(format!("unsupported scheme: {}", url.scheme()))
        })?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                FetchError::InvalidProxyAddress(format!("{}: missing host", redact(raw)))
            })?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_string();

        let port = url.port().unwrap_or_else(|| scheme.default_port());

        let username = if url.username().is_empty() {
            None
        } else {
            Some(url.username().to_string())
        };
        let password = url.password().map(str::to_string);

        Ok(Self {
            url,
            scheme,
            host,
            port,
            username,
            password,
        })
    }

    /// Full proxy URL, credentials included
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Cache key; distinct credentials are distinct identities
    pub fn key(&self) -> &str {
        self.url.as_str()
    }

    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }
}

/// Credential-free form, safe for logs and error messages
impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme.as_str(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
        }
    }
}

fn redact(raw: &str) -> String {
    match (raw.find("://"), raw.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &raw[..scheme_end], &raw[at + 1..])
        }
        (None, Some(at)) => format!("***@{}", &raw[at + 1..]),
        _ => raw.to_string(),
    }
}

/// Ordered endpoints with a shared cursor
///
/// Uses an atomic cursor for lock-free round-robin: every call to
/// [`ProxyRotator::next`] takes a distinct ticket.
#[derive(Debug)]
pub struct ProxyRotator {
    endpoints: Vec<ProxyEndpoint>,
    cursor: AtomicUsize,
}

impl ProxyRotator {
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Self {
        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Parse every entry; the first malformed one fails the whole list
    pub fn from_strings(raw: &[String]) -> Result<Self> {
        let endpoints = raw
            .iter()
            .map(|s| ProxyEndpoint::parse(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(endpoints))
    }

    /// One-element rotation for an endpoint re-resolved by a remote service
    pub fn single(endpoint: ProxyEndpoint) -> Self {
        Self::new(vec![endpoint])
    }

    /// Endpoint at `cursor % len`, advancing the cursor; `None` when empty
    pub fn next(&self) -> Option<&ProxyEndpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        self.endpoints.get(idx)
    }

    pub fn endpoints(&self) -> &[ProxyEndpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Proxy rotation stage
pub struct ProxyTransport {
    base: Arc<HttpTransport>,
    rotator: ProxyRotator,
    clients: DashMap<String, Arc<HttpTransport>>,
}

impl ProxyTransport {
    pub fn new(base: Arc<HttpTransport>, rotator: ProxyRotator) -> Self {
        info!(endpoints = rotator.len(), "Proxy rotation enabled");
        Self {
            base,
            rotator,
            clients: DashMap::new(),
        }
    }

    /// Round-robin over a static list
    pub fn with_list(base: Arc<HttpTransport>, proxy_list: &[String]) -> Result<Self> {
        Ok(Self::new(base, ProxyRotator::from_strings(proxy_list)?))
    }

    /// Single endpoint whose egress address is rotated remotely
    pub fn with_rotation(base: Arc<HttpTransport>, rotation_url: &str) -> Result<Self> {
        Ok(Self::new(
            base,
            ProxyRotator::single(ProxyEndpoint::parse(rotation_url)?),
        ))
    }

    pub fn rotator(&self) -> &ProxyRotator {
        &self.rotator
    }

    /// Cached client for `endpoint`, created on first use.
    ///
    /// The map entry holds its shard lock while the client is built, so
    /// concurrent first lookups for one endpoint produce a single client.
    pub fn client_for(&self, endpoint: &ProxyEndpoint) -> Result<Arc<HttpTransport>> {
        if let Some(client) = self.clients.get(endpoint.key()) {
            return Ok(Arc::clone(client.value()));
        }

        let entry = self
            .clients
            .entry(endpoint.key().to_string())
            .or_try_insert_with(|| {
                HttpTransport::with_proxy(self.base.settings(), endpoint).map(Arc::new)
            })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Number of endpoint clients created so far
    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }
}

#[async_trait]
impl Transport for ProxyTransport {
    async fn execute(&self, request: FetchRequest) -> Result<FetchResponse> {
        let Some(endpoint) = self.rotator.next() else {
            return self.base.execute(request).await;
        };

        let client = self.client_for(endpoint)?;
        debug!(proxy = %endpoint, url = %request.url, "Routing request through proxy");

        match client.execute(request).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => Err(ProxyError::new(endpoint.to_string(), e).into()),
        }
    }

    fn stage_name(&self) -> &'static str {
        "proxy"
    }
}

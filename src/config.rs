use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{FetchError, Result};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Fetch pipeline configuration
    pub transport: TransportConfig,
    /// Logging configuration
    pub log: LogConfig,
}

/// Settings of the base network client.
///
/// Every per-proxy client is built from the same settings so timeouts and
/// pooling stay identical across egress identities.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpSettings {
    /// Whole-request timeout for a single attempt (None = unbounded)
    pub request_timeout: Option<Duration>,
    /// TCP connect timeout, TLS handshake included
    pub connect_timeout: Duration,
    /// TCP keep-alive interval
    pub tcp_keepalive: Duration,
    /// Budget for the TLS handshake; folded into the connect timeout
    pub tls_handshake_timeout: Duration,
    /// Maximum wait between reads once the request is sent
    pub response_header_timeout: Duration,
    /// Idle connections kept across all hosts (advisory, see DESIGN.md)
    pub max_idle_connections: usize,
    /// Idle connections kept per host
    pub max_idle_per_host: usize,
    /// How long an idle pooled connection survives
    pub idle_connection_timeout: Duration,
    /// Redirect hops followed before giving up
    pub max_redirects: usize,
    /// User-Agent sent when the request carries none
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            tcp_keepalive: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(15),
            max_idle_connections: 100,
            max_idle_per_host: 20,
            idle_connection_timeout: Duration::from_secs(90),
            max_redirects: 10,
            user_agent: concat!("rota-fetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpSettings {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Pipeline assembly options
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Base client settings
    pub http: HttpSettings,
    /// Retries after the first attempt (0 disables the retry stage)
    pub retries: u32,
    /// First backoff step
    pub retry_base_delay: Duration,
    /// Backoff ceiling
    pub retry_max_delay: Duration,
    /// Concurrent in-flight requests (0 disables the limiter)
    pub workers: usize,
    /// Proxy mode (disabled, list, rotation); validated when the pipeline is built
    pub proxy_mode: String,
    /// Ordered proxy endpoints for list mode
    pub proxy_list: Vec<String>,
    /// Externally rotated endpoint for rotation mode
    pub rotation_url: String,
    /// Deadline for one logical call across all attempts
    pub call_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            http: HttpSettings::default(),
            retries: 3,
            retry_base_delay: Duration::from_millis(300),
            retry_max_delay: Duration::from_secs(8),
            workers: 8,
            proxy_mode: "disabled".to_string(),
            proxy_list: Vec::new(),
            rotation_url: String::new(),
            call_timeout: Some(Duration::from_secs(120)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let timeout_secs: u64 = parse_env("FETCH_TIMEOUT_SECONDS", "30")?;
        let deadline_secs: u64 = parse_env("FETCH_DEADLINE_SECONDS", "120")?;

        Ok(Config {
            transport: TransportConfig {
                http: HttpSettings::default().with_timeout(seconds(timeout_secs)),
                retries: parse_env("FETCH_RETRIES", "3")?,
                retry_base_delay: Duration::from_millis(parse_env(
                    "FETCH_RETRY_BASE_DELAY_MS",
                    "300",
                )?),
                retry_max_delay: Duration::from_millis(parse_env(
                    "FETCH_RETRY_MAX_DELAY_MS",
                    "8000",
                )?),
                workers: parse_env("FETCH_WORKERS", "8")?,
                proxy_mode: get_env_or("PROXY_MODE", "disabled"),
                proxy_list: get_env_or("PROXY_LIST", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                rotation_url: get_env_or("PROXY_ROTATION_URL", "").trim().to_string(),
                call_timeout: seconds(deadline_secs),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FetchError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse configuration from YAML text.
    ///
    /// Sections the pipeline does not consume are ignored.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let file: FileConfig = serde_yaml::from_str(raw)
            .map_err(|e| FetchError::InvalidConfig(format!("invalid YAML config: {}", e)))?;

        let defaults = TransportConfig::default();
        let timeout_secs = file.http.timeout_seconds.unwrap_or(30);
        let deadline_secs = file.http.deadline_seconds.unwrap_or(120);

        Ok(Config {
            transport: TransportConfig {
                http: HttpSettings::default().with_timeout(seconds(timeout_secs)),
                retries: file.http.retries.unwrap_or(defaults.retries),
                retry_base_delay: file
                    .http
                    .retry_base_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry_base_delay),
                retry_max_delay: file
                    .http
                    .retry_max_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry_max_delay),
                workers: file.concurrency.workers.unwrap_or(defaults.workers),
                proxy_mode: file.proxy.mode.unwrap_or(defaults.proxy_mode),
                proxy_list: file
                    .proxy
                    .list
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                rotation_url: file.proxy.rotation_url.unwrap_or_default().trim().to_string(),
                call_timeout: seconds(deadline_secs),
            },
            log: LogConfig {
                level: file.log.level.unwrap_or_else(|| "info".to_string()),
                format: file.log.format.unwrap_or_else(|| "pretty".to_string()),
            },
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    http: FileHttp,
    proxy: FileProxy,
    concurrency: FileConcurrency,
    log: FileLog,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileHttp {
    timeout_seconds: Option<u64>,
    retries: Option<u32>,
    deadline_seconds: Option<u64>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileProxy {
    mode: Option<String>,
    list: Vec<String>,
    rotation_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConcurrency {
    workers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileLog {
    level: Option<String>,
    format: Option<String>,
}

/// Zero seconds means "no limit"
fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| FetchError::InvalidConfig(format!("{} must be a valid number", key)))
}

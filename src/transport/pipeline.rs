//! Pipeline assembly
//!
//! Stages are stacked bottom-up: base, then proxy rotation (unless disabled),
//! then retry (retries > 0), then the limiter (workers > 0) outermost.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::http::HttpTransport;
use super::limiter::{ConcurrencyLimiter, LimitedTransport};
use super::proxy::ProxyTransport;
use super::retry::{RetryPolicy, RetryTransport};
use super::Transport;
use crate::config::TransportConfig;
use crate::error::{FetchError, Result};
use crate::models::{FetchRequest, FetchResponse};

/// How egress proxies are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// Direct connections
    #[default]
    Disabled,
    /// Round-robin over a static list
    List,
    /// One endpoint whose egress address is rotated remotely
    Rotation,
}

impl ProxyMode {
    /// Case-insensitive; an empty string means disabled
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "disabled" => Ok(ProxyMode::Disabled),
            "list" => Ok(ProxyMode::List),
            "rotation" => Ok(ProxyMode::Rotation),
            _ => Err(FetchError::UnknownProxyMode(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Disabled => "disabled",
            ProxyMode::List => "list",
            ProxyMode::Rotation => "rotation",
        }
    }
}

impl FromStr for ProxyMode {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assembled stage stack
pub struct Pipeline {
    transport: Arc<dyn Transport>,
    call_timeout: Option<Duration>,
    stages: Vec<&'static str>,
}

impl Pipeline {
    /// Stage names, outermost first
    pub fn stages(&self) -> &[&'static str] {
        &self.stages
    }

    /// Deadline applied to calls that carry none
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

#[async_trait]
impl Transport for Pipeline {
    async fn execute(&self, request: FetchRequest) -> Result<FetchResponse> {
        let request = match (request.deadline(), self.call_timeout) {
            (None, Some(timeout)) => request.with_timeout(timeout),
            _ => request,
        };
        self.transport.execute(request).await
    }

    fn stage_name(&self) -> &'static str {
        "pipeline"
    }
}

/// Build the full pipeline from configuration.
///
/// The proxy mode is validated before any client is created.
pub fn build(config: &TransportConfig) -> Result<Pipeline> {
    ProxyMode::parse(&config.proxy_mode)?;
    let base = Arc::new(HttpTransport::new(config.http.clone())?);
    build_with_base(base, config)
}

/// Build the pipeline over an existing base client
pub fn build_with_base(base: Arc<HttpTransport>, config: &TransportConfig) -> Result<Pipeline> {
    let mode = ProxyMode::parse(&config.proxy_mode)?;

    let mut stages = vec![base.stage_name()];
    let transport: Arc<dyn Transport> = match mode {
        ProxyMode::Disabled => base,
        ProxyMode::List => Arc::new(ProxyTransport::with_list(base, &config.proxy_list)?),
        ProxyMode::Rotation => {
            if config.rotation_url.trim().is_empty() {
                return Err(FetchError::InvalidConfig(
                    "proxy mode 'rotation' requires a rotation URL".to_string(),
                ));
            }
            Arc::new(ProxyTransport::with_rotation(base, &config.rotation_url)?)
        }
    };
    if mode != ProxyMode::Disabled {
        stages.insert(0, transport.stage_name());
    }

    let pipeline = assemble(transport, stages, config);
    info!(
        proxy_mode = %mode,
        "Transport pipeline ready: {}",
        pipeline.stages.join(" -> ")
    );
    Ok(pipeline)
}

/// Wrap any stage with the retry and limiter layers the configuration asks for
pub fn layer(inner: Arc<dyn Transport>, config: &TransportConfig) -> Pipeline {
    let stages = vec![inner.stage_name()];
    assemble(inner, stages, config)
}

fn assemble(
    inner: Arc<dyn Transport>,
    mut stages: Vec<&'static str>,
    config: &TransportConfig,
) -> Pipeline {
    let mut transport = inner;

    if config.retries > 0 {
        let policy = RetryPolicy {
            max_retries: config.retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        };
        transport = Arc::new(RetryTransport::new(transport, policy));
        stages.insert(0, "retry");
    }

    if config.workers > 0 {
        transport = Arc::new(LimitedTransport::new(
            transport,
            ConcurrencyLimiter::new(config.workers),
        ));
        stages.insert(0, "limiter");
    }

    Pipeline {
        transport,
        call_timeout: config.call_timeout,
        stages,
    }
}

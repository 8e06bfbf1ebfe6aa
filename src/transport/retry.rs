//! Retry stage with exponential backoff
//!
//! Retries network failures, proxy failures, 429 and 5xx responses. Attempts
//! within one call are strictly sequential and every wait races the request's
//! cancellation token and deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tracing::{debug, warn};

use super::Transport;
use crate::error::{FetchError, Result};
use crate::models::{drain_body, FetchRequest, FetchResponse, DRAIN_LIMIT};

/// Longest server-requested wait honored for a 429
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Retry budget and backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// 300ms base, 8s ceiling
    pub fn standard(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(8),
        }
    }

    /// Jittered delay before the retry that follows attempt `attempt` (0-based):
    /// `min(base * 2^attempt, max) * U(0.5, 1.5)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        exp.mul_f64(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard(3)
    }
}

/// 429 and every 5xx
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Integer-seconds `Retry-After` hint, clamped to [`MAX_RETRY_AFTER`].
///
/// HTTP-date values, zero and garbage yield `None`.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    if secs == 0 {
        return None;
    }
    Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Retry stage
pub struct RetryTransport {
    inner: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RetryTransport {
    pub fn new(inner: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Transport for RetryTransport {
    async fn execute(&self, request: FetchRequest) -> Result<FetchResponse> {
        let max_attempts = self.policy.max_retries + 1;
        let mut last_error = None;

        for attempt in 0..max_attempts {
            request.check_active()?;

            let mut hint = None;
            match self.inner.execute(request.clone()).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !is_retryable_status(status) {
                        return Ok(response);
                    }
                    if status == 429 {
                        hint = retry_after(response.headers());
                    }

                    let drained = request
                        .guard(async { Ok(drain_body(response, DRAIN_LIMIT).await) })
                        .await?;
                    warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        status,
                        url = %request.url,
                        drained,
                        "Retryable status"
                    );
                    last_error = Some(FetchError::RetryableStatus {
                        status,
                        url: request.url.to_string(),
                    });
                }
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    match e.as_proxy() {
                        Some(proxy_err) => warn!(
                            attempt = attempt + 1,
                            max_attempts,
                            proxy = proxy_err.proxy(),
                            cause = %proxy_err.cause(),
                            url = %request.url,
                            "Proxy attempt failed"
                        ),
                        None => warn!(
                            attempt = attempt + 1,
                            max_attempts,
                            error = %e,
                            url = %request.url,
                            "Attempt failed"
                        ),
                    }
                    last_error = Some(e);
                }
            }

            if attempt == self.policy.max_retries {
                break;
            }

            let delay = match hint {
                Some(wait) => {
                    debug!("Honoring Retry-After of {:?} for {}", wait, request.url);
                    wait
                }
                None => self.policy.backoff(attempt),
            };
            debug!(
                delay_ms = delay.as_millis() as u64,
                next_attempt = attempt + 2,
                "Backing off"
            );
            request.sleep(delay).await?;
        }

        warn!(
            "All {} attempts failed for {} {}",
            max_attempts, request.method, request.url
        );
        Err(last_error
            .unwrap_or_else(|| FetchError::Internal("retry loop made no attempt".to_string())))
    }

    fn stage_name(&self) -> &'static str {
        "retry"
    }
}

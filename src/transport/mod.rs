//! Resilient transport pipeline
//!
//! Every stage implements [`Transport`] and wraps the next one:
//! - `limiter`: bounds in-flight requests (outermost)
//! - `retry`: classifies outcomes and retries with backoff
//! - `proxy`: rotates egress endpoints with per-endpoint clients
//! - `http`: the base network client
//!
//! [`pipeline::build`] assembles them from a [`crate::config::TransportConfig`].

pub mod http;
pub mod limiter;
pub mod pipeline;
pub mod proxy;
pub mod retry;

pub use self::http::HttpTransport;
pub use limiter::{ConcurrencyLimiter, LimitedTransport};
pub use pipeline::{build, build_with_base, layer, Pipeline, ProxyMode};
pub use proxy::{ProxyEndpoint, ProxyRotator, ProxyTransport};
pub use retry::{RetryPolicy, RetryTransport};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{FetchRequest, FetchResponse};

/// Capability shared by every stage and by the base client
///
/// Implementations must honor the request's cancellation token and deadline
/// at every suspension point.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute one logical call
    async fn execute(&self, request: FetchRequest) -> Result<FetchResponse>;

    /// Short stage name used in logs and pipeline descriptions
    fn stage_name(&self) -> &'static str;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-process stage for exercising the decorators

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::Transport;
    use crate::error::{FetchError, Result};
    use crate::models::{FetchRequest, FetchResponse};

    pub(crate) enum Step {
        Status(u16),
        StatusWithHeader(u16, &'static str, &'static str),
        Fail(FetchError),
    }

    /// Replays a script of outcomes, then answers with a fixed status
    pub(crate) struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        fallback: u16,
        latency: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        call_times: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                fallback: 200,
                latency: Duration::ZERO,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                call_times: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn always(status: u16) -> Self {
            let mut transport = Self::new(Vec::new());
            transport.fallback = status;
            transport
        }

        pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        pub(crate) fn call_times(&self) -> Vec<Instant> {
            self.call_times.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(&self, request: FetchRequest) -> Result<FetchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().unwrap().push(Instant::now());

            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            let outcome = request
                .guard(async {
                    if !self.latency.is_zero() {
                        tokio::time::sleep(self.latency).await;
                    }
                    Ok(())
                })
                .await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome?;

            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Status(code)) => Ok(response(code, None)),
                Some(Step::StatusWithHeader(code, name, value)) => {
                    Ok(response(code, Some((name, value))))
                }
                Some(Step::Fail(err)) => Err(err),
                None => Ok(response(self.fallback, None)),
            }
        }

        fn stage_name(&self) -> &'static str {
            "scripted"
        }
    }

    fn response(code: u16, header: Option<(&'static str, &'static str)>) -> FetchResponse {
        let mut builder = ::http::Response::builder().status(code);
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        builder.body(format!("status {}", code)).unwrap().into()
    }
}

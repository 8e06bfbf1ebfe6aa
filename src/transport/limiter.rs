//! Concurrency limiter stage

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, trace};

use super::Transport;
use crate::error::{FetchError, Result};
use crate::models::{FetchRequest, FetchResponse};

/// Fixed pool of execution slots
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    /// A capacity of 0 is raised to 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot. The wait has no timeout of its own but ends as soon as
    /// the request is cancelled or its deadline passes. Dropping the permit
    /// frees the slot.
    pub async fn acquire(&self, request: &FetchRequest) -> Result<OwnedSemaphorePermit> {
        let semaphore = self.semaphore.clone();
        request
            .guard(async move {
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| FetchError::Internal("concurrency limiter closed".to_string()))
            })
            .await
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Limiter stage
pub struct LimitedTransport {
    inner: Arc<dyn Transport>,
    limiter: ConcurrencyLimiter,
}

impl LimitedTransport {
    pub fn new(inner: Arc<dyn Transport>, limiter: ConcurrencyLimiter) -> Self {
        info!(capacity = limiter.capacity(), "Concurrency limiter enabled");
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }
}

#[async_trait]
impl Transport for LimitedTransport {
    async fn execute(&self, request: FetchRequest) -> Result<FetchResponse> {
        let _permit = self.limiter.acquire(&request).await?;
        trace!(
            available = self.limiter.available(),
            url = %request.url,
            "Acquired execution slot"
        );
        self.inner.execute(request).await
    }

    fn stage_name(&self) -> &'static str {
        "limiter"
    }
}

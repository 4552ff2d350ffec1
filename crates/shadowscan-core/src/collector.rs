//! Collector capability layer.
//!
//! A [`Collector`] is one platform adapter over the fixed capability set:
//! authenticate (implicit in every call), discover automations per
//! sub-method, and refresh tokens. Adapters are selected by the connection's
//! platform type through the [`CollectorRegistry`], so new platforms add an
//! implementation, not new call sites.
//!
//! The adapter boundary is also the error boundary: collectors map every
//! platform failure into the [`CollectorError`] taxonomy before it leaves
//! this layer.

use crate::error::CollectorError;
use crate::shared::{
    OAuthCredential, PlatformConnection, PlatformType, RawCandidate, RefreshedToken, SourceMethod,
};
use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Transient-failure retry budget per operation.
const TRANSIENT_MAX_RETRIES: usize = 3;
/// Rate-limit retry budget per operation.
const RATE_LIMIT_MAX_RETRIES: usize = 3;
/// Base delay for exponential backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Platform-side token refresh capability, consumed by the credential store.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken, CollectorError>;
}

/// Everything a sub-method run needs: the connection, a usable credential,
/// and the session's cancellation token.
pub struct CollectContext {
    pub connection: PlatformConnection,
    pub credential: OAuthCredential,
    pub cancel: CancellationToken,
}

/// One platform adapter.
#[async_trait]
pub trait Collector: TokenRefresher {
    fn platform_type(&self) -> PlatformType;

    /// Sub-methods this adapter will run for the given connection. Workspace
    /// kind gating happens here (e.g. service-account enumeration is skipped
    /// for consumer connections without a hosted-domain marker).
    fn sub_methods(&self, connection: &PlatformConnection) -> Vec<SourceMethod>;

    /// Runs one sub-method to completion, emitting candidates on `tx` in the
    /// documented order (`modified_at` descending when available, else
    /// `external_id` ascending). The stream is finite and non-restartable.
    async fn collect(
        &self,
        ctx: &CollectContext,
        method: SourceMethod,
        tx: mpsc::Sender<RawCandidate>,
    ) -> Result<(), CollectorError>;
}

/// Adapter lookup by platform type.
#[derive(Default)]
pub struct CollectorRegistry {
    adapters: HashMap<PlatformType, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn Collector>) {
        self.adapters.insert(adapter.platform_type(), adapter);
    }

    pub fn get(&self, platform_type: PlatformType) -> Option<Arc<dyn Collector>> {
        self.adapters.get(&platform_type).cloned()
    }

    pub fn registered_platforms(&self) -> Vec<PlatformType> {
        self.adapters.keys().copied().collect()
    }
}

// -----------------------------------------------------------------------------
// Per-host rate limiting
// -----------------------------------------------------------------------------

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per platform host. `acquire` waits until a request slot is
/// available, pausing the calling sub-method instead of hammering the API.
pub struct HostRateLimiter {
    /// Refill rate, requests per second.
    rps: f64,
    /// Burst capacity.
    burst: f64,
    buckets: DashMap<String, Arc<tokio::sync::Mutex<Bucket>>>,
}

impl HostRateLimiter {
    pub fn new(rps: f64) -> Self {
        let rps = if rps.is_finite() && rps > 0.0 { rps } else { 1.0 };
        Self {
            rps,
            burst: rps.max(1.0).ceil(),
            buckets: DashMap::new(),
        }
    }

    fn bucket(&self, host: &str) -> Arc<tokio::sync::Mutex<Bucket>> {
        self.buckets
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(Bucket {
                    tokens: self.burst,
                    last_refill: Instant::now(),
                }))
            })
            .clone()
    }

    /// Takes one token for `host`, sleeping until the bucket refills when
    /// necessary.
    pub async fn acquire(&self, host: &str) {
        let bucket = self.bucket(host);
        loop {
            let wait = {
                let mut b = bucket.lock().await;
                let elapsed = b.last_refill.elapsed().as_secs_f64();
                b.tokens = (b.tokens + elapsed * self.rps).min(self.burst);
                b.last_refill = Instant::now();
                if b.tokens >= 1.0 {
                    b.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - b.tokens) / self.rps)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

// -----------------------------------------------------------------------------
// Retry
// -----------------------------------------------------------------------------

/// Runs `op` with the taxonomy-aware retry policy: `Transient` retries with
/// exponential backoff (base 500 ms, factor 2, jittered, up to 3 retries);
/// `RateLimited` sleeps for the platform-provided `retry_after` up to 3
/// times; everything else propagates immediately. Cancellation interrupts any
/// sleep and surfaces the last error.
pub async fn with_retry<T, Fut, F>(
    label: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, CollectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollectorError>>,
{
    let mut backoff = ExponentialBuilder::default()
        .with_min_delay(BACKOFF_BASE)
        .with_factor(2.0)
        .with_max_times(TRANSIENT_MAX_RETRIES)
        .with_jitter()
        .build();
    let mut rate_limit_retries = 0usize;

    loop {
        if cancel.is_cancelled() {
            return Err(CollectorError::Transient(format!("{label}: cancelled")));
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(CollectorError::RateLimited { retry_after })
                if rate_limit_retries < RATE_LIMIT_MAX_RETRIES =>
            {
                rate_limit_retries += 1;
                tracing::debug!(
                    target: "shadowscan::collector",
                    op = label,
                    attempt = rate_limit_retries,
                    delay_ms = retry_after.as_millis() as u64,
                    "rate limited; backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(CollectorError::Transient(format!("{label}: cancelled")));
                    }
                    _ = tokio::time::sleep(retry_after) => {}
                }
            }
            Err(CollectorError::RateLimited { retry_after }) => {
                // Budget exhausted: treated as a transient-fatal sub-method failure.
                return Err(CollectorError::Transient(format!(
                    "{label}: rate-limit retry budget exhausted (last retry_after {retry_after:?})"
                )));
            }
            Err(err @ CollectorError::Transient(_)) => match backoff.next() {
                Some(delay) => {
                    tracing::debug!(
                        target: "shadowscan::collector",
                        op = label,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure; retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(CollectorError::Transient(format!("{label}: cancelled")));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}

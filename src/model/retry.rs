// src/model/retry.rs
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::pipeline::{RetrySection, TierSection};
use crate::error::TierError;
use crate::model::{ModelTier, TierRequest, TierResponse};

/// Jittered exponential backoff around a single tier call.
///
/// Each attempt runs under `call_timeout`. Transient failures are retried up to
/// `max_attempts` total; terminal failures return immediately. Running out of
/// attempts yields `TierError::RetriesExhausted` wrapping the last failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: usize,
        base_delay_ms: u64,
        max_delay_ms: u64,
        jitter_pct: f64,
        call_timeout: Duration,
    ) -> Self {
        let base = base_delay_ms.max(1);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: base,
            max_delay_ms: max_delay_ms.max(base),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
            call_timeout: if call_timeout.is_zero() {
                Duration::from_secs(30)
            } else {
                call_timeout
            },
        }
    }

    pub fn from_config(retry: &RetrySection, tiers: &TierSection) -> Self {
        Self::new(
            retry.max_attempts,
            retry.base_delay_ms,
            retry.max_delay_ms,
            retry.jitter_pct,
            Duration::from_secs(tiers.timeout_secs),
        )
    }

    pub(crate) fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        let jittered = if self.jitter_pct > 0.0 {
            let spread = (delay as f64 * self.jitter_pct) as i64;
            let delta = rand::rng().random_range(-spread..=spread);
            delay.saturating_add_signed(delta)
        } else {
            delay
        };
        Duration::from_millis(jittered)
    }

    /// Call `tier` with retries. Never retries past `max_attempts`.
    pub async fn call(
        &self,
        tier: &dyn ModelTier,
        request: &TierRequest,
    ) -> Result<TierResponse, TierError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = match timeout(self.call_timeout, tier.complete(request)).await {
                Ok(r) => r,
                Err(_) => Err(TierError::Timeout {
                    secs: self.call_timeout.as_secs(),
                }),
            };

            let err = match result {
                Ok(resp) => {
                    debug!(
                        tier = %request.kind,
                        model = tier.model_id(),
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "tier call ok"
                    );
                    return Ok(resp);
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                return Err(TierError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let mut delay = self.next_delay(attempt - 1);
            if let TierError::RateLimited {
                retry_after: Some(hint),
            } = &err
            {
                delay = delay.max(*hint);
            }
            warn!(
                tier = %request.kind,
                model = tier.model_id(),
                attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "transient tier failure, backing off"
            );
            sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, 250, 8_000, 0.25, Duration::from_secs(30))
    }
}

//! Process-wide token bucket shared by every outbound osu! API call.
//!
//! The bucket itself is a `governor` GCRA limiter. On top of it sits a bounded,
//! first-come-first-served wait queue: callers that find the bucket empty queue up
//! for the next token, and once the queue is full acquisition is denied with a
//! retry-after hint instead.
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use super::config::LimiterConfig;
use super::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    Granted,
    /// Wait queue is full; try again later.
    Denied { retry_after: Option<Duration> },
}

pub struct SharedLimiter {
    bucket: DefaultDirectRateLimiter,
    clock: DefaultClock,
    waiters: Semaphore,
    queue_limit: usize,
    turnstile: Mutex<()>,
    per_token: Duration,
    fallback_retry: Duration,
}

impl SharedLimiter {
    pub fn new(cfg: &LimiterConfig) -> Self {
        let per_token = cfg.period / cfg.tokens_per_period.max(1);
        let capacity = NonZeroU32::new(cfg.capacity.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(per_token.max(Duration::from_nanos(1)))
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(capacity);
        Self {
            bucket: RateLimiter::direct(quota),
            clock: DefaultClock::default(),
            waiters: Semaphore::new(cfg.queue_limit),
            queue_limit: cfg.queue_limit,
            turnstile: Mutex::new(()),
            per_token,
            fallback_retry: cfg.fallback_retry,
        }
    }

    pub fn fallback_retry(&self) -> Duration {
        self.fallback_retry
    }

    fn time_until_next_token(&self) -> Option<Duration> {
        match self.bucket.check() {
            Ok(()) => None,
            Err(not_until) => Some(not_until.wait_time_from(self.clock.now())),
        }
    }

    /// Try to obtain one slot.
    ///
    /// Returns `Granted` once a token has been consumed, `Denied` when the wait
    /// queue is saturated, and `Cancelled` if `cancel` fires while queued.
    pub async fn acquire(&self, cancel: &CancellationToken) -> GatewayResult<Acquisition> {
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        // Only bypass the queue when nobody is already waiting in it.
        if self.waiters.available_permits() == self.queue_limit && self.bucket.check().is_ok() {
            return Ok(Acquisition::Granted);
        }

        // A denied caller must not take a token the queue is waiting for.
        let _slot = match self.waiters.try_acquire() {
            Ok(slot) => slot,
            Err(_) => {
                return Ok(Acquisition::Denied {
                    retry_after: Some(self.per_token),
                })
            }
        };

        let _turn = tokio::select! {
            guard = self.turnstile.lock() => guard,
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        while let Some(wait) = self.time_until_next_token() {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            }
        }
        Ok(Acquisition::Granted)
    }
}

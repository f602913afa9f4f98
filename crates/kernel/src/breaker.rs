//! Circuit breaker & rate limiter (C2).
//!
//! No teacher file keeps persistent per-provider breaker state —
//! `sa_providers::router::LlmRouter` retries/falls back per-request only.
//! This generalizes that file's `is_retriable` classification into the
//! classic closed/open/half_open breaker, and adds a token-bucket rate
//! limiter per SPEC_FULL.md §4.2.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{BreakerConfig, RateLimitConfig};
use crate::error::{KernelError, Result};

/// `BreakerRegistry` lives in `router.rs` (it's keyed by the router's own
/// provider ids and only the router constructs routing decisions from
/// it), but every other module reaches it through this crate's breaker
/// vocabulary rather than reaching across into the router.
pub use crate::router::BreakerRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Circuit breaker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    half_open_inflight: u32,
}

/// Per-provider circuit breaker. Guarded by a single-writer discipline
/// (a `parking_lot::Mutex`, matching `DecisionLog`'s low-overhead style in
/// `crates/providers/src/decisions.rs`); readers may observe stale state
/// briefly under contention, which is acceptable per §5's shared-resource
/// policy.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                half_open_inflight: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.maybe_recover();
        self.inner.lock().state
    }

    /// Promote `open` to `half_open` once the recovery timeout has
    /// elapsed. Called lazily on every state read/acquisition.
    fn maybe_recover(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed()
                    >= Duration::from_secs(self.config.recovery_timeout_secs)
                {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_inflight = 0;
                }
            }
        }
    }

    /// Attempt to acquire permission to call the provider. Returns
    /// `Err(KernelError::PolicyBlocked)`-free; callers should treat a
    /// refused acquisition as `Transient` so the router fails over.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        self.maybe_recover();
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Open => Err(KernelError::Transient(
                "circuit breaker open; refusing call without contacting provider".into(),
            )),
            BreakerState::HalfOpen => {
                if inner.half_open_inflight >= self.config.half_open_max_inflight {
                    Err(KernelError::Transient(
                        "circuit breaker half_open; probe concurrency exhausted".into(),
                    ))
                } else {
                    inner.half_open_inflight += 1;
                    Ok(BreakerPermit { breaker: self, is_probe: true })
                }
            }
            BreakerState::Closed => Ok(BreakerPermit { breaker: self, is_probe: false }),
        }
    }

    fn on_success(&self, was_probe: bool) {
        let mut inner = self.inner.lock();
        if was_probe {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
    }

    /// Record a failure. `BadRequest`-kind errors must never reach this —
    /// callers filter those out before calling `on_failure` (§4.2: "Any
    /// BadRequest is NOT counted as a breaker failure").
    fn on_failure(&self, was_probe: bool) {
        let mut inner = self.inner.lock();
        if was_probe {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            return;
        }
        inner.failure_count += 1;
        if inner.failure_count >= self.config.failure_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Force a state transition without waiting out `recovery_timeout_secs`
    /// or exhausting `failure_threshold`. Test-only; other modules' tests
    /// (e.g. `router.rs`'s closed-vs-half-open tie-break) need to drive a
    /// breaker into `HalfOpen` the same way this module's own tests do,
    /// but can't reach `inner` directly since it's private to this module.
    #[cfg(test)]
    pub(crate) fn force_state_for_test(&self, state: BreakerState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        if state == BreakerState::HalfOpen {
            inner.half_open_inflight = 0;
        }
    }
}

/// RAII permit returned by [`CircuitBreaker::try_acquire`]. The caller
/// must report the outcome via `record` (or drop it, which counts as a
/// failure — a call that neither succeeds nor explicitly fails is treated
/// conservatively).
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    is_probe: bool,
}

impl<'a> BreakerPermit<'a> {
    pub fn record(self, outcome: &Result<()>) {
        match outcome {
            Ok(()) => self.breaker.on_success(self.is_probe),
            Err(e) if matches!(e, KernelError::BadRequest(_)) => {
                // Caller error, not counted against the breaker.
                if self.is_probe {
                    let mut inner = self.breaker.inner.lock();
                    inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                }
            }
            Err(_) => self.breaker.on_failure(self.is_probe),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct BucketInner {
    request_tokens: f64,
    budget_tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter, one bucket per provider. Reserves estimated
/// tokens before a stream starts; the reservation is reconciled on
/// `UsageUpdate` via [`TokenReservation::reconcile`].
pub struct RateLimiter {
    config: RateLimitConfig,
    inner: Mutex<BucketInner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let request_tokens = config.requests_per_minute as f64;
        let budget_tokens = config.tokens_per_minute as f64;
        Self {
            config,
            inner: Mutex::new(BucketInner {
                request_tokens,
                budget_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, inner: &mut BucketInner) {
        let elapsed = inner.last_refill.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let minutes = elapsed / 60.0;
        inner.request_tokens = (inner.request_tokens
            + minutes * self.config.requests_per_minute as f64)
            .min(self.config.requests_per_minute as f64);
        inner.budget_tokens = (inner.budget_tokens
            + minutes * self.config.tokens_per_minute as f64)
            .min(self.config.tokens_per_minute as f64);
        inner.last_refill = Instant::now();
    }

    /// Reserve one request slot and `estimated_tokens` from the budget.
    /// Returns `RateLimited` immediately if neither bucket has capacity
    /// (the bounded wait described in §4.2 is the caller's responsibility
    /// via retry-after backoff, not a blocking sleep here).
    pub fn reserve(&self, estimated_tokens: u32) -> Result<TokenReservation<'_>> {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);

        if inner.request_tokens < 1.0 {
            return Err(KernelError::RateLimited { retry_after_ms: 1000 });
        }
        if inner.budget_tokens < estimated_tokens as f64 {
            return Err(KernelError::RateLimited { retry_after_ms: 1000 });
        }

        inner.request_tokens -= 1.0;
        inner.budget_tokens -= estimated_tokens as f64;

        Ok(TokenReservation {
            limiter: self,
            reserved: estimated_tokens,
        })
    }
}

pub struct TokenReservation<'a> {
    limiter: &'a RateLimiter,
    reserved: u32,
}

impl<'a> TokenReservation<'a> {
    /// Reconcile the reservation against the actual token usage reported
    /// by the provider: refund the difference if fewer tokens were used,
    /// or charge the difference if more were used.
    pub fn reconcile(self, actual_tokens: u32) {
        let mut inner = self.limiter.inner.lock();
        if actual_tokens < self.reserved {
            inner.budget_tokens += (self.reserved - actual_tokens) as f64;
        } else if actual_tokens > self.reserved {
            inner.budget_tokens -= (actual_tokens - self.reserved) as f64;
        }
    }

    /// Refund the full reservation (e.g. on cancellation).
    pub fn refund(self) {
        let mut inner = self.limiter.inner.lock();
        inner.budget_tokens += self.reserved as f64;
    }
}

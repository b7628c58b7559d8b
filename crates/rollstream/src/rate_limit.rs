//! Per-origin request throttling.
//!
//! A fixed-window counter in the store, keyed by origin and window index.
//! Every request increments its window's counter and refreshes the
//! counter's expiry in one atomic step; a request whose pre-increment
//! count already reached the ceiling is turned away.
//!
//! # Failure handling
//!
//! If the counter cannot be read the request is treated as limited. After
//! [`RateLimitConfig::max_consecutive_failures`] failures in a row a
//! breaker opens and requests pass uncounted for
//! [`RateLimitConfig::breaker_cooldown`]. The first request after the
//! cooldown is counted again: success closes the breaker, failure reopens
//! it straight away.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rollstream_store::{Backend, Clock, keys};
use tokio::time::Instant;

use crate::server::ServerState;
use crate::{RateLimitConfig, RollstreamError};

/// What the limiter decided for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited,
    /// The breaker is open; the request was not counted.
    Bypassed,
}

#[derive(Debug, Default)]
struct Breaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

pub struct RateLimiter<B: Backend> {
    backend: B,
    clock: Clock,
    config: RateLimitConfig,
    breaker: Mutex<Breaker>,
}

impl<B: Backend> RateLimiter<B> {
    pub fn new(backend: B, clock: Clock, config: RateLimitConfig) -> Self {
        Self {
            backend,
            clock,
            config,
            breaker: Mutex::new(Breaker::default()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counts one request from `origin` and decides whether it may proceed.
    pub async fn check(&self, origin: &str) -> RateDecision {
        if self.breaker_open() {
            tracing::trace!(origin, "rate limit breaker open, not counting");
            return RateDecision::Bypassed;
        }

        let window_secs = self.config.window.as_secs().max(1);
        let window = self.clock.now_secs() / window_secs as i64;
        let key = keys::rate_limit(origin, window);

        match self.backend.counter_incr_expiring(&key, self.config.window).await {
            Ok(count) => {
                self.record_success();
                if count - 1 >= self.config.max_requests {
                    tracing::info!(origin, count, "rate limit hit");
                    RateDecision::Limited
                } else {
                    RateDecision::Allowed
                }
            }
            Err(e) => {
                self.record_failure(&e.to_string());
                RateDecision::Limited
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Breaker> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn breaker_open(&self) -> bool {
        self.lock()
            .open_until
            .is_some_and(|until| Instant::now() < until)
    }

    fn record_success(&self) {
        let mut breaker = self.lock();
        if breaker.open_until.take().is_some() {
            tracing::info!("rate limit counter recovered, breaker closed");
        }
        breaker.consecutive_failures = 0;
    }

    fn record_failure(&self, error: &str) {
        let mut breaker = self.lock();
        breaker.consecutive_failures += 1;
        if breaker.consecutive_failures >= self.config.max_consecutive_failures {
            breaker.open_until = Some(Instant::now() + self.config.breaker_cooldown);
            tracing::warn!(
                error,
                failures = breaker.consecutive_failures,
                cooldown = ?self.config.breaker_cooldown,
                "rate limit counter failing, breaker opened"
            );
        } else {
            tracing::warn!(error, failures = breaker.consecutive_failures, "rate limit counter failed");
        }
    }
}

/// Middleware applying the limiter to every route.
///
/// The origin is the peer IP when the server was started with connect
/// info, otherwise a shared `unknown` bucket.
pub(crate) async fn limit_requests<B: Backend>(
    State(state): State<Arc<ServerState<B>>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    match state.limiter.check(&origin).await {
        RateDecision::Limited => RollstreamError::RateLimited.into_response(),
        RateDecision::Allowed | RateDecision::Bypassed => next.run(request).await,
    }
}

//! Retrying fetch layer.
//!
//! [`FetchClient`] takes a token from the shared [`RateLimiter`] before every
//! attempt, bounds each attempt with its own timeout and retries transient
//! failures with exponential backoff plus jitter. A server-supplied
//! retry-after hint replaces the computed delay for the next attempt; a
//! hint longer than [`RetryPolicy::max_retry_after`] ends the fetch.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use rebound_core::config::FetchConfig;
use rebound_core::RawPayload;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::rate_limiter::RateLimiter;

// ── Transport seam ────────────────────────────────────────────

/// A single logical GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self { url: url.into(), headers: Vec::new() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// What a transport hands back for one attempt, whatever the status.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    /// Parsed `Retry-After` hint, if the server sent one.
    pub retry_after: Option<Duration>,
    pub body: Bytes,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// Pluggable network backend.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &FetchRequest) -> Result<RawResponse, TransportError>;
}

// ── Classification ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// `None` for success (2xx); otherwise 429 and 5xx are transient and any
/// other status is permanent.
pub fn classify_status(status: u16) -> Option<FailureClass> {
    match status {
        200..=299 => None,
        429 | 500..=599 => Some(FailureClass::Transient),
        _ => Some(FailureClass::Permanent),
    }
}

pub fn classify_transport_error(err: &TransportError) -> FailureClass {
    match err {
        TransportError::InvalidRequest(_) => FailureClass::Permanent,
        TransportError::Timeout | TransportError::Connect(_) | TransportError::Other(_) => {
            FailureClass::Transient
        }
    }
}

// ── Retry policy ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    /// Ceiling for the computed backoff.
    pub max_backoff: Duration,
    /// Longest retry-after hint worth waiting for.
    pub max_retry_after: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_retry_after: Duration::from_secs(300),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
            max_retry_after: config.max_retry_after(),
            attempt_timeout: config.attempt_timeout(),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based). The exponential
    /// step `base * 2^(attempt-1)` is capped at `max_backoff`; `jitter` in
    /// `[0, 1]` scales the upper half of it.
    pub fn backoff(&self, attempt: u32, jitter: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let step = self
            .base_backoff
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);
        let half = step / 2;
        half + half.mul_f64(jitter.clamp(0.0, 1.0))
    }
}

// ── Client ────────────────────────────────────────────────────

/// Successful fetch plus how much it cost.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub payload: RawPayload,
    pub attempts: u32,
    /// Wall time across all attempts, including waits.
    pub latency: Duration,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("permanent failure fetching {url}: {reason}")]
    Permanent {
        url: String,
        status: Option<u16>,
        reason: String,
        attempts: u32,
    },

    #[error("gave up on {url} after {attempts} attempts: {reason}")]
    Exhausted {
        url: String,
        status: Option<u16>,
        reason: String,
        attempts: u32,
    },
}

impl FetchError {
    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::Permanent { attempts, .. } | FetchError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Permanent { status, .. } | FetchError::Exhausted { status, .. } => *status,
        }
    }
}

pub struct FetchClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn Transport>, limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        Self { transport, limiter, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn fetch(&self, request: &FetchRequest) -> Result<Fetched, FetchError> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.limiter.acquire(1).await;

            let attempt_start = Instant::now();
            let outcome =
                tokio::time::timeout(self.policy.attempt_timeout, self.transport.send(request))
                    .await;
            let attempt_latency = attempt_start.elapsed();

            let (reason, status, hint) = match outcome {
                Err(_) => (
                    format!("attempt timed out after {:?}", self.policy.attempt_timeout),
                    None,
                    None,
                ),
                Ok(Err(err)) => match classify_transport_error(&err) {
                    FailureClass::Permanent => {
                        return Err(FetchError::Permanent {
                            url: request.url.clone(),
                            status: None,
                            reason: err.to_string(),
                            attempts: attempt,
                        });
                    }
                    FailureClass::Transient => (err.to_string(), None, None),
                },
                Ok(Ok(response)) => match classify_status(response.status) {
                    None => {
                        debug!(
                            url = %request.url,
                            attempt,
                            latency_ms = attempt_latency.as_millis() as u64,
                            "Fetch succeeded"
                        );
                        return Ok(Fetched {
                            payload: RawPayload {
                                url: request.url.clone(),
                                status: response.status,
                                body: response.body,
                            },
                            attempts: attempt,
                            latency: started.elapsed(),
                        });
                    }
                    Some(FailureClass::Permanent) => {
                        return Err(FetchError::Permanent {
                            url: request.url.clone(),
                            status: Some(response.status),
                            reason: format!("HTTP {}", response.status),
                            attempts: attempt,
                        });
                    }
                    Some(FailureClass::Transient) => (
                        format!("HTTP {}", response.status),
                        Some(response.status),
                        response.retry_after,
                    ),
                },
            };

            if attempt >= self.policy.max_attempts {
                warn!(url = %request.url, attempts = attempt, reason = %reason, "Fetch retries exhausted");
                return Err(FetchError::Exhausted {
                    url: request.url.clone(),
                    status,
                    reason,
                    attempts: attempt,
                });
            }

            if let Some(retry_after) = hint.filter(|d| *d > self.policy.max_retry_after) {
                warn!(
                    url = %request.url,
                    attempts = attempt,
                    retry_after_secs = retry_after.as_secs(),
                    "Retry-after beyond limit, giving up"
                );
                return Err(FetchError::Exhausted {
                    url: request.url.clone(),
                    status,
                    reason: format!("{reason}, retry-after {}s exceeds limit", retry_after.as_secs()),
                    attempts: attempt,
                });
            }

            let delay = match hint {
                Some(retry_after) => retry_after,
                None => self.policy.backoff(attempt, rand::thread_rng().gen::<f64>()),
            };
            warn!(
                url = %request.url,
                attempt,
                latency_ms = attempt_latency.as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
                retry_after = hint.is_some(),
                reason = %reason,
                "Transient fetch failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

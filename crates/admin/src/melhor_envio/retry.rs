//! Failure classification and backoff for carrier calls.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;

use super::ShippingError;
use super::transport::{RawResponse, TransportError};

/// How many times and how patiently to retry a carrier call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each later one.
    pub base_delay: Duration,
    /// Upper bound on the computed backoff.
    pub max_delay: Duration,
    /// Upper bound on a server-provided `Retry-After`.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_retry_after: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt budget and default delays.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Un-jittered backoff after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }

    /// Backoff with jitter drawn from `[delay / 2, delay]`.
    #[must_use]
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let floor = delay / 2;
        if delay <= floor {
            return delay;
        }
        rand::rng().random_range(floor..=delay)
    }

    /// Delay before the next attempt, or `None` when the budget is spent.
    #[must_use]
    pub(crate) fn next_delay(&self, attempt: u32, failure: &Failure) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        match failure {
            Failure::RateLimited {
                retry_after: Some(wait),
                ..
            } => Some((*wait).min(self.max_retry_after)),
            _ => Some(self.jittered_backoff(attempt)),
        }
    }
}

/// Why a single attempt did not produce a usable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    /// Connection error, reset or timeout.
    TransientNetwork(String),
    /// 401 from the carrier.
    AuthRejected { payload: String },
    /// 429 from the carrier.
    RateLimited {
        retry_after: Option<Duration>,
        payload: String,
    },
    /// Any other 4xx.
    ClientError { status: u16, payload: String },
    /// 5xx.
    ServerError { status: u16, payload: String },
    /// Transport refused to send the request at all.
    Unsendable(String),
}

impl Failure {
    /// Classify a response. `None` means the status is a success.
    pub(crate) fn from_response(response: &RawResponse) -> Option<Self> {
        let status = response.status;
        if status.is_success() {
            return None;
        }

        let payload = truncate(&response.body);
        Some(match status {
            StatusCode::UNAUTHORIZED => Self::AuthRejected { payload },
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited {
                retry_after: response.retry_after,
                payload,
            },
            s if s.is_server_error() => Self::ServerError {
                status: s.as_u16(),
                payload,
            },
            s => Self::ClientError {
                status: s.as_u16(),
                payload,
            },
        })
    }

    pub(crate) const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::RateLimited { .. } | Self::ServerError { .. }
        )
    }

    /// Short description used in logs and `CarrierUnavailable`.
    pub(crate) fn reason(&self) -> String {
        match self {
            Self::TransientNetwork(msg) | Self::Unsendable(msg) => msg.clone(),
            Self::AuthRejected { .. } => "HTTP 401".to_owned(),
            Self::RateLimited { .. } => "HTTP 429".to_owned(),
            Self::ClientError { status, .. } | Self::ServerError { status, .. } => {
                format!("HTTP {status}")
            }
        }
    }

    /// Terminal error for a failure that will not be retried (again).
    pub(crate) fn into_error(self, attempts: u32) -> ShippingError {
        match self {
            Self::AuthRejected { payload } => {
                ShippingError::Auth(format!("carrier rejected access token: {payload}"))
            }
            Self::ClientError { status, payload } => {
                ShippingError::CarrierRequest { status, payload }
            }
            Self::Unsendable(reason) => ShippingError::CarrierUnavailable { attempts, reason },
            retryable => ShippingError::CarrierUnavailable {
                attempts,
                reason: retryable.reason(),
            },
        }
    }
}

impl From<TransportError> for Failure {
    fn from(err: TransportError) -> Self {
        if err.is_transient() {
            Self::TransientNetwork(err.to_string())
        } else {
            Self::Unsendable(err.to_string())
        }
    }
}

const MAX_PAYLOAD_CHARS: usize = 512;

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_PAYLOAD_CHARS {
        body.to_owned()
    } else {
        let mut cut: String = body.chars().take(MAX_PAYLOAD_CHARS).collect();
        cut.push('…');
        cut
    }
}

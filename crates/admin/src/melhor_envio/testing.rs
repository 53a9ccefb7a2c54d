//! Test doubles for the carrier boundary.
//!
//! Compiled for unit tests and, behind the `test-support` feature, for other
//! crates' tests.

#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;

use super::clock::Clock;
use super::retry::RetryPolicy;
use super::transport::{CarrierTransport, OutboundRequest, RawResponse, TransportError};

/// Retry policy with millisecond delays.
#[must_use]
pub const fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        max_retry_after: Duration::from_millis(20),
    }
}

// =============================================================================
// Clock
// =============================================================================

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub const fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// =============================================================================
// Transport
// =============================================================================

/// One scripted outcome.
#[derive(Debug, Clone)]
pub struct Reply {
    outcome: Result<RawResponse, TransportError>,
}

impl Reply {
    /// JSON body with the given status.
    #[must_use]
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            outcome: Ok(RawResponse::new(status_code(status), body.to_string())),
        }
    }

    /// Status with an empty JSON object body.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self {
            outcome: Ok(RawResponse::new(status_code(status), "{}")),
        }
    }

    /// Raw body, for malformed responses.
    #[must_use]
    pub fn raw(status: u16, body: &str) -> Self {
        Self {
            outcome: Ok(RawResponse::new(status_code(status), body)),
        }
    }

    #[must_use]
    pub fn timeout() -> Self {
        Self {
            outcome: Err(TransportError::Timeout("scripted timeout".into())),
        }
    }

    #[must_use]
    pub fn connection_reset() -> Self {
        Self {
            outcome: Err(TransportError::Connection("connection reset by peer".into())),
        }
    }

    /// Attach a `Retry-After` (seconds) to a response reply.
    #[must_use]
    pub fn retry_after(mut self, after: Duration) -> Self {
        if let Ok(response) = &mut self.outcome {
            response.retry_after = Some(after);
        }
        self
    }
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap()
}

/// A request as the transport saw it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<serde_json::Value>,
}

type RouteKey = (Method, String);

/// Transport that answers from per-route scripts and records every call.
///
/// Queued replies are consumed in order; once a route's queue is empty its
/// `always` reply (if any) is used, otherwise a 404 is returned.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    queued: Mutex<HashMap<RouteKey, VecDeque<Reply>>>,
    always: Mutex<HashMap<RouteKey, Reply>>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Option<Duration>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply, to make concurrent callers overlap.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn enqueue(&self, method: Method, path: &str, reply: Reply) {
        self.queued
            .lock()
            .unwrap()
            .entry((method, path.to_owned()))
            .or_default()
            .push_back(reply);
    }

    pub fn always(&self, method: Method, path: &str, reply: Reply) {
        self.always
            .lock()
            .unwrap()
            .insert((method, path.to_owned()), reply);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls made to one route.
    #[must_use]
    pub fn calls_to(&self, method: &Method, path: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| &c.method == method && c.path == path)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn count(&self, method: &Method, path: &str) -> usize {
        self.calls_to(method, path).len()
    }

    fn next_reply(&self, key: &RouteKey) -> Option<Reply> {
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        queued.or_else(|| self.always.lock().unwrap().get(key).cloned())
    }
}

#[async_trait]
impl CarrierTransport for ScriptedTransport {
    async fn execute(&self, request: OutboundRequest) -> Result<RawResponse, TransportError> {
        let key = (request.method.clone(), request.path.clone());
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method,
            path: request.path,
            bearer: request.bearer.map(|t| t.expose_secret().to_owned()),
            body: request.body,
        });

        let reply = self.next_reply(&key);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match reply {
            Some(reply) => reply.outcome,
            None => Ok(RawResponse::new(
                StatusCode::NOT_FOUND,
                serde_json::json!({
                    "message": format!("no scripted reply for {} {}", key.0, key.1)
                })
                .to_string(),
            )),
        }
    }
}

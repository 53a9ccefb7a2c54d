//! Carrier access-token lifecycle.
//!
//! The carrier issues short-lived access tokens in exchange for a refresh
//! token, rotating the refresh token on every exchange. [`TokenManager`] keeps
//! the current pair in memory, persists it through a [`CredentialStore`], and
//! guarantees at most one exchange in flight at a time. Callers queued behind
//! a failed exchange receive its error instead of starting their own.
//!
//! # Revocation
//!
//! A 400/401/403 from the token endpoint means the refresh credentials are no
//! longer accepted. The manager then fails every call with
//! [`ShippingError::Auth`] without touching the network until
//! [`TokenManager::reconfigure`] installs new credentials.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::ShippingError;
use super::clock::Clock;
use super::retry::{Failure, RetryPolicy};
use super::transport::{CarrierTransport, OutboundRequest};
use crate::db::RepositoryError;

/// Token endpoint, relative to the carrier base URL.
pub const TOKEN_PATH: &str = "/oauth/token";

/// Tokens expiring within this many seconds are treated as expired.
pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 60;

/// Background loop refreshes this many safety margins ahead of expiry.
const REFRESH_LEAD_FACTOR: i32 = 5;
const LOOP_RETRY_INTERVAL: StdDuration = StdDuration::from_secs(30);
const LOOP_MIN_SLEEP: StdDuration = StdDuration::from_secs(5);
const LOOP_MAX_SLEEP: StdDuration = StdDuration::from_secs(3600);

// =============================================================================
// Types
// =============================================================================

/// Long-lived application credentials.
///
/// Implements `Debug` manually to redact secrets.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: SecretString,
    /// Refresh token to start from when nothing has been persisted yet.
    pub refresh_token: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

/// A bearer token and its expiry.
#[derive(Clone)]
pub struct AccessToken {
    value: SecretString,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    #[must_use]
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: SecretString::from(value.into()),
            expires_at,
        }
    }

    #[must_use]
    pub const fn secret(&self) -> &SecretString {
        &self.value
    }

    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the token is still valid `margin` from `now`.
    #[must_use]
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at > now + margin
    }

    fn same_as(&self, other: &Self) -> bool {
        self.value.expose_secret() == other.value.expose_secret()
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What survives a restart: the latest token pair.
#[derive(Clone)]
pub struct TokenState {
    pub access_token: AccessToken,
    pub refresh_token: SecretString,
    pub refreshed_at: DateTime<Utc>,
}

impl std::fmt::Debug for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenState")
            .field("access_token", &self.access_token)
            .field("refresh_token", &"[REDACTED]")
            .field("refreshed_at", &self.refreshed_at)
            .finish()
    }
}

/// Persistence for the rotating token pair.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<TokenState>, RepositoryError>;
    async fn save(&self, state: &TokenState) -> Result<(), RepositoryError>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Lifetime in seconds.
    expires_in: i64,
}

struct Cache {
    credentials: Credentials,
    token: Option<AccessToken>,
    /// Lifetime of `token` as issued.
    lifetime: Option<Duration>,
    /// Whether the credential store has been consulted.
    hydrated: bool,
    /// Set once the token endpoint rejected our credentials.
    revoked: Option<String>,
    /// Bumped whenever an exchange finishes, successfully or not.
    generation: u64,
    /// Error of the last exchange, if it failed.
    last_failure: Option<RefreshFailure>,
}

impl Cache {
    fn usable(&self, now: DateTime<Utc>, lead: Duration) -> Result<Option<AccessToken>, ShippingError> {
        if let Some(reason) = &self.revoked {
            return Err(ShippingError::Auth(reason.clone()));
        }
        Ok(self
            .token
            .as_ref()
            .filter(|token| token.is_usable_at(now, lead))
            .cloned())
    }

    /// The error of an exchange that finished after generation `seen`.
    fn failure_since(&self, seen: u64) -> Option<ShippingError> {
        if self.generation == seen {
            return None;
        }
        self.last_failure.as_ref().map(RefreshFailure::to_error)
    }
}

/// A failed exchange, kept so waiting callers can be given the same error.
#[derive(Debug, Clone)]
enum RefreshFailure {
    Auth(String),
    Unavailable { attempts: u32, reason: String },
    Rejected { status: u16, payload: String },
    Decode(String),
}

impl RefreshFailure {
    fn from_error(err: &ShippingError) -> Self {
        match err {
            ShippingError::Auth(reason) => Self::Auth(reason.clone()),
            ShippingError::CarrierUnavailable { attempts, reason } => Self::Unavailable {
                attempts: *attempts,
                reason: reason.clone(),
            },
            ShippingError::CarrierRequest { status, payload } => Self::Rejected {
                status: *status,
                payload: payload.clone(),
            },
            ShippingError::Decode(message) => Self::Decode(message.clone()),
            other => Self::Decode(other.to_string()),
        }
    }

    fn to_error(&self) -> ShippingError {
        match self {
            Self::Auth(reason) => ShippingError::Auth(reason.clone()),
            Self::Unavailable { attempts, reason } => ShippingError::CarrierUnavailable {
                attempts: *attempts,
                reason: reason.clone(),
            },
            Self::Rejected { status, payload } => ShippingError::CarrierRequest {
                status: *status,
                payload: payload.clone(),
            },
            Self::Decode(message) => ShippingError::Decode(message.clone()),
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Hands out valid access tokens, refreshing them single-flight.
pub struct TokenManager {
    transport: Arc<dyn CarrierTransport>,
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    safety_margin: Duration,
    cache: RwLock<Cache>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    #[must_use]
    pub fn new(
        credentials: Credentials,
        transport: Arc<dyn CarrierTransport>,
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            store,
            clock,
            policy,
            safety_margin: Duration::seconds(DEFAULT_SAFETY_MARGIN_SECS),
            cache: RwLock::new(Cache {
                credentials,
                token: None,
                lifetime: None,
                hydrated: false,
                revoked: None,
                generation: 0,
                last_failure: None,
            }),
            refresh_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    /// Return a token valid beyond the safety margin, refreshing if needed.
    ///
    /// Concurrent callers that find the cache stale wait for a single
    /// exchange and share its result.
    ///
    /// # Errors
    ///
    /// - [`ShippingError::Auth`] if the credentials are (or become) revoked
    /// - [`ShippingError::CarrierUnavailable`] if the token endpoint keeps failing
    /// - [`ShippingError::Decode`] if the token response is malformed
    #[instrument(skip(self), level = "debug")]
    pub async fn get_valid_token(&self) -> Result<AccessToken, ShippingError> {
        self.token_valid_for(self.safety_margin).await
    }

    /// Refresh after the carrier rejected `stale` with a 401.
    ///
    /// If another caller already replaced `stale`, the replacement is returned
    /// without a new exchange.
    ///
    /// # Errors
    ///
    /// Same as [`Self::get_valid_token`].
    #[instrument(skip_all)]
    pub async fn force_refresh(&self, stale: &AccessToken) -> Result<AccessToken, ShippingError> {
        let seen = self.cache.read().await.generation;
        let _guard = self.refresh_lock.lock().await;

        {
            let cache = self.cache.read().await;
            if let Some(reason) = &cache.revoked {
                return Err(ShippingError::Auth(reason.clone()));
            }
            let now = self.clock.now();
            if let Some(current) = &cache.token
                && !current.same_as(stale)
                && current.is_usable_at(now, self.safety_margin)
            {
                debug!("token already replaced by a concurrent refresh");
                return Ok(current.clone());
            }
            if let Some(err) = cache.failure_since(seen) {
                debug!(error = %err, "concurrent refresh failed, sharing its error");
                return Err(err);
            }
        }

        self.refresh_locked().await
    }

    /// Install new credentials and clear the revoked state.
    ///
    /// The cached token is dropped and the persisted pair is not reloaded.
    #[instrument(skip_all, fields(client_id = %credentials.client_id))]
    pub async fn reconfigure(&self, credentials: Credentials) {
        let _guard = self.refresh_lock.lock().await;
        let mut cache = self.cache.write().await;
        cache.credentials = credentials;
        cache.token = None;
        cache.lifetime = None;
        cache.revoked = None;
        cache.last_failure = None;
        cache.hydrated = true;
        info!("carrier credentials reconfigured");
    }

    /// Whether the carrier has rejected the current credentials.
    pub async fn is_revoked(&self) -> bool {
        self.cache.read().await.revoked.is_some()
    }

    /// Start refreshing ahead of expiry until `shutdown` resolves.
    ///
    /// The refresh happens five safety margins ahead of expiry, or halfway
    /// through the token's lifetime if that comes later. The loop also stops
    /// once credentials are revoked. Dropping the returned handle aborts it.
    pub fn spawn_refresh_loop<F>(self: &Arc<Self>, shutdown: F) -> RefreshLoop
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::pin!(shutdown);
            let max_lead = manager.safety_margin * REFRESH_LEAD_FACTOR;
            let mut retry_in: Option<StdDuration> = None;

            loop {
                let wait = match retry_in.take() {
                    Some(wait) => wait,
                    None => manager.time_until_refresh(max_lead).await,
                };

                tokio::select! {
                    () = &mut shutdown => {
                        info!("token refresh loop stopping");
                        break;
                    }
                    () = tokio::time::sleep(wait) => {}
                }

                let lead = manager.refresh_lead(max_lead).await;
                match manager.token_valid_for(lead).await {
                    Ok(token) => debug!(expires_at = %token.expires_at(), "background token check"),
                    Err(ShippingError::Auth(reason)) => {
                        error!(%reason, "carrier credentials revoked, token refresh loop stopping");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "background token refresh failed");
                        retry_in = Some(LOOP_RETRY_INTERVAL);
                    }
                }
            }
        });

        RefreshLoop { handle }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn token_valid_for(&self, lead: Duration) -> Result<AccessToken, ShippingError> {
        let seen = {
            let cache = self.cache.read().await;
            if let Some(token) = cache.usable(self.clock.now(), lead)? {
                return Ok(token);
            }
            cache.generation
        };

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed, or failed to, while we waited.
        {
            let cache = self.cache.read().await;
            if let Some(token) = cache.usable(self.clock.now(), lead)? {
                return Ok(token);
            }
            if let Some(err) = cache.failure_since(seen) {
                debug!(error = %err, "concurrent refresh failed, sharing its error");
                return Err(err);
            }
        }

        self.hydrate().await;
        if let Some(token) = self.cached(lead).await? {
            return Ok(token);
        }

        self.refresh_locked().await
    }

    async fn cached(&self, lead: Duration) -> Result<Option<AccessToken>, ShippingError> {
        self.cache.read().await.usable(self.clock.now(), lead)
    }

    /// `max_lead`, capped at half the current token's lifetime.
    async fn refresh_lead(&self, max_lead: Duration) -> Duration {
        let cache = self.cache.read().await;
        cache
            .lifetime
            .map_or(max_lead, |lifetime| max_lead.min(lifetime / 2))
    }

    async fn time_until_refresh(&self, max_lead: Duration) -> StdDuration {
        let lead = self.refresh_lead(max_lead).await;
        let cache = self.cache.read().await;
        let Some(token) = &cache.token else {
            return StdDuration::ZERO;
        };
        refresh_wait(token.expires_at(), self.clock.now(), lead)
    }

    /// Load the persisted pair once. Caller holds the refresh lock.
    async fn hydrate(&self) {
        if self.cache.read().await.hydrated {
            return;
        }

        match self.store.load().await {
            Ok(Some(state)) => {
                let mut cache = self.cache.write().await;
                debug!(
                    refreshed_at = %state.refreshed_at,
                    "loaded persisted carrier token"
                );
                cache.credentials.refresh_token = state.refresh_token;
                cache.lifetime = Some(state.access_token.expires_at() - state.refreshed_at)
                    .filter(|lifetime| *lifetime > Duration::zero());
                cache.token = Some(state.access_token);
                cache.hydrated = true;
            }
            Ok(None) => self.cache.write().await.hydrated = true,
            Err(e) => {
                warn!(error = %e, "could not load persisted carrier token, using configured refresh token");
            }
        }
    }

    /// Exchange the refresh token and record the outcome for waiting
    /// callers. Caller holds the refresh lock.
    async fn refresh_locked(&self) -> Result<AccessToken, ShippingError> {
        let outcome = self.exchange().await;

        {
            let mut cache = self.cache.write().await;
            cache.generation = cache.generation.wrapping_add(1);
            cache.last_failure = outcome.as_ref().err().map(RefreshFailure::from_error);
        }
        outcome
    }

    async fn exchange(&self) -> Result<AccessToken, ShippingError> {
        let credentials = self.cache.read().await.credentials.clone();
        let response = self.request_token(&credentials).await?;

        if response.expires_in <= 0 {
            return Err(ShippingError::Decode(format!(
                "token endpoint returned non-positive expires_in ({})",
                response.expires_in
            )));
        }

        let now = self.clock.now();
        let lifetime = Duration::try_seconds(response.expires_in);
        let expires_at = lifetime
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                ShippingError::Decode(format!(
                    "token endpoint returned out-of-range expires_in ({})",
                    response.expires_in
                ))
            })?;
        let access_token = AccessToken::new(response.access_token, expires_at);
        let refresh_token = response
            .refresh_token
            .map_or(credentials.refresh_token, SecretString::from);

        {
            let mut cache = self.cache.write().await;
            cache.token = Some(access_token.clone());
            cache.lifetime = lifetime;
            cache.credentials.refresh_token = refresh_token.clone();
            cache.hydrated = true;
        }

        let state = TokenState {
            access_token: access_token.clone(),
            refresh_token,
            refreshed_at: now,
        };
        if let Err(e) = self.store.save(&state).await {
            error!(error = %e, "failed to persist refreshed carrier token");
        }

        info!(expires_at = %access_token.expires_at(), "carrier access token refreshed");
        Ok(access_token)
    }

    #[instrument(skip_all, fields(client_id = %credentials.client_id))]
    async fn request_token(&self, credentials: &Credentials) -> Result<TokenResponse, ShippingError> {
        let body = serde_json::to_value(RefreshRequest {
            grant_type: "refresh_token",
            client_id: &credentials.client_id,
            client_secret: credentials.client_secret.expose_secret(),
            refresh_token: credentials.refresh_token.expose_secret(),
        })
        .map_err(|e| ShippingError::Decode(format!("token request: {e}")))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = OutboundRequest::new(Method::POST, TOKEN_PATH).with_body(body.clone());

            let failure = match self.transport.execute(request).await {
                Ok(response) => match Failure::from_response(&response) {
                    None => {
                        return serde_json::from_str(&response.body)
                            .map_err(|e| ShippingError::Decode(format!("token response: {e}")));
                    }
                    Some(failure) => failure,
                },
                Err(e) => Failure::from(e),
            };

            if let Some(reason) = revocation_reason(&failure) {
                error!(%reason, "carrier rejected refresh credentials");
                self.cache.write().await.revoked = Some(reason.clone());
                return Err(ShippingError::Auth(reason));
            }

            let delay = if failure.is_retryable() {
                self.policy.next_delay(attempt, &failure)
            } else {
                None
            };
            let Some(delay) = delay else {
                return Err(failure.into_error(attempt));
            };

            warn!(
                attempt,
                reason = %failure.reason(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "token request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// How long the refresh loop sleeps before refreshing `lead` ahead of expiry.
fn refresh_wait(expires_at: DateTime<Utc>, now: DateTime<Utc>, lead: Duration) -> StdDuration {
    (expires_at - lead - now)
        .to_std()
        .map_or(LOOP_MIN_SLEEP, |wait| wait.clamp(LOOP_MIN_SLEEP, LOOP_MAX_SLEEP))
}

fn revocation_reason(failure: &Failure) -> Option<String> {
    match failure {
        Failure::AuthRejected { payload } => Some(format!(
            "token endpoint rejected credentials (HTTP 401): {payload}"
        )),
        Failure::ClientError {
            status: status @ (400 | 403),
            payload,
        } => Some(format!(
            "token endpoint rejected credentials (HTTP {status}): {payload}"
        )),
        _ => None,
    }
}

/// Handle to the background refresh task. Aborts the task when dropped.
#[derive(Debug)]
pub struct RefreshLoop {
    handle: JoinHandle<()>,
}

impl RefreshLoop {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RefreshLoop {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

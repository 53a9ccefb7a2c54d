//! Authenticated, retrying carrier client.
//!
//! Every call goes through [`CarrierClient::send`], which:
//!
//! - attaches the current access token
//! - refreshes once and replays on a 401
//! - retries network errors, 429 and 5xx with backoff
//! - maps everything else to a single [`ShippingError`]
//!
//! [`CarrierClient::post_once`] skips the retries for calls that must not be
//! repeated once the carrier may have acted on them.

use std::sync::Arc;

use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::ShippingError;
use super::retry::{Failure, RetryPolicy};
use super::token::{AccessToken, TokenManager};
use super::transport::{CarrierTransport, OutboundRequest, RawResponse};

/// Carrier API client shared by the account, quote and label services.
#[derive(Clone)]
pub struct CarrierClient {
    transport: Arc<dyn CarrierTransport>,
    tokens: Arc<TokenManager>,
    policy: RetryPolicy,
}

impl CarrierClient {
    #[must_use]
    pub fn new(
        transport: Arc<dyn CarrierTransport>,
        tokens: Arc<TokenManager>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            tokens,
            policy,
        }
    }

    #[must_use]
    pub const fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// `GET` a JSON resource.
    ///
    /// # Errors
    ///
    /// See [`Self::send`].
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ShippingError> {
        self.send(Method::GET, path, None).await
    }

    /// `POST` a JSON body and decode the JSON answer.
    ///
    /// # Errors
    ///
    /// See [`Self::send`].
    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ShippingError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body)
            .map_err(|e| ShippingError::Decode(format!("could not encode request: {e}")))?;
        self.send(Method::POST, path, Some(body)).await
    }

    /// `POST` exactly once, apart from the replay after a 401.
    ///
    /// A timeout or 5xx may hide a request the carrier already processed, so
    /// it is reported as [`ShippingError::CarrierUnavailable`] instead of
    /// being sent again.
    ///
    /// # Errors
    ///
    /// See [`Self::send`].
    pub async fn post_once<B, T>(&self, path: &str, body: &B) -> Result<T, ShippingError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body)
            .map_err(|e| ShippingError::Decode(format!("could not encode request: {e}")))?;
        let policy = RetryPolicy {
            max_attempts: 1,
            ..self.policy
        };
        self.dispatch(Method::POST, path, Some(body), policy).await
    }

    /// Issue a request and decode a successful response.
    ///
    /// # Errors
    ///
    /// - [`ShippingError::Auth`] after a second 401 or when the token cannot be refreshed
    /// - [`ShippingError::CarrierRequest`] for 4xx other than 401/429
    /// - [`ShippingError::CarrierUnavailable`] once the retry budget is spent
    /// - [`ShippingError::Decode`] if a 2xx body does not match `T`
    pub async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ShippingError> {
        self.dispatch(method, path, body, self.policy).await
    }

    #[instrument(skip(self, body, policy), fields(method = %method, path = %path))]
    async fn dispatch<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        policy: RetryPolicy,
    ) -> Result<T, ShippingError> {
        let mut refreshed = false;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let failure = match self
                .attempt(&method, path, body.as_ref(), &mut refreshed)
                .await?
            {
                Ok(response) => {
                    debug!(attempt, status = response.status.as_u16(), "carrier call succeeded");
                    return decode(&response);
                }
                Err(failure) => failure,
            };

            let delay = if failure.is_retryable() {
                policy.next_delay(attempt, &failure)
            } else {
                None
            };
            let Some(delay) = delay else {
                let err = failure.into_error(attempt);
                warn!(attempt, error = %err, "carrier call failed");
                return Err(err);
            };

            warn!(
                attempt,
                reason = %failure.reason(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "carrier call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One attempt, including the single refresh-and-replay on 401.
    async fn attempt(
        &self,
        method: &Method,
        path: &str,
        body: Option<&serde_json::Value>,
        refreshed: &mut bool,
    ) -> Result<Result<RawResponse, Failure>, ShippingError> {
        let token = self.tokens.get_valid_token().await?;
        let outcome = self.execute(method, path, body, &token).await;

        if matches!(outcome, Err(Failure::AuthRejected { .. })) && !*refreshed {
            *refreshed = true;
            warn!("carrier rejected access token, refreshing once");
            let token = self.tokens.force_refresh(&token).await?;
            return Ok(self.execute(method, path, body, &token).await);
        }

        Ok(outcome)
    }

    async fn execute(
        &self,
        method: &Method,
        path: &str,
        body: Option<&serde_json::Value>,
        token: &AccessToken,
    ) -> Result<RawResponse, Failure> {
        let mut request =
            OutboundRequest::new(method.clone(), path).with_bearer(token.secret().clone());
        if let Some(body) = body {
            request = request.with_body(body.clone());
        }

        let response = self.transport.execute(request).await?;
        match Failure::from_response(&response) {
            None => Ok(response),
            Some(failure) => Err(failure),
        }
    }
}

fn decode<T: DeserializeOwned>(response: &RawResponse) -> Result<T, ShippingError> {
    serde_json::from_str(&response.body)
        .map_err(|e| ShippingError::Decode(format!("unexpected response body: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::melhor_envio::memory::InMemoryCredentialStore;
    use crate::melhor_envio::testing::{ManualClock, Reply, ScriptedTransport, fast_retry_policy};
    use crate::melhor_envio::token::{Credentials, TOKEN_PATH};
    use secrecy::SecretString;
    use serde::Deserialize;
    use serde_json::json;

    const PATH: &str = "/api/v2/me/balance";

    #[derive(Debug, Deserialize)]
    struct Balance {
        balance: String,
    }

    fn token_reply(access: &str) -> Reply {
        Reply::json(
            200,
            json!({"access_token": access, "refresh_token": "rt", "expires_in": 3600}),
        )
    }

    fn client(transport: &Arc<ScriptedTransport>) -> CarrierClient {
        let tokens = Arc::new(TokenManager::new(
            Credentials {
                client_id: "id".into(),
                client_secret: SecretString::from("secret"),
                refresh_token: SecretString::from("rt0"),
            },
            transport.clone(),
            Arc::new(InMemoryCredentialStore::new()),
            Arc::new(ManualClock::default()),
            fast_retry_policy(),
        ));
        CarrierClient::new(transport.clone(), tokens, fast_retry_policy())
    }

    #[tokio::test]
    async fn test_success_sends_bearer() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(Method::POST, TOKEN_PATH, token_reply("tok-1"));
        transport.enqueue(Method::GET, PATH, Reply::json(200, json!({"balance": "10.00"})));

        let balance: Balance = client(&transport).get(PATH).await.unwrap();

        assert_eq!(balance.balance, "10.00");
        let calls = transport.calls_to(&Method::GET, PATH);
        assert_eq!(calls[0].bearer.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn test_401_refreshes_once_and_replays() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(Method::POST, TOKEN_PATH, token_reply("tok-1"));
        transport.enqueue(Method::POST, TOKEN_PATH, token_reply("tok-2"));
        transport.enqueue(Method::GET, PATH, Reply::status(401));
        transport.enqueue(Method::GET, PATH, Reply::json(200, json!({"balance": "1"})));

        let balance: Balance = client(&transport).get(PATH).await.unwrap();

        assert_eq!(balance.balance, "1");
        let calls = transport.calls_to(&Method::GET, PATH);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].bearer.as_deref(), Some("tok-2"));
        assert_eq!(transport.count(&Method::POST, TOKEN_PATH), 2);
    }

    #[tokio::test]
    async fn test_second_401_is_auth_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.always(Method::POST, TOKEN_PATH, token_reply("tok"));
        transport.always(Method::GET, PATH, Reply::status(401));

        let result: Result<Balance, _> = client(&transport).get(PATH).await;

        assert!(matches!(result, Err(ShippingError::Auth(_))));
        assert_eq!(transport.count(&Method::GET, PATH), 2);
        // Initial fetch plus exactly one forced refresh.
        assert_eq!(transport.count(&Method::POST, TOKEN_PATH), 2);
    }

    #[tokio::test]
    async fn test_persistent_500_exhausts_attempts() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(Method::POST, TOKEN_PATH, token_reply("tok"));
        transport.always(Method::GET, PATH, Reply::status(500));

        let result: Result<Balance, _> = client(&transport).get(PATH).await;

        assert!(matches!(
            result,
            Err(ShippingError::CarrierUnavailable { attempts: 3, .. })
        ));
        assert_eq!(transport.count(&Method::GET, PATH), 3);
    }

    #[tokio::test]
    async fn test_network_errors_then_success() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(Method::POST, TOKEN_PATH, token_reply("tok"));
        transport.enqueue(Method::GET, PATH, Reply::connection_reset());
        transport.enqueue(Method::GET, PATH, Reply::timeout());
        transport.enqueue(Method::GET, PATH, Reply::json(200, json!({"balance": "2"})));

        let balance: Balance = client(&transport).get(PATH).await.unwrap();
        assert_eq!(balance.balance, "2");
        assert_eq!(transport.count(&Method::GET, PATH), 3);
    }

    #[tokio::test]
    async fn test_429_waits_for_retry_after() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(Method::POST, TOKEN_PATH, token_reply("tok"));
        transport.enqueue(
            Method::GET,
            PATH,
            Reply::status(429).retry_after(Duration::from_millis(15)),
        );
        transport.enqueue(Method::GET, PATH, Reply::json(200, json!({"balance": "3"})));

        let started = std::time::Instant::now();
        let balance: Balance = client(&transport).get(PATH).await.unwrap();

        assert_eq!(balance.balance, "3");
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(Method::POST, TOKEN_PATH, token_reply("tok"));
        transport.always(
            Method::GET,
            PATH,
            Reply::json(422, json!({"message": "The given data was invalid."})),
        );

        let result: Result<Balance, _> = client(&transport).get(PATH).await;

        assert!(matches!(
            result,
            Err(ShippingError::CarrierRequest { status: 422, .. })
        ));
        assert_eq!(transport.count(&Method::GET, PATH), 1);
    }

    #[tokio::test]
    async fn test_post_once_does_not_resend_after_timeout() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(Method::POST, TOKEN_PATH, token_reply("tok"));
        transport.enqueue(Method::POST, PATH, Reply::timeout());
        transport.enqueue(Method::POST, PATH, Reply::json(200, json!({"balance": "4"})));

        let result: Result<Balance, _> = client(&transport).post_once(PATH, &json!({})).await;

        assert!(matches!(
            result,
            Err(ShippingError::CarrierUnavailable { attempts: 1, .. })
        ));
        assert_eq!(transport.count(&Method::POST, PATH), 1);
    }

    #[tokio::test]
    async fn test_post_once_still_replays_after_401() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(Method::POST, TOKEN_PATH, token_reply("tok-1"));
        transport.enqueue(Method::POST, TOKEN_PATH, token_reply("tok-2"));
        transport.enqueue(Method::POST, PATH, Reply::status(401));
        transport.enqueue(Method::POST, PATH, Reply::json(200, json!({"balance": "5"})));

        let balance: Balance = client(&transport)
            .post_once(PATH, &json!({}))
            .await
            .unwrap();

        assert_eq!(balance.balance, "5");
        let calls = transport.calls_to(&Method::POST, PATH);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].bearer.as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn test_malformed_success_is_decode_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(Method::POST, TOKEN_PATH, token_reply("tok"));
        transport.enqueue(Method::GET, PATH, Reply::raw(200, "<html>maintenance</html>"));

        let result: Result<Balance, _> = client(&transport).get(PATH).await;
        assert!(matches!(result, Err(ShippingError::Decode(_))));
    }
}

//! Melhor Envio carrier integration.
//!
//! Quotes shipping rates, buys and cancels labels, and reads account state
//! from the Melhor Envio API.
//!
//! # Architecture
//!
//! - [`token::TokenManager`] exchanges the rotating refresh token for access
//!   tokens, single-flight, persisting the pair through a
//!   [`token::CredentialStore`]
//! - [`client::CarrierClient`] attaches tokens and owns retry/backoff
//! - [`account`], [`quotes`] and [`labels`] are thin services on top of it
//! - [`transport::CarrierTransport`] is the only seam that touches the network
//!
//! A single [`Shipping`] value holds all of it and lives in `AppState`.

pub mod account;
pub mod client;
pub mod clock;
pub mod labels;
pub mod memory;
pub mod quotes;
pub mod retry;
pub mod token;
pub mod transport;
pub mod wire;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use std::sync::Arc;

use secrecy::ExposeSecret;
use shipdesk_core::{LabelId, LabelStatus, OrderId, ShipmentError};
use sqlx::PgPool;
use thiserror::Error;

pub use account::{AccountService, Balance, CompanyInfo, Diagnostics};
pub use client::CarrierClient;
pub use clock::{Clock, SystemClock};
pub use labels::{Label, LabelRepository, LabelService};
pub use quotes::{Quote, QuoteService};
pub use retry::RetryPolicy;
pub use token::{AccessToken, CredentialStore, Credentials, TokenManager, TokenState};
pub use transport::{CarrierTransport, ReqwestTransport};

use crate::config::MelhorEnvioConfig;
use crate::db::{PgCredentialStore, PgLabelRepository, RepositoryError};
use memory::{InMemoryCredentialStore, InMemoryLabelRepository};

/// Errors surfaced by the carrier integration.
#[derive(Debug, Error)]
pub enum ShippingError {
    /// Credentials rejected, or the carrier kept refusing our token.
    #[error("carrier authentication failed: {0}")]
    Auth(String),

    /// The shipment cannot be quoted or labeled as described.
    #[error("invalid shipment: {0}")]
    Validation(#[from] ShipmentError),

    /// Network errors, 429 or 5xx outlasted the retry budget.
    #[error("carrier unavailable after {attempts} attempt(s): {reason}")]
    CarrierUnavailable { attempts: u32, reason: String },

    /// The carrier refused the request (4xx other than 401/429).
    #[error("carrier rejected request (HTTP {status}): {payload}")]
    CarrierRequest { status: u16, payload: String },

    /// The order already has an active label.
    #[error("order {order_id} already has an active label")]
    DuplicatePurchase { order_id: OrderId },

    /// The label state machine forbids the requested change.
    #[error("label cannot move from {from} to {to}")]
    InvalidStateTransition { from: LabelStatus, to: LabelStatus },

    #[error("label not found: {0}")]
    LabelNotFound(LabelId),

    /// A successful response did not have the expected shape.
    #[error("unexpected carrier response: {0}")]
    Decode(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// =============================================================================
// Facade
// =============================================================================

/// All carrier services, wired to one token manager.
pub struct Shipping {
    tokens: Arc<TokenManager>,
    account: AccountService,
    quotes: QuoteService,
    labels: LabelService,
}

impl Shipping {
    /// Start building with the given credentials and transport.
    #[must_use]
    pub fn builder(credentials: Credentials, transport: Arc<dyn CarrierTransport>) -> ShippingBuilder {
        ShippingBuilder {
            credentials,
            transport,
            credential_store: None,
            label_repository: None,
            clock: None,
            retry_policy: RetryPolicy::default(),
            safety_margin: None,
        }
    }

    /// Production wiring: `reqwest` transport and `PostgreSQL` persistence.
    ///
    /// # Errors
    ///
    /// Returns `reqwest::Error` if the HTTP client cannot be built.
    pub fn from_config(config: &MelhorEnvioConfig, pool: &PgPool) -> Result<Self, reqwest::Error> {
        let transport = ReqwestTransport::new(&config.base_url, config.timeout, config.user_agent())?;

        Ok(Self::builder(config.credentials(), Arc::new(transport))
            .credential_store(Arc::new(PgCredentialStore::new(pool.clone())))
            .label_repository(Arc::new(PgLabelRepository::new(pool.clone())))
            .retry_policy(RetryPolicy::with_max_attempts(config.max_attempts))
            .build())
    }

    #[must_use]
    pub const fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    #[must_use]
    pub const fn account(&self) -> &AccountService {
        &self.account
    }

    #[must_use]
    pub const fn quotes(&self) -> &QuoteService {
        &self.quotes
    }

    #[must_use]
    pub const fn labels(&self) -> &LabelService {
        &self.labels
    }
}

impl std::fmt::Debug for Shipping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shipping").finish_non_exhaustive()
    }
}

/// Builder for [`Shipping`]; unset stores default to in-memory ones.
pub struct ShippingBuilder {
    credentials: Credentials,
    transport: Arc<dyn CarrierTransport>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    label_repository: Option<Arc<dyn LabelRepository>>,
    clock: Option<Arc<dyn Clock>>,
    retry_policy: RetryPolicy,
    safety_margin: Option<chrono::Duration>,
}

impl ShippingBuilder {
    #[must_use]
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    #[must_use]
    pub fn label_repository(mut self, repository: Arc<dyn LabelRepository>) -> Self {
        self.label_repository = Some(repository);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    #[must_use]
    pub fn safety_margin(mut self, margin: chrono::Duration) -> Self {
        self.safety_margin = Some(margin);
        self
    }

    #[must_use]
    pub fn build(self) -> Shipping {
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let credential_store: Arc<dyn CredentialStore> = match self.credential_store {
            Some(store) => store,
            None => Arc::new(InMemoryCredentialStore::new()),
        };
        let label_repository: Arc<dyn LabelRepository> = match self.label_repository {
            Some(repository) => repository,
            None => Arc::new(InMemoryLabelRepository::new()),
        };

        tracing::debug!(
            client_id = %self.credentials.client_id,
            has_refresh_token = !self.credentials.refresh_token.expose_secret().is_empty(),
            "building carrier services"
        );

        let mut tokens = TokenManager::new(
            self.credentials,
            Arc::clone(&self.transport),
            credential_store,
            Arc::clone(&clock),
            self.retry_policy,
        );
        if let Some(margin) = self.safety_margin {
            tokens = tokens.with_safety_margin(margin);
        }
        let tokens = Arc::new(tokens);

        let client = CarrierClient::new(self.transport, Arc::clone(&tokens), self.retry_policy);

        Shipping {
            account: AccountService::new(client.clone()),
            quotes: QuoteService::new(client.clone()),
            labels: LabelService::new(client, label_repository, clock),
            tokens,
        }
    }
}

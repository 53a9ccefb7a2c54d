//! Integration tests for Shipdesk.
//!
//! The carrier is replaced by [`MockCarrier`], a scripted stand-in for the
//! Melhor Envio API. Everything above the transport (token manager, retry
//! loop, services, routes) is the production code.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p shipdesk-integration-tests
//! ```

#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use reqwest::Method;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde_json::{Value, json};
use sqlx::postgres::PgPoolOptions;

use shipdesk_admin::melhor_envio::memory::{InMemoryCredentialStore, InMemoryLabelRepository};
use shipdesk_admin::melhor_envio::testing::{
    ManualClock, RecordedCall, ScriptedTransport, fast_retry_policy,
};
use shipdesk_admin::melhor_envio::token::TOKEN_PATH;
use shipdesk_admin::melhor_envio::wire::{CALCULATE_PATH, LABELS_PATH};
use shipdesk_admin::melhor_envio::{Credentials, Shipping};
use shipdesk_admin::routes;
use shipdesk_admin::state::AppState;
use shipdesk_core::{Address, Package, PostalCode, ShipmentRequest};

pub use shipdesk_admin::melhor_envio::testing::Reply;

/// A scripted Melhor Envio account.
///
/// Token exchanges succeed by default; every other route answers 404 until
/// scripted.
pub struct MockCarrier {
    transport: Arc<ScriptedTransport>,
    credential_store: Arc<InMemoryCredentialStore>,
    labels: Arc<InMemoryLabelRepository>,
    clock: Arc<ManualClock>,
}

impl MockCarrier {
    #[must_use]
    pub fn new() -> Self {
        Self::with_transport(ScriptedTransport::new())
    }

    /// Every reply is delayed, so concurrent callers overlap.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self::with_transport(ScriptedTransport::new().with_latency(latency))
    }

    fn with_transport(transport: ScriptedTransport) -> Self {
        let carrier = Self {
            transport: Arc::new(transport),
            credential_store: Arc::new(InMemoryCredentialStore::new()),
            labels: Arc::new(InMemoryLabelRepository::new()),
            clock: Arc::new(ManualClock::default()),
        };
        carrier.always(Method::POST, TOKEN_PATH, token_reply("tok-1", "rt-2"));
        carrier
    }

    /// Services wired to this carrier with fast retries.
    #[must_use]
    pub fn shipping(&self) -> Shipping {
        Shipping::builder(credentials(), self.transport.clone())
            .credential_store(self.credential_store.clone())
            .label_repository(self.labels.clone())
            .clock(self.clock.clone())
            .retry_policy(fast_retry_policy())
            .build()
    }

    /// The admin router on top of [`Self::shipping`].
    ///
    /// The pool is never connected; none of the shipping routes touch it.
    #[must_use]
    pub fn app(&self) -> Router {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/shipdesk_test")
            .unwrap();
        routes::router(AppState::new(pool, self.shipping()))
    }

    pub fn enqueue(&self, method: Method, path: &str, reply: Reply) {
        self.transport.enqueue(method, path, reply);
    }

    pub fn always(&self, method: Method, path: &str, reply: Reply) {
        self.transport.always(method, path, reply);
    }

    /// Answer quote requests with the given services.
    pub fn quotes(&self, services: &Value) {
        self.always(Method::POST, CALCULATE_PATH, Reply::json(200, services.clone()));
    }

    /// Accept the next label purchase.
    pub fn accept_purchase(&self, label_id: &str, tracking: &str) {
        self.enqueue(
            Method::POST,
            LABELS_PATH,
            Reply::json(
                200,
                json!({"id": label_id, "status": "released", "tracking": tracking}),
            ),
        );
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.transport.calls()
    }

    #[must_use]
    pub fn calls_to(&self, method: &Method, path: &str) -> Vec<RecordedCall> {
        self.transport.calls_to(method, path)
    }

    #[must_use]
    pub fn count(&self, method: &Method, path: &str) -> usize {
        self.transport.count(method, path)
    }

    /// Number of refresh-token exchanges so far.
    #[must_use]
    pub fn token_exchanges(&self) -> usize {
        self.count(&Method::POST, TOKEN_PATH)
    }

    #[must_use]
    pub fn credential_store(&self) -> &InMemoryCredentialStore {
        &self.credential_store
    }

    #[must_use]
    pub fn labels(&self) -> &InMemoryLabelRepository {
        &self.labels
    }

    #[must_use]
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }
}

impl Default for MockCarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// A successful refresh-token exchange.
#[must_use]
pub fn token_reply(access_token: &str, refresh_token: &str) -> Reply {
    Reply::json(
        200,
        json!({
            "access_token": access_token,
            "refresh_token": refresh_token,
            "expires_in": 3600
        }),
    )
}

#[must_use]
pub fn credentials() -> Credentials {
    Credentials {
        client_id: "client-1".into(),
        client_secret: SecretString::from("client-secret"),
        refresh_token: SecretString::from("rt-1"),
    }
}

/// One 1.5 kg parcel from Sao Paulo to Rio de Janeiro.
#[must_use]
pub fn shipment() -> ShipmentRequest {
    ShipmentRequest::new(
        Address::from_postal_code(PostalCode::parse("01310-100").unwrap()),
        Address::from_postal_code(PostalCode::parse("20040-020").unwrap()),
        vec![Package {
            weight_kg: Decimal::new(15, 1),
            height_cm: 10,
            width_cm: 15,
            length_cm: 20,
            insured_value: Decimal::new(5000, 2),
        }],
    )
    .unwrap()
}

/// [`shipment`] as an API request body.
#[must_use]
pub fn shipment_json() -> Value {
    serde_json::to_value(shipment()).unwrap()
}

/// Two services, listed most expensive first.
#[must_use]
pub fn two_services() -> Value {
    json!([
        {"id": 2, "name": "SEDEX", "price": "20.00", "delivery_time": 3,
         "company": {"name": "Correios"}},
        {"id": 1, "name": "PAC", "price": "15.00", "delivery_time": 5,
         "company": {"name": "Correios"}}
    ])
}

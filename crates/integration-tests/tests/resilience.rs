//! Token refresh, retry and failure mapping against a scripted carrier.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use secrecy::ExposeSecret;
use serde_json::json;

use shipdesk_admin::melhor_envio::token::TOKEN_PATH;
use shipdesk_admin::melhor_envio::wire::BALANCE_PATH;
use shipdesk_admin::melhor_envio::{CredentialStore, ShippingError};
use shipdesk_integration_tests::{MockCarrier, Reply, token_reply};

fn balance_ok() -> Reply {
    Reply::json(200, json!({"balance": "120.50"}))
}

fn bearers(carrier: &MockCarrier) -> Vec<Option<String>> {
    carrier
        .calls_to(&Method::GET, BALANCE_PATH)
        .into_iter()
        .map(|c| c.bearer)
        .collect()
}

#[tokio::test]
async fn test_expired_token_is_refreshed_once_and_replayed() {
    let carrier = MockCarrier::new();
    carrier.enqueue(Method::POST, TOKEN_PATH, token_reply("tok-1", "rt-2"));
    carrier.enqueue(Method::POST, TOKEN_PATH, token_reply("tok-2", "rt-3"));
    carrier.enqueue(Method::GET, BALANCE_PATH, Reply::status(401));
    carrier.enqueue(Method::GET, BALANCE_PATH, balance_ok());

    let balance = carrier.shipping().account().balance().await.unwrap();

    assert_eq!(balance.amount.to_string(), "120.50");
    assert_eq!(carrier.token_exchanges(), 2);
    assert_eq!(
        bearers(&carrier),
        vec![Some("tok-1".to_string()), Some("tok-2".to_string())]
    );
}

#[tokio::test]
async fn test_second_401_is_an_auth_error() {
    let carrier = MockCarrier::new();
    carrier.always(Method::GET, BALANCE_PATH, Reply::status(401));

    let err = carrier.shipping().account().balance().await.unwrap_err();

    assert!(matches!(err, ShippingError::Auth(_)));
    assert_eq!(carrier.count(&Method::GET, BALANCE_PATH), 2);
    assert_eq!(carrier.token_exchanges(), 2);
}

#[tokio::test]
async fn test_server_errors_are_retried_until_success() {
    let carrier = MockCarrier::new();
    carrier.enqueue(Method::GET, BALANCE_PATH, Reply::status(500));
    carrier.enqueue(Method::GET, BALANCE_PATH, Reply::status(503));
    carrier.enqueue(Method::GET, BALANCE_PATH, balance_ok());

    let balance = carrier.shipping().account().balance().await;

    assert!(balance.is_ok());
    assert_eq!(carrier.count(&Method::GET, BALANCE_PATH), 3);
}

#[tokio::test]
async fn test_persistent_server_errors_exhaust_the_budget() {
    let carrier = MockCarrier::new();
    carrier.always(Method::GET, BALANCE_PATH, Reply::status(500));

    let err = carrier.shipping().account().balance().await.unwrap_err();

    assert!(matches!(
        err,
        ShippingError::CarrierUnavailable { attempts: 3, .. }
    ));
    assert_eq!(carrier.count(&Method::GET, BALANCE_PATH), 3);
}

#[tokio::test]
async fn test_rate_limit_honours_retry_after() {
    let carrier = MockCarrier::new();
    carrier.enqueue(
        Method::GET,
        BALANCE_PATH,
        Reply::status(429).retry_after(Duration::from_millis(5)),
    );
    carrier.enqueue(Method::GET, BALANCE_PATH, balance_ok());

    let balance = carrier.shipping().account().balance().await;

    assert!(balance.is_ok());
    assert_eq!(carrier.count(&Method::GET, BALANCE_PATH), 2);
}

#[tokio::test]
async fn test_timeouts_are_retried() {
    let carrier = MockCarrier::new();
    carrier.enqueue(Method::GET, BALANCE_PATH, Reply::timeout());
    carrier.enqueue(Method::GET, BALANCE_PATH, Reply::connection_reset());
    carrier.enqueue(Method::GET, BALANCE_PATH, balance_ok());

    assert!(carrier.shipping().account().balance().await.is_ok());
    assert_eq!(carrier.count(&Method::GET, BALANCE_PATH), 3);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let carrier = MockCarrier::new();
    carrier.always(
        Method::GET,
        BALANCE_PATH,
        Reply::json(403, json!({"message": "Unauthorized scope"})),
    );

    let err = carrier.shipping().account().balance().await.unwrap_err();

    assert!(matches!(err, ShippingError::CarrierRequest { status: 403, .. }));
    assert_eq!(carrier.count(&Method::GET, BALANCE_PATH), 1);
}

#[tokio::test]
async fn test_malformed_success_body_is_a_decode_error() {
    let carrier = MockCarrier::new();
    carrier.enqueue(Method::GET, BALANCE_PATH, Reply::raw(200, "<html>maintenance</html>"));

    let err = carrier.shipping().account().balance().await.unwrap_err();

    assert!(matches!(err, ShippingError::Decode(_)));
    assert_eq!(carrier.count(&Method::GET, BALANCE_PATH), 1);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let carrier = MockCarrier::with_latency(Duration::from_millis(20));
    carrier.always(Method::GET, BALANCE_PATH, balance_ok());
    let shipping = Arc::new(carrier.shipping());

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let shipping = Arc::clone(&shipping);
        tasks.spawn(async move { shipping.account().balance().await });
    }
    while let Some(result) = tasks.join_next().await {
        assert!(result.unwrap().is_ok());
    }

    assert_eq!(carrier.token_exchanges(), 1);
    assert_eq!(carrier.count(&Method::GET, BALANCE_PATH), 10);
}

#[tokio::test]
async fn test_rotated_refresh_token_is_persisted_and_reused() {
    let carrier = MockCarrier::new();
    carrier.enqueue(Method::POST, TOKEN_PATH, token_reply("tok-1", "rt-2"));
    carrier.enqueue(Method::POST, TOKEN_PATH, token_reply("tok-2", "rt-3"));
    carrier.always(Method::GET, BALANCE_PATH, balance_ok());
    let shipping = carrier.shipping();

    shipping.account().balance().await.unwrap();
    let saved = carrier.credential_store().load().await.unwrap().unwrap();
    assert_eq!(saved.refresh_token.expose_secret(), "rt-2");

    // Past expiry the next exchange must present the rotated token.
    carrier.clock().advance(chrono::Duration::hours(2));
    shipping.account().balance().await.unwrap();

    let exchanges = carrier.calls_to(&Method::POST, TOKEN_PATH);
    assert_eq!(exchanges.len(), 2);
    assert_eq!(exchanges[0].body.as_ref().unwrap()["refresh_token"], "rt-1");
    assert_eq!(exchanges[1].body.as_ref().unwrap()["refresh_token"], "rt-2");
    assert_eq!(
        bearers(&carrier),
        vec![Some("tok-1".to_string()), Some("tok-2".to_string())]
    );
}

#[tokio::test]
async fn test_persisted_token_survives_a_restart() {
    let carrier = MockCarrier::new();
    carrier.always(Method::GET, BALANCE_PATH, balance_ok());

    carrier.shipping().account().balance().await.unwrap();
    // A fresh set of services over the same store reuses the saved token.
    carrier.shipping().account().balance().await.unwrap();

    assert_eq!(carrier.token_exchanges(), 1);
}

#[tokio::test]
async fn test_revoked_refresh_token_fails_fast() {
    let carrier = MockCarrier::new();
    carrier.always(
        Method::POST,
        TOKEN_PATH,
        Reply::json(401, json!({"error": "invalid_grant"})),
    );
    carrier.always(Method::GET, BALANCE_PATH, balance_ok());
    let shipping = carrier.shipping();

    let first = shipping.account().balance().await.unwrap_err();
    let second = shipping.account().balance().await.unwrap_err();

    assert!(matches!(first, ShippingError::Auth(_)));
    assert!(matches!(second, ShippingError::Auth(_)));
    assert_eq!(carrier.token_exchanges(), 1);
    assert_eq!(carrier.count(&Method::GET, BALANCE_PATH), 0);
    assert!(shipping.tokens().is_revoked().await);
}

#[tokio::test]
async fn test_token_endpoint_outage_is_retried() {
    let carrier = MockCarrier::new();
    carrier.enqueue(Method::POST, TOKEN_PATH, Reply::status(502));
    carrier.always(Method::GET, BALANCE_PATH, balance_ok());

    assert!(carrier.shipping().account().balance().await.is_ok());
    assert_eq!(carrier.token_exchanges(), 2);
}

#[tokio::test]
async fn test_preflight_reports_company_and_balance() {
    let carrier = MockCarrier::new();
    carrier.always(
        Method::GET,
        shipdesk_admin::melhor_envio::wire::COMPANIES_PATH,
        Reply::json(
            200,
            json!([{"name": "loja", "company_name": "Loja Ltda", "document": "12345678000199"}]),
        ),
    );
    carrier.always(Method::GET, BALANCE_PATH, balance_ok());

    let diagnostics = carrier.shipping().account().preflight().await.unwrap();

    assert_eq!(diagnostics.company.name, "Loja Ltda");
    assert_eq!(diagnostics.company.document.as_deref(), Some("12345678000199"));
    assert_eq!(diagnostics.balance.amount.to_string(), "120.50");
    assert_eq!(carrier.token_exchanges(), 1);
}

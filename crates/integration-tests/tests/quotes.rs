//! Quoting against a scripted carrier.

use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::json;

use shipdesk_admin::melhor_envio::ShippingError;
use shipdesk_admin::melhor_envio::wire::CALCULATE_PATH;
use shipdesk_core::{CarrierServiceId, CurrencyCode, ShipmentRequest};
use shipdesk_integration_tests::{MockCarrier, Reply, shipment, two_services};

#[tokio::test]
async fn test_quotes_come_back_cheapest_first() {
    let carrier = MockCarrier::new();
    carrier.quotes(&two_services());

    let quotes = carrier.shipping().quotes().get_quotes(&shipment()).await.unwrap();

    let prices: Vec<Decimal> = quotes.iter().map(|q| q.price().amount).collect();
    assert_eq!(prices, vec![Decimal::new(1500, 2), Decimal::new(2000, 2)]);
    assert_eq!(quotes[0].carrier_service_id(), CarrierServiceId::new(1));
    assert_eq!(quotes[0].service_name(), "PAC");
    assert_eq!(quotes[0].carrier_name(), "Correios");
    assert_eq!(quotes[0].estimated_days(), 5);
    assert_eq!(quotes[0].price().currency_code, CurrencyCode::BRL);
}

#[tokio::test]
async fn test_quote_request_carries_normalized_postal_codes_and_token() {
    let carrier = MockCarrier::new();
    carrier.quotes(&two_services());

    carrier.shipping().quotes().get_quotes(&shipment()).await.unwrap();

    let calls = carrier.calls_to(&Method::POST, CALCULATE_PATH);
    assert_eq!(calls.len(), 1);
    let body = calls[0].body.as_ref().unwrap();
    assert_eq!(body["from"]["postal_code"], "01310100");
    assert_eq!(body["to"]["postal_code"], "20040020");
    assert_eq!(body["volumes"].as_array().unwrap().len(), 1);
    assert_eq!(calls[0].bearer.as_deref(), Some("tok-1"));
}

#[tokio::test]
async fn test_unavailable_services_are_left_out() {
    let carrier = MockCarrier::new();
    carrier.quotes(&json!([
        {"id": 1, "name": "PAC", "price": "15.00", "delivery_time": 6},
        {"id": 17, "name": "Mini Envios", "error": "Dimensões excedem o limite"}
    ]));

    let quotes = carrier.shipping().quotes().get_quotes(&shipment()).await.unwrap();

    assert_eq!(quotes.len(), 1);
    assert_eq!(quotes[0].service_name(), "PAC");
}

#[tokio::test]
async fn test_route_without_services_is_an_empty_list() {
    let carrier = MockCarrier::new();
    carrier.quotes(&json!([]));

    let quotes = carrier.shipping().quotes().get_quotes(&shipment()).await.unwrap();

    assert!(quotes.is_empty());
}

#[tokio::test]
async fn test_invalid_shipment_never_reaches_the_carrier() {
    let carrier = MockCarrier::new();
    carrier.quotes(&two_services());
    let empty = ShipmentRequest {
        packages: Vec::new(),
        ..shipment()
    };

    let err = carrier
        .shipping()
        .quotes()
        .get_quotes(&empty)
        .await
        .unwrap_err();

    assert!(matches!(err, ShippingError::Validation(_)));
    assert!(carrier.calls().is_empty());
}

#[tokio::test]
async fn test_unparseable_price_is_a_decode_error() {
    let carrier = MockCarrier::new();
    carrier.quotes(&json!([
        {"id": 1, "name": "PAC", "price": "quinze", "delivery_time": 6}
    ]));

    let err = carrier
        .shipping()
        .quotes()
        .get_quotes(&shipment())
        .await
        .unwrap_err();

    assert!(matches!(err, ShippingError::Decode(_)));
}

#[tokio::test]
async fn test_quote_for_service_picks_the_requested_service() {
    let carrier = MockCarrier::new();
    carrier.quotes(&two_services());
    let shipping = carrier.shipping();

    let sedex = shipping
        .quotes()
        .quote_for_service(&shipment(), CarrierServiceId::new(2))
        .await
        .unwrap()
        .unwrap();
    let missing = shipping
        .quotes()
        .quote_for_service(&shipment(), CarrierServiceId::new(99))
        .await
        .unwrap();

    assert_eq!(sedex.service_name(), "SEDEX");
    assert_eq!(sedex.price().amount, Decimal::new(2000, 2));
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_rejected_postal_code_surfaces_the_carrier_message() {
    let carrier = MockCarrier::new();
    carrier.enqueue(
        Method::POST,
        CALCULATE_PATH,
        Reply::json(422, json!({"message": "CEP de destino inválido"})),
    );

    let err = carrier
        .shipping()
        .quotes()
        .get_quotes(&shipment())
        .await
        .unwrap_err();

    match err {
        ShippingError::CarrierRequest { status, payload } => {
            assert_eq!(status, 422);
            assert!(payload.contains("CEP de destino"));
        }
        other => panic!("expected CarrierRequest, got {other:?}"),
    }
    assert_eq!(carrier.count(&Method::POST, CALCULATE_PATH), 1);
}

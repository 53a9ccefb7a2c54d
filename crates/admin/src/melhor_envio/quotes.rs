//! Shipping rate quotes.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use shipdesk_core::{CarrierServiceId, Price, ShipmentRequest};
use tracing::{debug, info, instrument};

use super::ShippingError;
use super::client::CarrierClient;
use super::wire::{CALCULATE_PATH, CalculateEntry, CalculateRequest};

/// A priced shipping option for one shipment.
///
/// Only [`QuoteService`] creates quotes, so every label traces back to a
/// price the carrier actually offered. The shipment it was quoted for rides
/// along and is what gets labeled.
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    carrier_service_id: CarrierServiceId,
    service_name: String,
    carrier_name: String,
    price: Price,
    estimated_days: u32,
    #[serde(skip)]
    shipment: Arc<ShipmentRequest>,
}

impl Quote {
    #[must_use]
    pub const fn carrier_service_id(&self) -> CarrierServiceId {
        self.carrier_service_id
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub fn carrier_name(&self) -> &str {
        &self.carrier_name
    }

    #[must_use]
    pub const fn price(&self) -> Price {
        self.price
    }

    #[must_use]
    pub const fn estimated_days(&self) -> u32 {
        self.estimated_days
    }

    #[must_use]
    pub fn shipment(&self) -> &ShipmentRequest {
        &self.shipment
    }

    fn from_entry(entry: CalculateEntry, shipment: &Arc<ShipmentRequest>) -> Result<Self, ShippingError> {
        let amount = entry
            .custom_price
            .as_ref()
            .or(entry.price.as_ref())
            .ok_or_else(|| ShippingError::Decode(format!("service {} has no price", entry.id)))?;
        let price = amount
            .to_price()
            .map_err(|e| ShippingError::Decode(format!("service {} price: {e}", entry.id)))?;
        let estimated_days = entry
            .custom_delivery_time
            .or(entry.delivery_time)
            .ok_or_else(|| {
                ShippingError::Decode(format!("service {} has no delivery time", entry.id))
            })?;

        Ok(Self {
            carrier_service_id: CarrierServiceId::new(entry.id),
            service_name: entry.name,
            carrier_name: entry.company.map(|c| c.name).unwrap_or_default(),
            price,
            estimated_days,
            shipment: Arc::clone(shipment),
        })
    }

    /// Cheapest first, then fastest, then by service id.
    fn cmp_rank(&self, other: &Self) -> Ordering {
        self.price
            .amount
            .cmp(&other.price.amount)
            .then(self.estimated_days.cmp(&other.estimated_days))
            .then(
                self.carrier_service_id
                    .as_i32()
                    .cmp(&other.carrier_service_id.as_i32()),
            )
    }
}

#[derive(Clone)]
pub struct QuoteService {
    client: CarrierClient,
}

impl QuoteService {
    #[must_use]
    pub const fn new(client: CarrierClient) -> Self {
        Self { client }
    }

    /// Quote every service that serves the route, cheapest first.
    ///
    /// Services the carrier reports as unavailable are left out. An empty
    /// list means no service covers the route.
    ///
    /// # Errors
    ///
    /// - [`ShippingError::Validation`] before any network call if the shipment
    ///   is malformed
    /// - [`ShippingError::Decode`] if a returned price is not a decimal
    /// - any client error
    #[instrument(
        skip(self, shipment),
        fields(
            from = %shipment.origin.postal_code,
            to = %shipment.destination.postal_code,
            packages = shipment.packages.len()
        )
    )]
    pub async fn get_quotes(&self, shipment: &ShipmentRequest) -> Result<Vec<Quote>, ShippingError> {
        shipment.validate()?;

        let entries: Vec<CalculateEntry> = self
            .client
            .post(CALCULATE_PATH, &CalculateRequest::from(shipment))
            .await?;

        let shared = Arc::new(shipment.clone());
        let mut quotes = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(reason) = &entry.error {
                debug!(service_id = entry.id, service = %entry.name, %reason, "service unavailable for route");
                continue;
            }
            quotes.push(Quote::from_entry(entry, &shared)?);
        }

        quotes.sort_by(Quote::cmp_rank);
        info!(count = quotes.len(), "received shipping quotes");
        Ok(quotes)
    }

    /// Re-quote and return the offer for one service, if it is still available.
    ///
    /// # Errors
    ///
    /// Same as [`Self::get_quotes`].
    pub async fn quote_for_service(
        &self,
        shipment: &ShipmentRequest,
        service_id: CarrierServiceId,
    ) -> Result<Option<Quote>, ShippingError> {
        Ok(self
            .get_quotes(shipment)
            .await?
            .into_iter()
            .find(|q| q.carrier_service_id == service_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use reqwest::Method;
    use rust_decimal::Decimal;
    use secrecy::SecretString;
    use serde_json::json;
    use shipdesk_core::{Address, Package, PostalCode};

    use super::*;
    use crate::melhor_envio::Shipping;
    use crate::melhor_envio::testing::{Reply, ScriptedTransport, fast_retry_policy};
    use crate::melhor_envio::token::{Credentials, TOKEN_PATH};

    fn shipment(weight_kg: Decimal) -> ShipmentRequest {
        ShipmentRequest {
            origin: Address::from_postal_code(PostalCode::parse("01310-100").unwrap()),
            destination: Address::from_postal_code(PostalCode::parse("20040-020").unwrap()),
            packages: vec![Package {
                weight_kg,
                height_cm: 10,
                width_cm: 15,
                length_cm: 20,
                insured_value: Decimal::new(100, 0),
            }],
        }
    }

    fn shipping(transport: &Arc<ScriptedTransport>) -> Shipping {
        transport.always(
            Method::POST,
            TOKEN_PATH,
            Reply::json(200, json!({"access_token": "tok", "expires_in": 3600})),
        );
        Shipping::builder(
            Credentials {
                client_id: "id".into(),
                client_secret: SecretString::from("secret"),
                refresh_token: SecretString::from("rt"),
            },
            transport.clone(),
        )
        .retry_policy(fast_retry_policy())
        .build()
    }

    #[tokio::test]
    async fn test_invalid_weight_makes_no_network_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let shipping = shipping(&transport);

        for weight in [Decimal::ZERO, Decimal::new(-5, 1)] {
            let result = shipping.quotes().get_quotes(&shipment(weight)).await;
            assert!(matches!(result, Err(ShippingError::Validation(_))));
        }
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_quotes_sorted_and_unavailable_skipped() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(
            Method::POST,
            CALCULATE_PATH,
            Reply::json(
                200,
                json!([
                    {"id": 2, "name": "SEDEX", "price": "20.00", "delivery_time": 3,
                     "company": {"name": "Correios"}},
                    {"id": 3, "name": ".Package", "error": "Serviço indisponível para o trecho."},
                    {"id": 1, "name": "PAC", "price": "15.00", "delivery_time": 5,
                     "company": {"name": "Correios"}},
                    {"id": 17, "name": "Mini Envios", "price": "15.00", "delivery_time": 4,
                     "company": {"name": "Correios"}}
                ]),
            ),
        );

        let quotes = shipping(&transport)
            .quotes()
            .get_quotes(&shipment(Decimal::ONE))
            .await
            .unwrap();

        let ranked: Vec<(i32, Decimal, u32)> = quotes
            .iter()
            .map(|q| (q.carrier_service_id().as_i32(), q.price().amount, q.estimated_days()))
            .collect();
        assert_eq!(
            ranked,
            vec![
                (17, Decimal::new(1500, 2), 4),
                (1, Decimal::new(1500, 2), 5),
                (2, Decimal::new(2000, 2), 3),
            ]
        );
        assert_eq!(quotes[0].carrier_name(), "Correios");
        assert_eq!(quotes[0].shipment(), &shipment(Decimal::ONE));
    }

    #[tokio::test]
    async fn test_custom_price_preferred() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(
            Method::POST,
            CALCULATE_PATH,
            Reply::json(
                200,
                json!([{"id": 1, "name": "PAC", "price": "18.90", "custom_price": "16.40",
                        "delivery_time": 6, "custom_delivery_time": 7}]),
            ),
        );

        let quotes = shipping(&transport)
            .quotes()
            .get_quotes(&shipment(Decimal::ONE))
            .await
            .unwrap();

        assert_eq!(quotes[0].price().amount, Decimal::new(1640, 2));
        assert_eq!(quotes[0].estimated_days(), 7);
    }

    #[tokio::test]
    async fn test_no_services_is_empty_not_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(
            Method::POST,
            CALCULATE_PATH,
            Reply::json(200, json!([{"id": 1, "name": "PAC", "error": "indisponível"}])),
        );

        let quotes = shipping(&transport)
            .quotes()
            .get_quotes(&shipment(Decimal::ONE))
            .await
            .unwrap();
        assert!(quotes.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_price_is_decode_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(
            Method::POST,
            CALCULATE_PATH,
            Reply::json(200, json!([{"id": 1, "name": "PAC", "price": "grátis", "delivery_time": 2}])),
        );

        let result = shipping(&transport)
            .quotes()
            .get_quotes(&shipment(Decimal::ONE))
            .await;
        assert!(matches!(result, Err(ShippingError::Decode(_))));
    }

    #[tokio::test]
    async fn test_quote_for_service() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.always(
            Method::POST,
            CALCULATE_PATH,
            Reply::json(200, json!([{"id": 1, "name": "PAC", "price": "15.00", "delivery_time": 5}])),
        );
        let shipping = shipping(&transport);

        let found = shipping
            .quotes()
            .quote_for_service(&shipment(Decimal::ONE), CarrierServiceId::new(1))
            .await
            .unwrap();
        let missing = shipping
            .quotes()
            .quote_for_service(&shipment(Decimal::ONE), CarrierServiceId::new(2))
            .await
            .unwrap();

        assert_eq!(found.unwrap().service_name(), "PAC");
        assert!(missing.is_none());
    }
}

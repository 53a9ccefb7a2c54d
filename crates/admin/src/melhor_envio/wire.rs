//! Melhor Envio JSON shapes.
//!
//! Kept separate from the domain types so carrier quirks (numbers that arrive
//! as strings, error entries mixed into result lists) stay here.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shipdesk_core::{Address, CurrencyCode, Package, Price, PriceParseError, ShipmentRequest};

pub const COMPANIES_PATH: &str = "/api/v2/me/companies";
pub const BALANCE_PATH: &str = "/api/v2/me/balance";
pub const CALCULATE_PATH: &str = "/api/v2/me/shipment/calculate";
pub const LABELS_PATH: &str = "/api/v2/me/shipment/labels";
pub const CANCEL_PATH: &str = "/api/v2/me/shipment/cancel";
pub const TRACKING_PATH: &str = "/api/v2/me/shipment/tracking";

// =============================================================================
// Shared
// =============================================================================

/// A monetary amount the carrier sends either as `"15.00"` or `15.0`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Amount {
    Text(String),
    Number(serde_json::Number),
}

impl Amount {
    pub fn to_price(&self) -> Result<Price, PriceParseError> {
        match self {
            Self::Text(s) => Price::parse(s, CurrencyCode::BRL),
            Self::Number(n) => Price::parse(&n.to_string(), CurrencyCode::BRL),
        }
    }

    /// Same as [`Self::to_price`], but below-zero amounts are kept.
    pub fn to_signed_price(&self) -> Result<Price, PriceParseError> {
        match self {
            Self::Text(s) => Price::parse_signed(s, CurrencyCode::BRL),
            Self::Number(n) => Price::parse_signed(&n.to_string(), CurrencyCode::BRL),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PostalOnly<'a> {
    pub postal_code: &'a str,
}

#[derive(Debug, Serialize)]
pub struct AddressBody<'a> {
    pub postal_code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_abbr: Option<&'a str>,
}

impl<'a> From<&'a Address> for AddressBody<'a> {
    fn from(address: &'a Address) -> Self {
        Self {
            postal_code: address.postal_code.as_str(),
            name: address.name.as_deref(),
            city: address.city.as_deref(),
            state_abbr: address.state.as_deref(),
        }
    }
}

/// One package, in the units the carrier expects (cm, kg, BRL).
#[derive(Debug, Serialize)]
pub struct Volume {
    pub height: u32,
    pub width: u32,
    pub length: u32,
    #[serde(with = "rust_decimal::serde::float")]
    pub weight: Decimal,
    /// Sent as a decimal string so the amount never passes through a float.
    #[serde(with = "rust_decimal::serde::str")]
    pub insurance_value: Decimal,
}

impl From<&Package> for Volume {
    fn from(package: &Package) -> Self {
        Self {
            height: package.height_cm,
            width: package.width_cm,
            length: package.length_cm,
            weight: package.weight_kg,
            insurance_value: money(package.insured_value),
        }
    }
}

fn money(amount: Decimal) -> Decimal {
    let mut amount = amount.round_dp(2);
    amount.rescale(2);
    amount
}

pub fn volumes(shipment: &ShipmentRequest) -> Vec<Volume> {
    shipment.packages.iter().map(Volume::from).collect()
}

// =============================================================================
// Account
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CompaniesResponse {
    Page { data: Vec<Company> },
    List(Vec<Company>),
}

impl CompaniesResponse {
    pub fn into_first(self) -> Option<Company> {
        match self {
            Self::Page { data } | Self::List(data) => data.into_iter().next(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Company {
    pub name: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub contract_number: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BalanceResponse {
    pub balance: Amount,
}

// =============================================================================
// Quotes
// =============================================================================

#[derive(Debug, Serialize)]
pub struct CalculateRequest<'a> {
    pub from: PostalOnly<'a>,
    pub to: PostalOnly<'a>,
    pub volumes: Vec<Volume>,
}

impl<'a> From<&'a ShipmentRequest> for CalculateRequest<'a> {
    fn from(shipment: &'a ShipmentRequest) -> Self {
        Self {
            from: PostalOnly {
                postal_code: shipment.origin.postal_code.as_str(),
            },
            to: PostalOnly {
                postal_code: shipment.destination.postal_code.as_str(),
            },
            volumes: volumes(shipment),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CalculateEntry {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub price: Option<Amount>,
    /// Contract price, when the account has one.
    #[serde(default)]
    pub custom_price: Option<Amount>,
    #[serde(default)]
    pub delivery_time: Option<u32>,
    #[serde(default)]
    pub custom_delivery_time: Option<u32>,
    #[serde(default)]
    pub company: Option<CarrierCompany>,
    /// Present when the service does not serve the route.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CarrierCompany {
    pub name: String,
}

// =============================================================================
// Labels
// =============================================================================

#[derive(Debug, Serialize)]
pub struct PurchaseRequest<'a> {
    pub service: i32,
    pub order_reference: String,
    pub from: AddressBody<'a>,
    pub to: AddressBody<'a>,
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseResponse {
    pub id: String,
    #[serde(default)]
    pub tracking: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelRequest<'a> {
    pub order: CancelOrder<'a>,
}

#[derive(Debug, Serialize)]
pub struct CancelOrder<'a> {
    pub id: &'a str,
    pub reason_id: &'static str,
    pub description: &'a str,
}

/// Keyed by label id.
pub type CancelResponse = HashMap<String, CancelOutcome>;

#[derive(Debug, Deserialize)]
pub struct CancelOutcome {
    pub canceled: bool,
}

#[derive(Debug, Serialize)]
pub struct TrackingRequest<'a> {
    pub orders: [&'a str; 1],
}

/// Keyed by label id.
pub type TrackingResponse = HashMap<String, TrackingEntry>;

#[derive(Debug, Deserialize)]
pub struct TrackingEntry {
    pub status: String,
    #[serde(default)]
    pub tracking: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use shipdesk_core::PostalCode;

    #[test]
    fn test_amount_accepts_string_and_number() {
        let text: Amount = serde_json::from_value(json!("15.00")).unwrap();
        let number: Amount = serde_json::from_value(json!(20.5)).unwrap();
        assert_eq!(text.to_price().unwrap().amount, Decimal::new(1500, 2));
        assert_eq!(number.to_price().unwrap().amount, Decimal::new(205, 1));
    }

    #[test]
    fn test_companies_page_and_list() {
        let page: CompaniesResponse =
            serde_json::from_value(json!({"data": [{"name": "Loja"}]})).unwrap();
        let list: CompaniesResponse = serde_json::from_value(json!([{"name": "Loja"}])).unwrap();
        assert_eq!(page.into_first().unwrap().name, "Loja");
        assert_eq!(list.into_first().unwrap().name, "Loja");
    }

    #[test]
    fn test_calculate_request_shape() {
        let shipment = ShipmentRequest {
            origin: Address::from_postal_code(PostalCode::parse("01310-100").unwrap()),
            destination: Address::from_postal_code(PostalCode::parse("20040-020").unwrap()),
            packages: vec![Package {
                weight_kg: Decimal::new(15, 1),
                height_cm: 10,
                width_cm: 15,
                length_cm: 20,
                insured_value: Decimal::new(50, 0),
            }],
        };

        let body = serde_json::to_value(CalculateRequest::from(&shipment)).unwrap();
        assert_eq!(
            body,
            json!({
                "from": {"postal_code": "01310100"},
                "to": {"postal_code": "20040020"},
                "volumes": [{
                    "height": 10,
                    "width": 15,
                    "length": 20,
                    "weight": 1.5,
                    "insurance_value": "50.00"
                }]
            })
        );
    }

    #[test]
    fn test_insurance_value_keeps_exact_cents() {
        let package = Package {
            weight_kg: Decimal::ONE,
            height_cm: 1,
            width_cm: 1,
            length_cm: 1,
            insured_value: Decimal::new(1999, 2) + Decimal::new(1, 2),
        };

        let body = serde_json::to_value(Volume::from(&package)).unwrap();
        assert_eq!(body["insurance_value"], "20.00");
    }

    #[test]
    fn test_calculate_entry_with_error() {
        let entry: CalculateEntry = serde_json::from_value(json!({
            "id": 3,
            "name": ".Package",
            "error": "Serviço indisponível para o trecho."
        }))
        .unwrap();
        assert!(entry.error.is_some());
        assert!(entry.price.is_none());
    }
}

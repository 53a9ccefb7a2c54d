//! Carrier diagnostics from the command line.
//!
//! Uses the same wiring as the admin server, so the rotated refresh token is
//! read from and written back to the admin database.
//!
//! # Environment Variables
//!
//! - `ADMIN_DATABASE_URL` - `PostgreSQL` connection string
//! - `MELHOR_ENVIO_*` - carrier credentials (see the admin config)

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use shipdesk_admin::config::{ConfigError, MelhorEnvioConfig};
use shipdesk_admin::db;
use shipdesk_admin::melhor_envio::{Shipping, ShippingError};
use shipdesk_core::{Address, Package, PostalCode, ShipmentError, ShipmentRequest};

use super::migrate::{self, MigrationError};

#[derive(Debug, Error)]
pub enum ShippingCommandError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] MigrationError),

    #[error("Database error: {0}")]
    Pool(#[from] sqlx::Error),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid shipment: {0}")]
    Shipment(#[from] ShipmentError),

    #[error(transparent)]
    Shipping(#[from] ShippingError),

    #[error("Failed to encode output: {0}")]
    Output(#[from] serde_json::Error),
}

/// Dimensions and endpoints for `sd-cli shipping quote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteArgs {
    pub from: String,
    pub to: String,
    pub weight_kg: Decimal,
    pub height_cm: u32,
    pub width_cm: u32,
    pub length_cm: u32,
    pub insured_value: Decimal,
}

impl QuoteArgs {
    /// Build a single-package shipment.
    ///
    /// # Errors
    ///
    /// Returns [`ShipmentError`] for malformed postal codes or package values.
    pub fn shipment(&self) -> Result<ShipmentRequest, ShipmentError> {
        ShipmentRequest::new(
            Address::from_postal_code(PostalCode::parse(&self.from)?),
            Address::from_postal_code(PostalCode::parse(&self.to)?),
            vec![Package {
                weight_kg: self.weight_kg,
                height_cm: self.height_cm,
                width_cm: self.width_cm,
                length_cm: self.length_cm,
                insured_value: self.insured_value,
            }],
        )
    }
}

async fn connect() -> Result<Shipping, ShippingCommandError> {
    // Loads `.env` before the carrier settings are read
    let database_url = migrate::database_url()?;
    let config = MelhorEnvioConfig::from_env()?;
    let pool = db::create_pool(&database_url).await?;

    tracing::info!(base_url = %config.base_url, "Connecting to Melhor Envio");
    Ok(Shipping::from_config(&config, &pool)?)
}

#[allow(clippy::print_stdout)]
fn print_json<T: Serialize>(value: &T) -> Result<(), ShippingCommandError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Check credentials by fetching the company and balance.
pub async fn test() -> Result<(), ShippingCommandError> {
    let shipping = connect().await?;
    let diagnostics = shipping.account().preflight().await?;
    print_json(&diagnostics)
}

/// Print the quotes for one package, cheapest first.
pub async fn quote(args: &QuoteArgs) -> Result<(), ShippingCommandError> {
    // Validate before touching the network or database
    let shipment = args.shipment()?;
    let shipping = connect().await?;

    let quotes = shipping.quotes().get_quotes(&shipment).await?;
    if quotes.is_empty() {
        tracing::warn!("No services available for this route");
    }
    print_json(&quotes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn args() -> QuoteArgs {
        QuoteArgs {
            from: "01310-100".to_string(),
            to: "20040-020".to_string(),
            weight_kg: Decimal::new(15, 1),
            height_cm: 10,
            width_cm: 15,
            length_cm: 20,
            insured_value: Decimal::ZERO,
        }
    }

    #[test]
    fn test_quote_args_build_single_package_shipment() {
        let shipment = args().shipment().unwrap();

        assert_eq!(shipment.origin.postal_code.as_str(), "01310100");
        assert_eq!(shipment.destination.postal_code.as_str(), "20040020");
        assert_eq!(shipment.packages.len(), 1);
        assert_eq!(shipment.packages[0].weight_kg, Decimal::new(15, 1));
    }

    #[test]
    fn test_quote_args_reject_bad_postal_code() {
        let bad = QuoteArgs {
            from: "123".to_string(),
            ..args()
        };

        assert!(bad.shipment().is_err());
    }

    #[test]
    fn test_quote_args_reject_zero_weight() {
        let bad = QuoteArgs {
            weight_kg: Decimal::ZERO,
            ..args()
        };

        assert!(matches!(
            bad.shipment(),
            Err(ShipmentError::NonPositiveWeight { .. })
        ));
    }
}

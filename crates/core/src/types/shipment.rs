//! Shipment descriptions submitted to the carrier for quoting and labeling.
//!
//! Order data from the shop is loosely typed; it is converted into these types
//! at the boundary. [`PostalCode`] refuses malformed input on parse, while the
//! physical package checks live in [`ShipmentRequest::validate`] so they can be
//! enforced right before a carrier call.

use core::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Errors raised while building or validating a shipment.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShipmentError {
    /// Postal code is not an 8-digit CEP.
    #[error("invalid postal code {0:?}: expected 8 digits")]
    InvalidPostalCode(String),
    /// Shipment has no packages.
    #[error("shipment must contain at least one package")]
    NoPackages,
    /// Package weight is zero or negative.
    #[error("package {index}: weight must be positive (got {weight_kg} kg)")]
    NonPositiveWeight {
        /// Position of the package in the request.
        index: usize,
        /// Offending weight.
        weight_kg: Decimal,
    },
    /// A package dimension is zero.
    #[error("package {index}: {dimension} must be positive")]
    DegenerateDimension {
        /// Position of the package in the request.
        index: usize,
        /// Which dimension is zero.
        dimension: &'static str,
    },
    /// Declared value is negative.
    #[error("package {index}: insured value cannot be negative")]
    NegativeInsuredValue {
        /// Position of the package in the request.
        index: usize,
    },
}

/// A Brazilian postal code (CEP), stored as 8 digits without punctuation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PostalCode(String);

impl PostalCode {
    /// Number of digits in a CEP.
    pub const LENGTH: usize = 8;

    /// Parse a postal code, accepting `01310-100`, `01310100` or `01.310-100`.
    ///
    /// # Errors
    ///
    /// Returns [`ShipmentError::InvalidPostalCode`] if the input does not
    /// contain exactly 8 digits once separators are removed.
    pub fn parse(raw: &str) -> Result<Self, ShipmentError> {
        let digits: String = raw
            .chars()
            .filter(|c| !matches!(c, '-' | '.' | ' '))
            .collect();

        if digits.len() != Self::LENGTH || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(ShipmentError::InvalidPostalCode(raw.to_owned()));
        }

        Ok(Self(digits))
    }

    /// Returns the 8 digits.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PostalCode {
    type Error = ShipmentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PostalCode> for String {
    fn from(code: PostalCode) -> Self {
        code.0
    }
}

/// Origin or destination of a shipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub postal_code: PostalCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl Address {
    /// An address known only by its postal code.
    #[must_use]
    pub const fn from_postal_code(postal_code: PostalCode) -> Self {
        Self {
            postal_code,
            name: None,
            city: None,
            state: None,
        }
    }
}

/// A single physical volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Weight in kilograms.
    pub weight_kg: Decimal,
    pub height_cm: u32,
    pub width_cm: u32,
    pub length_cm: u32,
    /// Declared value for insurance, in BRL.
    #[serde(default)]
    pub insured_value: Decimal,
}

impl Package {
    fn validate(&self, index: usize) -> Result<(), ShipmentError> {
        if self.weight_kg <= Decimal::ZERO {
            return Err(ShipmentError::NonPositiveWeight {
                index,
                weight_kg: self.weight_kg,
            });
        }

        for (dimension, value) in [
            ("height", self.height_cm),
            ("width", self.width_cm),
            ("length", self.length_cm),
        ] {
            if value == 0 {
                return Err(ShipmentError::DegenerateDimension { index, dimension });
            }
        }

        if self.insured_value < Decimal::ZERO {
            return Err(ShipmentError::NegativeInsuredValue { index });
        }

        Ok(())
    }
}

/// What to ship, from where, to where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentRequest {
    pub origin: Address,
    pub destination: Address,
    pub packages: Vec<Package>,
}

impl ShipmentRequest {
    /// Build a shipment, validating every package.
    ///
    /// # Errors
    ///
    /// Returns the first [`ShipmentError`] found.
    pub fn new(
        origin: Address,
        destination: Address,
        packages: Vec<Package>,
    ) -> Result<Self, ShipmentError> {
        let request = Self {
            origin,
            destination,
            packages,
        };
        request.validate()?;
        Ok(request)
    }

    /// Check that the shipment can be sent to the carrier.
    ///
    /// # Errors
    ///
    /// Returns [`ShipmentError::NoPackages`] for an empty package list, or the
    /// first package-level violation (non-positive weight, zero dimension,
    /// negative insured value).
    pub fn validate(&self) -> Result<(), ShipmentError> {
        if self.packages.is_empty() {
            return Err(ShipmentError::NoPackages);
        }

        self.packages
            .iter()
            .enumerate()
            .try_for_each(|(index, package)| package.validate(index))
    }

    /// Sum of declared package values.
    #[must_use]
    pub fn total_insured_value(&self) -> Decimal {
        self.packages.iter().map(|p| p.insured_value).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn package(weight_kg: Decimal) -> Package {
        Package {
            weight_kg,
            height_cm: 10,
            width_cm: 15,
            length_cm: 20,
            insured_value: Decimal::new(5000, 2),
        }
    }

    fn address(cep: &str) -> Address {
        Address::from_postal_code(PostalCode::parse(cep).unwrap())
    }

    #[test]
    fn test_postal_code_strips_separators() {
        assert_eq!(PostalCode::parse("01310-100").unwrap().as_str(), "01310100");
        assert_eq!(PostalCode::parse("01.310-100").unwrap().as_str(), "01310100");
    }

    #[test]
    fn test_postal_code_rejects_bad_input() {
        assert!(PostalCode::parse("1234").is_err());
        assert!(PostalCode::parse("0131010A").is_err());
        assert!(PostalCode::parse("").is_err());
    }

    #[test]
    fn test_postal_code_deserialize_validates() {
        let ok: Result<PostalCode, _> = serde_json::from_str("\"20040-020\"");
        assert!(ok.is_ok());
        let bad: Result<PostalCode, _> = serde_json::from_str("\"abc\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_new_accepts_valid_shipment() {
        let request = ShipmentRequest::new(
            address("01310100"),
            address("20040020"),
            vec![package(Decimal::ONE)],
        )
        .unwrap();
        assert_eq!(request.total_insured_value(), Decimal::new(5000, 2));
    }

    #[test]
    fn test_new_rejects_empty_packages() {
        let err = ShipmentRequest::new(address("01310100"), address("20040020"), vec![]);
        assert_eq!(err, Err(ShipmentError::NoPackages));
    }

    #[test]
    fn test_validate_rejects_non_positive_weight() {
        for weight in [Decimal::ZERO, Decimal::new(-1, 0)] {
            let request = ShipmentRequest {
                origin: address("01310100"),
                destination: address("20040020"),
                packages: vec![package(Decimal::ONE), package(weight)],
            };
            assert!(matches!(
                request.validate(),
                Err(ShipmentError::NonPositiveWeight { index: 1, .. })
            ));
        }
    }

    #[test]
    fn test_validate_rejects_zero_dimension() {
        let mut flat = package(Decimal::ONE);
        flat.width_cm = 0;
        let request = ShipmentRequest {
            origin: address("01310100"),
            destination: address("20040020"),
            packages: vec![flat],
        };
        assert_eq!(
            request.validate(),
            Err(ShipmentError::DegenerateDimension {
                index: 0,
                dimension: "width"
            })
        );
    }
}

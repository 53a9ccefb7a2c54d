//! Type-safe price representation using decimal arithmetic.
//!
//! Carriers report monetary amounts as strings (`"15.00"`). They are parsed
//! straight into [`Decimal`] so no value ever passes through a float.

use core::fmt;
use core::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Errors that can occur when parsing a carrier amount.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PriceParseError {
    /// The amount string is empty.
    #[error("amount cannot be empty")]
    Empty,
    /// The amount is not a decimal number.
    #[error("invalid amount: {0:?}")]
    Invalid(String),
    /// The amount is negative.
    #[error("amount cannot be negative: {0}")]
    Negative(Decimal),
}

/// A price with currency information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    /// Amount in the currency's standard unit (e.g., reais, not centavos).
    pub amount: Decimal,
    /// ISO 4217 currency code.
    pub currency_code: CurrencyCode,
}

impl Price {
    /// Create a new price.
    #[must_use]
    pub const fn new(amount: Decimal, currency_code: CurrencyCode) -> Self {
        Self {
            amount,
            currency_code,
        }
    }

    /// Create a price from an amount in the smallest currency unit.
    #[must_use]
    pub fn from_cents(cents: i64, currency_code: CurrencyCode) -> Self {
        Self::new(Decimal::new(cents, 2), currency_code)
    }

    /// Parse a carrier-reported amount such as `"15.00"` or `"15,00"`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is empty, not a decimal number, or
    /// negative.
    pub fn parse(raw: &str, currency_code: CurrencyCode) -> Result<Self, PriceParseError> {
        let price = Self::parse_signed(raw, currency_code)?;
        if price.amount.is_sign_negative() && !price.amount.is_zero() {
            return Err(PriceParseError::Negative(price.amount));
        }
        Ok(price)
    }

    /// Like [`Self::parse`], but negative amounts are accepted.
    ///
    /// Used for account balances, which go below zero when overdrawn.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is empty or not a decimal number.
    pub fn parse_signed(raw: &str, currency_code: CurrencyCode) -> Result<Self, PriceParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PriceParseError::Empty);
        }

        let normalized = trimmed.replace(',', ".");
        let amount = Decimal::from_str_exact(&normalized)
            .or_else(|_| Decimal::from_str(&normalized))
            .map_err(|_| PriceParseError::Invalid(raw.to_owned()))?;

        let mut amount = amount.round_dp(2);
        amount.rescale(2);
        Ok(Self::new(amount, currency_code))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:.2}",
            self.currency_code.symbol(),
            self.amount.round_dp(2)
        )
    }
}

/// ISO 4217 currency codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CurrencyCode {
    #[default]
    BRL,
    USD,
    EUR,
}

impl CurrencyCode {
    /// Display symbol for the currency.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::BRL => "R$",
            Self::USD => "$",
            Self::EUR => "€",
        }
    }

    /// Three-letter ISO code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::BRL => "BRL",
            Self::USD => "USD",
            Self::EUR => "EUR",
        }
    }
}

impl FromStr for CurrencyCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BRL" => Ok(Self::BRL),
            "USD" => Ok(Self::USD),
            "EUR" => Ok(Self::EUR),
            other => Err(format!("unsupported currency: {other}")),
        }
    }
}

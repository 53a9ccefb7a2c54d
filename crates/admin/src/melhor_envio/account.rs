//! Account state: company profile and prepaid balance.
//!
//! Nothing here is cached; each call reflects the carrier at that moment.

use rust_decimal::Decimal;
use serde::Serialize;
use shipdesk_core::CurrencyCode;
use tracing::instrument;

use super::ShippingError;
use super::client::CarrierClient;
use super::wire::{BALANCE_PATH, BalanceResponse, COMPANIES_PATH, CompaniesResponse};

/// The company registered on the carrier account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompanyInfo {
    pub name: String,
    /// CNPJ or CPF.
    pub document: Option<String>,
    pub contract_number: Option<String>,
}

/// Prepaid funds available for label purchases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub amount: Decimal,
    pub currency: CurrencyCode,
}

/// Result of a connectivity check against the carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub company: CompanyInfo,
    pub balance: Balance,
}

#[derive(Clone)]
pub struct AccountService {
    client: CarrierClient,
}

impl AccountService {
    #[must_use]
    pub const fn new(client: CarrierClient) -> Self {
        Self { client }
    }

    /// Fetch the first company on the account.
    ///
    /// # Errors
    ///
    /// Any [`ShippingError`] from the client, or `Decode` if the account has
    /// no company.
    #[instrument(skip(self))]
    pub async fn company_info(&self) -> Result<CompanyInfo, ShippingError> {
        let response: CompaniesResponse = self.client.get(COMPANIES_PATH).await?;
        let company = response
            .into_first()
            .ok_or_else(|| ShippingError::Decode("account has no registered company".into()))?;

        Ok(CompanyInfo {
            name: company.company_name.unwrap_or(company.name),
            document: company.document,
            contract_number: company.contract_number,
        })
    }

    /// Fetch the current balance. An overdrawn account reports a negative
    /// amount.
    ///
    /// # Errors
    ///
    /// Any [`ShippingError`] from the client, or `Decode` if the amount is
    /// not a decimal number.
    #[instrument(skip(self))]
    pub async fn balance(&self) -> Result<Balance, ShippingError> {
        let response: BalanceResponse = self.client.get(BALANCE_PATH).await?;
        let price = response
            .balance
            .to_signed_price()
            .map_err(|e| ShippingError::Decode(format!("balance: {e}")))?;

        Ok(Balance {
            amount: price.amount,
            currency: price.currency_code,
        })
    }

    /// Company and balance in one go, for connectivity checks.
    ///
    /// # Errors
    ///
    /// The first error from either call.
    #[instrument(skip(self))]
    pub async fn preflight(&self) -> Result<Diagnostics, ShippingError> {
        let (company, balance) = tokio::try_join!(self.company_info(), self.balance())?;
        Ok(Diagnostics { company, balance })
    }
}

//! Carrier token persistence.
//!
//! One row per carrier account. The refresh token rotates on every exchange,
//! so losing this row means re-authorizing the application by hand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::PgPool;

use super::RepositoryError;
use crate::melhor_envio::{AccessToken, CredentialStore, TokenState};

/// Account row used when only one carrier account is configured.
pub const DEFAULT_ACCOUNT: &str = "default";

#[derive(sqlx::FromRow)]
struct CarrierTokenRow {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
    refreshed_at: DateTime<Utc>,
}

impl From<CarrierTokenRow> for TokenState {
    fn from(row: CarrierTokenRow) -> Self {
        Self {
            access_token: AccessToken::new(row.access_token, row.expires_at),
            refresh_token: SecretString::from(row.refresh_token),
            refreshed_at: row.refreshed_at,
        }
    }
}

/// `PostgreSQL`-backed [`CredentialStore`].
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
    account_name: String,
}

impl PgCredentialStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self::for_account(pool, DEFAULT_ACCOUNT)
    }

    #[must_use]
    pub fn for_account(pool: PgPool, account_name: impl Into<String>) -> Self {
        Self {
            pool,
            account_name: account_name.into(),
        }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn load(&self) -> Result<Option<TokenState>, RepositoryError> {
        let row: Option<CarrierTokenRow> = sqlx::query_as(
            r"
            SELECT access_token, refresh_token, expires_at, refreshed_at
            FROM admin.carrier_tokens
            WHERE account_name = $1
            ",
        )
        .bind(&self.account_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(TokenState::from))
    }

    async fn save(&self, state: &TokenState) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            INSERT INTO admin.carrier_tokens
                (account_name, access_token, refresh_token, expires_at, refreshed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_name) DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                expires_at = EXCLUDED.expires_at,
                refreshed_at = EXCLUDED.refreshed_at,
                updated_at = NOW()
            ",
        )
        .bind(&self.account_name)
        .bind(state.access_token.secret().expose_secret())
        .bind(state.refresh_token.expose_secret())
        .bind(state.access_token.expires_at())
        .bind(state.refreshed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

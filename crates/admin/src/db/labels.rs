//! Shipping label repository.
//!
//! The partial unique index on `order_id WHERE status <> 'cancelled'` is what
//! keeps two processes from recording two active labels for one order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

use shipdesk_core::{CarrierServiceId, CurrencyCode, LabelId, LabelStatus, OrderId, Price};

use super::{RepositoryError, conflict_on_unique};
use crate::melhor_envio::{Label, LabelRepository};

const LABEL_COLUMNS: &str = "id, order_id, carrier_service_id, tracking_code, status, \
                             price_amount, price_currency, created_at, updated_at";

// =============================================================================
// Internal Row Types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct LabelRow {
    id: String,
    order_id: i32,
    carrier_service_id: i32,
    tracking_code: Option<String>,
    status: String,
    price_amount: Decimal,
    price_currency: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LabelRow> for Label {
    type Error = RepositoryError;

    fn try_from(row: LabelRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<LabelStatus>().map_err(|e| {
            RepositoryError::DataCorruption(format!("label {}: {e}", row.id))
        })?;
        let currency = row.price_currency.parse::<CurrencyCode>().map_err(|e| {
            RepositoryError::DataCorruption(format!("label {}: {e}", row.id))
        })?;

        Ok(Self {
            id: LabelId::new(row.id),
            order_id: OrderId::new(row.order_id),
            carrier_service_id: CarrierServiceId::new(row.carrier_service_id),
            tracking_code: row.tracking_code,
            status,
            price: Price::new(row.price_amount, currency),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// `PostgreSQL`-backed [`LabelRepository`].
#[derive(Clone)]
pub struct PgLabelRepository {
    pool: PgPool,
}

impl PgLabelRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LabelRepository for PgLabelRepository {
    async fn insert(&self, label: &Label) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            INSERT INTO admin.shipping_labels
                (id, order_id, carrier_service_id, tracking_code, status,
                 price_amount, price_currency, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(label.id.as_str())
        .bind(label.order_id)
        .bind(label.carrier_service_id)
        .bind(label.tracking_code.as_deref())
        .bind(label.status.as_str())
        .bind(label.price.amount)
        .bind(label.price.currency_code.code())
        .bind(label.created_at)
        .bind(label.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(
                e,
                &format!("order {} already has an active label", label.order_id),
            )
        })?;

        Ok(())
    }

    async fn get(&self, id: &LabelId) -> Result<Option<Label>, RepositoryError> {
        let row: Option<LabelRow> = sqlx::query_as(&format!(
            "SELECT {LABEL_COLUMNS} FROM admin.shipping_labels WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn active_for_order(&self, order_id: OrderId) -> Result<Option<Label>, RepositoryError> {
        let row: Option<LabelRow> = sqlx::query_as(&format!(
            "SELECT {LABEL_COLUMNS} FROM admin.shipping_labels \
             WHERE order_id = $1 AND status <> 'cancelled'"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn update_status(
        &self,
        id: &LabelId,
        from: LabelStatus,
        to: LabelStatus,
        tracking_code: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Label>, RepositoryError> {
        let row: Option<LabelRow> = sqlx::query_as(&format!(
            "UPDATE admin.shipping_labels \
             SET status = $3, tracking_code = COALESCE($4, tracking_code), updated_at = $5 \
             WHERE id = $1 AND status = $2 \
             RETURNING {LABEL_COLUMNS}"
        ))
        .bind(id.as_str())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(tracking_code)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn row(status: &str) -> LabelRow {
        let now = Utc::now();
        LabelRow {
            id: "lbl-1".into(),
            order_id: 42,
            carrier_service_id: 1,
            tracking_code: Some("BR123".into()),
            status: status.into(),
            price_amount: Decimal::new(1500, 2),
            price_currency: "BRL".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_row_converts_to_label() {
        let label = Label::try_from(row("in_transit")).unwrap();
        assert_eq!(label.status, LabelStatus::InTransit);
        assert_eq!(label.order_id, OrderId::new(42));
        assert_eq!(label.price.currency_code, CurrencyCode::BRL);
    }

    #[test]
    fn test_unknown_status_is_data_corruption() {
        let result = Label::try_from(row("lost"));
        assert!(matches!(result, Err(RepositoryError::DataCorruption(_))));
    }

    #[tokio::test]
    #[ignore = "requires a migrated ADMIN_DATABASE_URL"]
    async fn test_second_active_label_conflicts() {
        let url = std::env::var("ADMIN_DATABASE_URL").unwrap();
        let repo = PgLabelRepository::new(PgPool::connect(&url).await.unwrap());
        let stamp = Utc::now().timestamp_micros();
        let mut label = Label::try_from(row("purchased")).unwrap();
        label.order_id = OrderId::new(i32::try_from(stamp % 1_000_000_000).unwrap());
        label.id = LabelId::new(format!("it-{stamp}"));
        repo.insert(&label).await.unwrap();

        let mut second = label.clone();
        second.id = LabelId::new(format!("{}-b", label.id));
        let result = repo.insert(&second).await;
        assert!(matches!(result, Err(RepositoryError::Conflict(_))));

        let cancelled = repo
            .update_status(
                &label.id,
                LabelStatus::Purchased,
                LabelStatus::Cancelled,
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(cancelled.unwrap().status, LabelStatus::Cancelled);
        repo.insert(&second).await.unwrap();
    }
}

//! In-memory stores.
//!
//! Used when no database is wired in (tests, the CLI's dry runs). They follow
//! the same contracts as the `PostgreSQL` stores in [`crate::db`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipdesk_core::{LabelId, LabelStatus, OrderId};
use tokio::sync::RwLock;

use super::labels::{Label, LabelRepository};
use super::token::{CredentialStore, TokenState};
use crate::db::RepositoryError;

/// Keeps the token pair for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    state: RwLock<Option<TokenState>>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self) -> Result<Option<TokenState>, RepositoryError> {
        Ok(self.state.read().await.clone())
    }

    async fn save(&self, state: &TokenState) -> Result<(), RepositoryError> {
        *self.state.write().await = Some(state.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLabelRepository {
    labels: RwLock<HashMap<LabelId, Label>>,
}

impl InMemoryLabelRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored label, oldest first.
    pub async fn snapshot(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self.labels.read().await.values().cloned().collect();
        labels.sort_by_key(|l| l.created_at);
        labels
    }
}

#[async_trait]
impl LabelRepository for InMemoryLabelRepository {
    async fn insert(&self, label: &Label) -> Result<(), RepositoryError> {
        let mut labels = self.labels.write().await;

        if labels.contains_key(&label.id) {
            return Err(RepositoryError::Conflict(format!(
                "label {} already exists",
                label.id
            )));
        }
        if label.status.is_active()
            && labels
                .values()
                .any(|l| l.order_id == label.order_id && l.status.is_active())
        {
            return Err(RepositoryError::Conflict(format!(
                "order {} already has an active label",
                label.order_id
            )));
        }

        labels.insert(label.id.clone(), label.clone());
        Ok(())
    }

    async fn get(&self, id: &LabelId) -> Result<Option<Label>, RepositoryError> {
        Ok(self.labels.read().await.get(id).cloned())
    }

    async fn active_for_order(&self, order_id: OrderId) -> Result<Option<Label>, RepositoryError> {
        Ok(self
            .labels
            .read()
            .await
            .values()
            .find(|l| l.order_id == order_id && l.status.is_active())
            .cloned())
    }

    async fn update_status(
        &self,
        id: &LabelId,
        from: LabelStatus,
        to: LabelStatus,
        tracking_code: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Label>, RepositoryError> {
        let mut labels = self.labels.write().await;
        let Some(label) = labels.get_mut(id) else {
            return Ok(None);
        };
        if label.status != from {
            return Ok(None);
        }

        label.status = to;
        if let Some(code) = tracking_code {
            label.tracking_code = Some(code.to_owned());
        }
        label.updated_at = at;
        Ok(Some(label.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rust_decimal::Decimal;
    use shipdesk_core::{CarrierServiceId, CurrencyCode, Price};

    use super::*;

    fn label(id: &str, order: i32, status: LabelStatus) -> Label {
        let now = Utc::now();
        Label {
            id: LabelId::new(id),
            order_id: OrderId::new(order),
            carrier_service_id: CarrierServiceId::new(1),
            tracking_code: None,
            status,
            price: Price::new(Decimal::new(1500, 2), CurrencyCode::BRL),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_one_active_label_per_order() {
        let repo = InMemoryLabelRepository::new();
        repo.insert(&label("a", 1, LabelStatus::Purchased))
            .await
            .unwrap();

        let result = repo.insert(&label("b", 1, LabelStatus::Purchased)).await;
        assert!(matches!(result, Err(RepositoryError::Conflict(_))));

        // Another order is unaffected.
        repo.insert(&label("c", 2, LabelStatus::Purchased))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_label_does_not_block_order() {
        let repo = InMemoryLabelRepository::new();
        repo.insert(&label("a", 1, LabelStatus::Purchased))
            .await
            .unwrap();
        repo.update_status(
            &LabelId::new("a"),
            LabelStatus::Purchased,
            LabelStatus::Cancelled,
            None,
            Utc::now(),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(repo.active_for_order(OrderId::new(1)).await.unwrap().is_none());
        repo.insert(&label("b", 1, LabelStatus::Purchased))
            .await
            .unwrap();
        assert_eq!(repo.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn test_update_status_is_compare_and_set() {
        let repo = InMemoryLabelRepository::new();
        repo.insert(&label("a", 1, LabelStatus::Purchased))
            .await
            .unwrap();

        let stale = repo
            .update_status(
                &LabelId::new("a"),
                LabelStatus::InTransit,
                LabelStatus::Delivered,
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(stale.is_none());

        let moved = repo
            .update_status(
                &LabelId::new("a"),
                LabelStatus::Purchased,
                LabelStatus::InTransit,
                Some("BR1"),
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.status, LabelStatus::InTransit);
        assert_eq!(moved.tracking_code.as_deref(), Some("BR1"));

        let missing = repo
            .update_status(
                &LabelId::new("zzz"),
                LabelStatus::Purchased,
                LabelStatus::InTransit,
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}

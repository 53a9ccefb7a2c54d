//! Label purchase, cancellation and tracking.
//!
//! # Invariants
//!
//! - an order has at most one label that is not `Cancelled`
//! - a label row exists only once the carrier acknowledged the purchase
//! - status changes follow [`LabelStatus::can_transition_to`]
//!
//! Purchases for one order are serialized in-process by a per-order lock; the
//! repository enforces the first invariant across processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shipdesk_core::{CarrierServiceId, LabelId, LabelStatus, OrderId, Price};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, instrument, warn};

use super::ShippingError;
use super::client::CarrierClient;
use super::clock::Clock;
use super::quotes::Quote;
use super::wire::{
    self, CANCEL_PATH, CancelOrder, CancelRequest, CancelResponse, LABELS_PATH, PurchaseRequest,
    PurchaseResponse, TRACKING_PATH, TrackingRequest, TrackingResponse,
};
use crate::db::RepositoryError;

/// Reason code sent with cancellations made from the admin.
const CANCEL_REASON_ID: &str = "2";
const CANCEL_DESCRIPTION: &str = "Cancelled from the admin panel";

// =============================================================================
// Types
// =============================================================================

/// A purchased shipping label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Label {
    pub id: LabelId,
    pub order_id: OrderId,
    pub carrier_service_id: CarrierServiceId,
    pub tracking_code: Option<String>,
    pub status: LabelStatus,
    pub price: Price,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Label persistence.
#[async_trait]
pub trait LabelRepository: Send + Sync {
    /// Insert a new label.
    ///
    /// Fails with [`RepositoryError::Conflict`] if the id exists or the order
    /// already has a label that is not cancelled.
    async fn insert(&self, label: &Label) -> Result<(), RepositoryError>;

    async fn get(&self, id: &LabelId) -> Result<Option<Label>, RepositoryError>;

    /// The order's label that is not cancelled, if any.
    async fn active_for_order(&self, order_id: OrderId) -> Result<Option<Label>, RepositoryError>;

    /// Move a label from `from` to `to`, filling in `tracking_code` if given.
    ///
    /// Returns `None` if the label does not exist or is no longer in `from`.
    async fn update_status(
        &self,
        id: &LabelId,
        from: LabelStatus,
        to: LabelStatus,
        tracking_code: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Label>, RepositoryError>;
}

// =============================================================================
// Per-order locks
// =============================================================================

#[derive(Default)]
struct OrderLocks {
    locks: StdMutex<HashMap<OrderId, Arc<Mutex<()>>>>,
}

impl OrderLocks {
    async fn acquire(&self, order_id: OrderId) -> OrderLockGuard<'_> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(locks.entry(order_id).or_default())
        };

        OrderLockGuard {
            owner: self,
            order_id,
            guard: Some(lock.lock_owned().await),
        }
    }
}

struct OrderLockGuard<'a> {
    owner: &'a OrderLocks,
    order_id: OrderId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OrderLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self
            .owner
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Only the map still references the lock: nobody is waiting.
        if locks
            .get(&self.order_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.order_id);
        }
    }
}

// =============================================================================
// Service
// =============================================================================

pub struct LabelService {
    client: CarrierClient,
    repository: Arc<dyn LabelRepository>,
    clock: Arc<dyn Clock>,
    order_locks: OrderLocks,
}

impl LabelService {
    #[must_use]
    pub fn new(
        client: CarrierClient,
        repository: Arc<dyn LabelRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            repository,
            clock,
            order_locks: OrderLocks::default(),
        }
    }

    /// Buy a label for `order_id` from a quote.
    ///
    /// The label is stored as `Purchased` only after the carrier acknowledges
    /// it. Dropping the future before that leaves nothing behind locally.
    ///
    /// The purchase request is never resent after a timeout or 5xx, since the
    /// carrier may already have billed it.
    ///
    /// # Errors
    ///
    /// - [`ShippingError::DuplicatePurchase`] if the order already has an
    ///   active label (checked before calling the carrier, and again by the
    ///   repository on insert)
    /// - [`ShippingError::CarrierUnavailable`] when the carrier did not answer
    ///   cleanly; the purchase may or may not have happened
    /// - any client or repository error
    #[instrument(
        skip(self, quote),
        fields(order_id = %order_id, service_id = %quote.carrier_service_id())
    )]
    pub async fn purchase_label(&self, order_id: OrderId, quote: &Quote) -> Result<Label, ShippingError> {
        let _order_lock = self.order_locks.acquire(order_id).await;

        if let Some(existing) = self.repository.active_for_order(order_id).await? {
            warn!(label_id = %existing.id, status = %existing.status, "order already has an active label");
            return Err(ShippingError::DuplicatePurchase { order_id });
        }

        let shipment = quote.shipment();
        let request = PurchaseRequest {
            service: quote.carrier_service_id().as_i32(),
            order_reference: order_id.to_string(),
            from: (&shipment.origin).into(),
            to: (&shipment.destination).into(),
            volumes: wire::volumes(shipment),
        };
        let response: PurchaseResponse = match self.client.post_once(LABELS_PATH, &request).await {
            Ok(response) => response,
            Err(e @ ShippingError::CarrierUnavailable { .. }) => {
                error!(error = %e, "label purchase outcome unknown, check the carrier panel before retrying");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        let label = Label {
            id: LabelId::new(response.id),
            order_id,
            carrier_service_id: quote.carrier_service_id(),
            tracking_code: response.tracking.filter(|t| !t.trim().is_empty()),
            status: LabelStatus::Purchased,
            price: quote.price(),
            created_at: now,
            updated_at: now,
        };

        match self.repository.insert(&label).await {
            Ok(()) => {
                info!(
                    label_id = %label.id,
                    carrier_status = response.status.as_deref().unwrap_or("unknown"),
                    price = %label.price,
                    "label purchased"
                );
                Ok(label)
            }
            Err(RepositoryError::Conflict(reason)) => {
                error!(label_id = %label.id, %reason, "order gained an active label concurrently, cancelling duplicate at carrier");
                if let Err(e) = self.cancel_at_carrier(&label.id).await {
                    error!(label_id = %label.id, error = %e, "failed to cancel duplicate label, reconcile manually");
                }
                Err(ShippingError::DuplicatePurchase { order_id })
            }
            Err(e) => {
                error!(label_id = %label.id, error = %e, "label purchased but not recorded, reconcile manually");
                Err(e.into())
            }
        }
    }

    /// Cancel a purchased label.
    ///
    /// # Errors
    ///
    /// - [`ShippingError::LabelNotFound`] for an unknown id
    /// - [`ShippingError::InvalidStateTransition`] unless the label is `Purchased`
    /// - [`ShippingError::CarrierRequest`] if the carrier refuses
    #[instrument(skip(self), fields(label_id = %label_id))]
    pub async fn cancel_label(&self, label_id: &LabelId) -> Result<Label, ShippingError> {
        let label = self.load(label_id).await?;
        ensure_transition(label.status, LabelStatus::Cancelled)?;

        self.cancel_at_carrier(label_id).await?;
        let cancelled = self.transition(&label, LabelStatus::Cancelled, None).await?;

        info!("label cancelled");
        Ok(cancelled)
    }

    /// The order's active label, if any.
    ///
    /// # Errors
    ///
    /// Repository errors.
    pub async fn label_for_order(&self, order_id: OrderId) -> Result<Option<Label>, ShippingError> {
        Ok(self.repository.active_for_order(order_id).await?)
    }

    /// Record a status observed outside this service (webhook, manual sync).
    ///
    /// Re-applying the current status is a no-op.
    ///
    /// # Errors
    ///
    /// - [`ShippingError::LabelNotFound`] for an unknown id
    /// - [`ShippingError::InvalidStateTransition`] if the state machine forbids it
    #[instrument(skip(self), fields(label_id = %label_id, status = %status))]
    pub async fn apply_tracking_update(
        &self,
        label_id: &LabelId,
        status: LabelStatus,
    ) -> Result<Label, ShippingError> {
        let label = self.load(label_id).await?;
        if label.status == status {
            return Ok(label);
        }
        ensure_transition(label.status, status)?;
        self.transition(&label, status, None).await
    }

    /// Ask the carrier for the current tracking status and record it.
    ///
    /// A label reported as delivered while still `Purchased` passes through
    /// `InTransit`. Carrier statuses without a local equivalent leave the label
    /// unchanged.
    ///
    /// # Errors
    ///
    /// - [`ShippingError::LabelNotFound`] for an unknown id
    /// - [`ShippingError::Decode`] if the carrier omits the label
    /// - any client error
    #[instrument(skip(self), fields(label_id = %label_id))]
    pub async fn sync_tracking(&self, label_id: &LabelId) -> Result<Label, ShippingError> {
        let mut label = self.load(label_id).await?;
        if label.status.is_terminal() {
            return Ok(label);
        }

        let response: TrackingResponse = self
            .client
            .post(
                TRACKING_PATH,
                &TrackingRequest {
                    orders: [label_id.as_str()],
                },
            )
            .await?;
        let entry = response.get(label_id.as_str()).ok_or_else(|| {
            ShippingError::Decode(format!("tracking response has no entry for {label_id}"))
        })?;

        let Some(target) = carrier_status(&entry.status) else {
            return Ok(label);
        };
        let tracking_code = entry.tracking.as_deref().filter(|t| !t.trim().is_empty());

        if target == LabelStatus::Delivered && label.status == LabelStatus::Purchased {
            label = self
                .transition(&label, LabelStatus::InTransit, tracking_code)
                .await?;
        }
        if label.status != target {
            ensure_transition(label.status, target)?;
            label = self.transition(&label, target, tracking_code).await?;
            info!(status = %label.status, "tracking status updated");
        }

        Ok(label)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn load(&self, label_id: &LabelId) -> Result<Label, ShippingError> {
        self.repository
            .get(label_id)
            .await?
            .ok_or_else(|| ShippingError::LabelNotFound(label_id.clone()))
    }

    /// Compare-and-set on the stored status.
    async fn transition(
        &self,
        label: &Label,
        to: LabelStatus,
        tracking_code: Option<&str>,
    ) -> Result<Label, ShippingError> {
        let now = self.clock.now();
        if let Some(updated) = self
            .repository
            .update_status(&label.id, label.status, to, tracking_code, now)
            .await?
        {
            return Ok(updated);
        }

        // Lost a race: report against the status that won.
        let current = self.load(&label.id).await?;
        Err(ShippingError::InvalidStateTransition {
            from: current.status,
            to,
        })
    }

    async fn cancel_at_carrier(&self, label_id: &LabelId) -> Result<(), ShippingError> {
        let request = CancelRequest {
            order: CancelOrder {
                id: label_id.as_str(),
                reason_id: CANCEL_REASON_ID,
                description: CANCEL_DESCRIPTION,
            },
        };
        let response: CancelResponse = self.client.post(CANCEL_PATH, &request).await?;

        match response.get(label_id.as_str()) {
            Some(outcome) if outcome.canceled => Ok(()),
            Some(_) => Err(ShippingError::CarrierRequest {
                status: 200,
                payload: format!("carrier refused to cancel label {label_id}"),
            }),
            None => Err(ShippingError::Decode(format!(
                "cancel response has no entry for {label_id}"
            ))),
        }
    }
}

const fn ensure_transition(from: LabelStatus, to: LabelStatus) -> Result<(), ShippingError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ShippingError::InvalidStateTransition { from, to })
    }
}

/// Local status for a carrier tracking status, if there is one.
fn carrier_status(status: &str) -> Option<LabelStatus> {
    match status {
        "posted" => Some(LabelStatus::InTransit),
        "delivered" => Some(LabelStatus::Delivered),
        _ => None,
    }
}

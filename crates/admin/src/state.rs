//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;

use crate::melhor_envio::Shipping;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    pool: PgPool,
    shipping: Shipping,
}

impl AppState {
    #[must_use]
    pub fn new(pool: PgPool, shipping: Shipping) -> Self {
        Self {
            inner: Arc::new(AppStateInner { pool, shipping }),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    /// Carrier services.
    #[must_use]
    pub fn shipping(&self) -> &Shipping {
        &self.inner.shipping
    }
}

use std::sync::Arc;

use crate::{BudgetStore, TenantKey, ThrottleBudgetError};

/// Hands concurrency slots back after admitted work completes.
///
/// The counter is incremented by admissions only. It expires
/// [`CONCURRENCY_TTL_SECONDS`](crate::CONCURRENCY_TTL_SECONDS) after the last admission, so a
/// caller that crashes before releasing inflates the margin for a bounded time only.
pub struct ConcurrencyTracker<S> {
    store: Arc<S>,
}

impl<S> Clone for ConcurrencyTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: BudgetStore> ConcurrencyTracker<S> {
    pub(crate) fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Decrement the tenant's counter, never below zero.
    ///
    /// Safe to call without a matching admission. Returns the counter after the release.
    pub async fn release(&self, tenant: &TenantKey) -> Result<u64, ThrottleBudgetError> {
        let concurrency = self.store.release(tenant).await.inspect_err(|err| {
            tracing::error!(tenant = %tenant, error = ?err, "concurrency.release.error");
        })?;

        tracing::debug!(tenant = %tenant, concurrency, "concurrency.release");

        Ok(concurrency)
    }
}

use std::sync::Arc;

use crate::{BudgetStore, TenantKey, ThrottleBudgetError, ThrottleSnapshot};

/// Feeds ground-truth throttle state back into a tenant's budget.
///
/// A synced snapshot overrides the tenant's capacity, restore rate and consumed tokens for
/// every decision made in the next
/// [`THROTTLE_SNAPSHOT_TTL_SECONDS`](crate::THROTTLE_SNAPSHOT_TTL_SECONDS). Snapshots are not
/// merged; the last writer wins.
pub struct ThrottleSyncAdapter<S> {
    store: Arc<S>,
}

impl<S> Clone for ThrottleSyncAdapter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: BudgetStore> ThrottleSyncAdapter<S> {
    pub(crate) fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Validate and store `snapshot` for `tenant`.
    ///
    /// Fails with [`ThrottleBudgetError::InvalidThrottleSnapshot`] without writing anything
    /// if a field is out of range.
    pub async fn sync(
        &self,
        tenant: &TenantKey,
        snapshot: &ThrottleSnapshot,
    ) -> Result<(), ThrottleBudgetError> {
        snapshot.validate()?;

        self.store.sync(tenant, snapshot).await.inspect_err(|err| {
            tracing::error!(tenant = %tenant, error = ?err, "throttle_sync.sync.error");
        })?;

        tracing::debug!(
            tenant = %tenant,
            maximum_available = snapshot.maximum_available,
            currently_available = snapshot.currently_available,
            restore_rate = snapshot.restore_rate,
            "throttle_sync.sync"
        );

        Ok(())
    }
}

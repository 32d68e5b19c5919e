//! Top-level entrypoint that wires the components around one store.
//!
//! [`ThrottleBudget`] owns a [`BudgetStore`] and hands out the admission controller,
//! concurrency tracker, throttle sync adapter and debug sink that all operate on it.

use std::sync::Arc;

use crate::{
    AdmissionController, BudgetSnapshot, BudgetStore, ConcurrencyTracker, DEBUG_LOG_CAPACITY,
    DebugSink, TenantKey, ThrottleBudgetError, ThrottleSyncAdapter,
};

/// Top-level configuration for [`ThrottleBudget`].
#[derive(Clone, Debug)]
pub struct ThrottleBudgetOptions {
    /// Traces kept by the debug sink, clamped to `1..=DEBUG_LOG_CAPACITY`.
    pub debug_log_capacity: usize,
}

impl Default for ThrottleBudgetOptions {
    fn default() -> Self {
        Self {
            debug_log_capacity: DEBUG_LOG_CAPACITY,
        }
    }
}

/// Admission control entrypoint.
///
/// The store is injected rather than global, so several independent budgets (or a test
/// double) can coexist in one process.
///
/// # Examples
///
/// ```ignore
/// use throttle_budget::{
///     RateLimitConfig, RedisBudgetStore, RedisBudgetStoreOptions, TenantKey, ThrottleBudget,
///     ThrottleSnapshot,
/// };
///
/// let client = redis::Client::open("redis://127.0.0.1:6379/")?;
/// let connection_manager = client.get_connection_manager().await?;
///
/// let budget = ThrottleBudget::new(RedisBudgetStore::new(RedisBudgetStoreOptions {
///     connection_manager,
///     prefix: None,
/// }));
///
/// let tenant = TenantKey::try_from("shop.example.com")?;
/// let config = RateLimitConfig::new(2000.0, 100.0);
///
/// let decision = budget.admission().decide(&tenant, 50.0, &config).await?;
/// if decision.allowed {
///     let throttle = call_remote_api().await;
///     budget.concurrency().release(&tenant).await?;
///
///     budget
///         .throttle_sync()
///         .sync(&tenant, &ThrottleSnapshot::new(2000.0, throttle.available, 100.0))
///         .await?;
/// } else {
///     sleep(decision.retry_after()).await;
/// }
/// ```
pub struct ThrottleBudget<S> {
    store: Arc<S>,
    admission: AdmissionController<S>,
    concurrency: ConcurrencyTracker<S>,
    throttle_sync: ThrottleSyncAdapter<S>,
    debug_sink: Arc<DebugSink>,
}

impl<S: BudgetStore> ThrottleBudget<S> {
    /// Create a [`ThrottleBudget`] with default options.
    pub fn new(store: S) -> Self {
        Self::with_options(store, ThrottleBudgetOptions::default())
    }

    /// Create a [`ThrottleBudget`] with explicit options.
    pub fn with_options(store: S, options: ThrottleBudgetOptions) -> Self {
        Self::from_shared(Arc::new(store), options)
    }

    /// Create a [`ThrottleBudget`] over a store that is also used elsewhere.
    pub fn from_shared(store: Arc<S>, options: ThrottleBudgetOptions) -> Self {
        let debug_sink = Arc::new(DebugSink::new(options.debug_log_capacity));

        Self {
            admission: AdmissionController::new(store.clone(), debug_sink.clone()),
            concurrency: ConcurrencyTracker::new(store.clone()),
            throttle_sync: ThrottleSyncAdapter::new(store.clone()),
            debug_sink,
            store,
        }
    }

    /// Access the admission controller.
    pub fn admission(&self) -> &AdmissionController<S> {
        &self.admission
    }

    /// Access the concurrency tracker.
    pub fn concurrency(&self) -> &ConcurrencyTracker<S> {
        &self.concurrency
    }

    /// Access the throttle sync adapter.
    pub fn throttle_sync(&self) -> &ThrottleSyncAdapter<S> {
        &self.throttle_sync
    }

    /// Access the debug sink.
    pub fn debug_sink(&self) -> &DebugSink {
        &self.debug_sink
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Delete the tenant's budget, concurrency counter and throttle snapshot.
    ///
    /// Idempotent. Meant for test teardown and tenant offboarding.
    pub async fn cleanup(&self, tenant: &TenantKey) -> Result<(), ThrottleBudgetError> {
        self.store.cleanup(tenant).await.inspect_err(|err| {
            tracing::error!(tenant = %tenant, error = ?err, "throttle_budget.cleanup.error");
        })?;

        tracing::debug!(tenant = %tenant, "throttle_budget.cleanup");

        Ok(())
    }

    /// Read the tenant's raw stored state without decaying or changing it.
    pub async fn peek(&self, tenant: &TenantKey) -> Result<BudgetSnapshot, ThrottleBudgetError> {
        self.store.peek(tenant).await
    }
}

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    BudgetSnapshot, BudgetStore, BudgetView, CONCURRENCY_TTL_SECONDS, Clock, Evaluation,
    RateLimitConfig, StoredSnapshot, SystemClock, THROTTLE_SNAPSHOT_TTL_SECONDS, TenantKey,
    ThrottleBudgetError, ThrottleSnapshot, evaluate,
};

/// Configuration for [`LocalBudgetStore`].
#[derive(Clone, Debug)]
pub struct LocalBudgetStoreOptions {
    /// Clock used for decay and key expiry. Defaults to [`SystemClock`].
    pub clock: Arc<dyn Clock>,
}

impl Default for LocalBudgetStoreOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Clone, Debug)]
struct Expiring<T> {
    value: T,
    expires_at_ms: u64,
}

impl<T> Expiring<T> {
    fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

#[derive(Debug, Default)]
struct TenantState {
    consumed_tokens: Option<f64>,
    last_update_ms: Option<u64>,
    snapshot: Option<Expiring<String>>,
    concurrency: Option<Expiring<i64>>,
}

impl TenantState {
    fn purge_expired(&mut self, now_ms: u64) {
        if self.snapshot.as_ref().is_some_and(|s| !s.is_live(now_ms)) {
            self.snapshot = None;
        }

        if self.concurrency.as_ref().is_some_and(|c| !c.is_live(now_ms)) {
            self.concurrency = None;
        }
    }

    fn view(&self) -> BudgetView {
        BudgetView {
            consumed_tokens: self.consumed_tokens.unwrap_or(0f64),
            last_update_ms: self.last_update_ms,
            snapshot: StoredSnapshot::parse(self.snapshot.as_ref().map(|s| s.value.as_str())),
            concurrency: self.concurrency.as_ref().map_or(0, |c| c.value),
        }
    }
}

/// In-process [`BudgetStore`].
///
/// Per-tenant state lives in a [`DashMap`]. Each operation runs while holding the tenant's
/// entry, which makes it atomic with respect to every other operation on that tenant in this
/// process. Tenants on different shards proceed in parallel.
///
/// Expired throttle snapshots and concurrency counters are dropped lazily on access.
///
/// # Semantics & Limitations
///
/// - State is process scoped; use the Redis store to share a budget across machines
/// - Budget state is kept until [`cleanup`](BudgetStore::cleanup), so memory grows with the
///   number of distinct tenants
///
/// # Examples
///
/// ```
/// use throttle_budget::{LocalBudgetStore, RateLimitConfig, TenantKey, ThrottleBudget};
///
/// # futures::executor::block_on(async {
/// let budget = ThrottleBudget::new(LocalBudgetStore::default());
/// let tenant = TenantKey::try_from("shop.example.com").unwrap();
/// let config = RateLimitConfig::new(2000.0, 100.0);
///
/// let decision = budget.admission().decide(&tenant, 50.0, &config).await.unwrap();
/// assert!(decision.allowed);
///
/// budget.concurrency().release(&tenant).await.unwrap();
/// # });
/// ```
#[derive(Debug)]
pub struct LocalBudgetStore {
    clock: Arc<dyn Clock>,
    tenants: DashMap<TenantKey, TenantState>,
}

impl Default for LocalBudgetStore {
    fn default() -> Self {
        Self::new(LocalBudgetStoreOptions::default())
    }
}

impl LocalBudgetStore {
    /// Create an empty store.
    pub fn new(options: LocalBudgetStoreOptions) -> Self {
        Self {
            clock: options.clock,
            tenants: DashMap::new(),
        }
    } // end constructor

    /// Number of tenants currently holding state.
    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    #[cfg(test)]
    pub(crate) fn write_raw_snapshot(&self, tenant: &TenantKey, raw: &str) {
        let now_ms = self.clock.now_ms();
        let mut state = self.tenants.entry(tenant.clone()).or_default();
        state.snapshot = Some(Expiring {
            value: raw.to_string(),
            expires_at_ms: now_ms + THROTTLE_SNAPSHOT_TTL_SECONDS * 1000,
        });
    }

    #[cfg(test)]
    pub(crate) fn write_concurrency(&self, tenant: &TenantKey, value: i64) {
        let now_ms = self.clock.now_ms();
        let mut state = self.tenants.entry(tenant.clone()).or_default();
        state.concurrency = Some(Expiring {
            value,
            expires_at_ms: now_ms + CONCURRENCY_TTL_SECONDS * 1000,
        });
    }
}

impl BudgetStore for LocalBudgetStore {
    async fn decide(
        &self,
        tenant: &TenantKey,
        cost: f64,
        config: &RateLimitConfig,
    ) -> Result<Evaluation, ThrottleBudgetError> {
        let mut state = self.tenants.entry(tenant.clone()).or_default();
        let now_ms = self.clock.now_ms();

        state.purge_expired(now_ms);
        let evaluation = evaluate(tenant, cost, config, &state.view(), now_ms);

        if let Some(committed_tokens) = evaluation.committed_tokens() {
            state.consumed_tokens = Some(committed_tokens);
            state.last_update_ms = Some(now_ms);
            state.concurrency = Some(Expiring {
                value: evaluation.trace.effective_concurrency as i64,
                expires_at_ms: now_ms + CONCURRENCY_TTL_SECONDS * 1000,
            });
        } else if let Some(counter) = state.concurrency.as_mut() {
            counter.value = counter.value.max(0);
        }

        Ok(evaluation)
    }

    async fn release(&self, tenant: &TenantKey) -> Result<u64, ThrottleBudgetError> {
        let Some(mut state) = self.tenants.get_mut(tenant) else {
            return Ok(0);
        };

        let now_ms = self.clock.now_ms();
        state.purge_expired(now_ms);

        let Some(counter) = state.concurrency.as_mut() else {
            return Ok(0);
        };

        // Release does not refresh the expiry.
        counter.value = (counter.value - 1).max(0);

        Ok(counter.value as u64)
    }

    async fn sync(
        &self,
        tenant: &TenantKey,
        snapshot: &ThrottleSnapshot,
    ) -> Result<(), ThrottleBudgetError> {
        let raw = snapshot.to_json()?;

        let mut state = self.tenants.entry(tenant.clone()).or_default();
        let now_ms = self.clock.now_ms();

        state.snapshot = Some(Expiring {
            value: raw,
            expires_at_ms: now_ms + THROTTLE_SNAPSHOT_TTL_SECONDS * 1000,
        });

        Ok(())
    }

    async fn cleanup(&self, tenant: &TenantKey) -> Result<(), ThrottleBudgetError> {
        self.tenants.remove(tenant);
        Ok(())
    }

    async fn peek(&self, tenant: &TenantKey) -> Result<BudgetSnapshot, ThrottleBudgetError> {
        let Some(state) = self.tenants.get(tenant) else {
            return Ok(BudgetSnapshot {
                consumed_tokens: 0f64,
                last_update_ms: None,
                concurrency: 0,
                snapshot: StoredSnapshot::Absent,
            });
        };

        let now_ms = self.clock.now_ms();
        let snapshot = state
            .snapshot
            .as_ref()
            .filter(|s| s.is_live(now_ms))
            .map(|s| s.value.as_str());

        Ok(BudgetSnapshot {
            consumed_tokens: state.consumed_tokens.unwrap_or(0f64),
            last_update_ms: state.last_update_ms,
            concurrency: state
                .concurrency
                .as_ref()
                .filter(|c| c.is_live(now_ms))
                .map_or(0, |c| c.value),
            snapshot: StoredSnapshot::parse(snapshot),
        })
    }
}

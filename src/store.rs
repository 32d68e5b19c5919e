use std::future::Future;

use crate::{Evaluation, RateLimitConfig, StoredSnapshot, TenantKey, ThrottleBudgetError, ThrottleSnapshot};

/// Raw per-tenant state, read without decay or mutation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BudgetSnapshot {
    /// Stored consumed tokens (0 when absent).
    pub consumed_tokens: f64,
    /// Stored last update timestamp.
    pub last_update_ms: Option<u64>,
    /// Live concurrency counter (0 when absent or expired).
    pub concurrency: i64,
    /// The live throttle snapshot.
    pub snapshot: StoredSnapshot,
}

/// The atomic execution environment holding per-tenant budget state.
///
/// Every method is one indivisible operation against the tenant's state: `decide` loads the
/// state, evaluates it with the store's own clock and writes the outcome without any other
/// `decide` or `release` for that tenant interleaving. Different tenants share nothing.
///
/// Implementations never retry: a failed call is surfaced as-is and its outcome is unknown
/// to the caller.
pub trait BudgetStore: Send + Sync {
    /// Run the admission procedure for `tenant` and persist an admission.
    ///
    /// `config` and `cost` have already been validated.
    fn decide(
        &self,
        tenant: &TenantKey,
        cost: f64,
        config: &RateLimitConfig,
    ) -> impl Future<Output = Result<Evaluation, ThrottleBudgetError>> + Send;

    /// Floor-protected decrement of the concurrency counter. Returns the new value.
    fn release(
        &self,
        tenant: &TenantKey,
    ) -> impl Future<Output = Result<u64, ThrottleBudgetError>> + Send;

    /// Replace the tenant's throttle snapshot, expiring after
    /// [`THROTTLE_SNAPSHOT_TTL_SECONDS`](crate::THROTTLE_SNAPSHOT_TTL_SECONDS).
    ///
    /// `snapshot` has already been validated.
    fn sync(
        &self,
        tenant: &TenantKey,
        snapshot: &ThrottleSnapshot,
    ) -> impl Future<Output = Result<(), ThrottleBudgetError>> + Send;

    /// Delete every piece of state held for `tenant`.
    fn cleanup(
        &self,
        tenant: &TenantKey,
    ) -> impl Future<Output = Result<(), ThrottleBudgetError>> + Send;

    /// Read the tenant's raw state.
    fn peek(
        &self,
        tenant: &TenantKey,
    ) -> impl Future<Output = Result<BudgetSnapshot, ThrottleBudgetError>> + Send;
}

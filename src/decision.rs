//! The admission decision as a pure function of stored state, config and the store clock.
//!
//! [`evaluate`] is what [`LocalBudgetStore`](crate::LocalBudgetStore) runs while holding a
//! tenant's entry, and the Redis decide script is a line-for-line Lua rendition of it. Both
//! evaluate the same floating point expressions in the same order, so a given state produces
//! bit-identical decisions on either backend.
//!
//! # Algorithm
//!
//! 1. **Override:** a valid throttle snapshot replaces capacity, rate and consumed tokens
//! 2. **Decay:** `consumed -= elapsed_seconds × tokens_per_second`, floored at 0
//! 3. **Margins:** below 30% capacity the margins scale up by `1 + (30 − pct)/30`, and below
//!    10% by a further `1.5`
//! 4. **Safety margin:** `base_margin + min(max_concurrency, concurrency) × multiplier`
//! 5. **Adjusted cost:** `cost × capacity_factor × (1 + concurrency / max_concurrency)`
//! 6. **Decision:** admit if `consumed + adjusted_cost <= capacity − safety_margin`

use crate::{AdmissionDecision, RateLimitConfig, SnapshotStatus, StoredSnapshot, TenantKey};

const LOW_CAPACITY_PCT: f64 = 30.0;
const CRITICAL_CAPACITY_PCT: f64 = 10.0;
const CRITICAL_MARGIN_SCALE: f64 = 1.5;

/// Tenant state as loaded at the start of an atomic execution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BudgetView {
    /// Stored consumed tokens, before decay.
    pub consumed_tokens: f64,
    /// Last decay/consumption timestamp. `None` for a fresh tenant.
    pub last_update_ms: Option<u64>,
    /// The tenant's throttle snapshot.
    pub snapshot: StoredSnapshot,
    /// Stored concurrency counter. Negative values are repaired to 0.
    pub concurrency: i64,
}

impl BudgetView {
    /// State of a tenant that has never been seen.
    pub fn fresh() -> Self {
        Self {
            consumed_tokens: 0f64,
            last_update_ms: None,
            snapshot: StoredSnapshot::Absent,
            concurrency: 0,
        }
    }
}

/// Everything that went into a decision.
#[derive(Clone, Debug, PartialEq)]
pub struct DecisionTrace {
    /// Tenant the decision was made for.
    pub tenant: TenantKey,
    /// Store clock reading used for decay.
    pub now_ms: u64,
    /// Nominal cost requested by the caller.
    pub cost: f64,
    /// Whether a throttle snapshot drove the decision.
    pub snapshot: SnapshotStatus,
    /// Whether a negative concurrency counter was clamped to 0.
    pub counter_repaired: bool,
    /// Bucket capacity after any snapshot override.
    pub bucket_capacity: f64,
    /// Decay rate after any snapshot override.
    pub tokens_per_second: f64,
    /// Consumed tokens after decay, before this request.
    pub consumed_tokens: f64,
    /// Stored counter plus the request being decided.
    pub effective_concurrency: u64,
    /// Share of the bucket still free, in percent.
    pub capacity_pct: f64,
    /// `base_margin` after low-capacity scaling.
    pub base_margin: f64,
    /// `concurrency_multiplier` after low-capacity scaling.
    pub concurrency_multiplier: f64,
    /// Tokens withheld from the bucket.
    pub safety_margin: f64,
    /// Admission threshold, `bucket_capacity - safety_margin`.
    pub effective_capacity: f64,
    /// Cost inflation from low remaining capacity.
    pub capacity_factor: f64,
    /// Cost inflation from concurrency.
    pub concurrency_factor: f64,
    /// Cost actually charged if admitted.
    pub adjusted_cost: f64,
    /// The outcome.
    pub decision: AdmissionDecision,
}

/// The result of one atomic decide execution.
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    /// The verdict returned to the caller.
    pub decision: AdmissionDecision,
    /// The inputs and intermediate values behind it.
    pub trace: DecisionTrace,
}

impl Evaluation {
    /// Consumed tokens to persist when the request was admitted.
    pub fn committed_tokens(&self) -> Option<f64> {
        self.decision
            .allowed
            .then(|| self.trace.consumed_tokens + self.trace.adjusted_cost)
    }
}

/// Run the admission procedure against `view` at store time `now_ms`.
///
/// Deterministic: the same inputs always produce the same [`Evaluation`]. The caller is
/// responsible for persisting the outcome (see [`Evaluation::committed_tokens`]) inside the
/// same atomic execution that loaded `view`.
pub fn evaluate(
    tenant: &TenantKey,
    cost: f64,
    config: &RateLimitConfig,
    view: &BudgetView,
    now_ms: u64,
) -> Evaluation {
    let mut bucket_capacity = config.bucket_capacity;
    let mut tokens_per_second = config.tokens_per_second;
    let mut consumed_tokens = view.consumed_tokens;

    if let StoredSnapshot::Valid(snapshot) = view.snapshot {
        consumed_tokens = snapshot.consumed_tokens();
        tokens_per_second = snapshot.restore_rate;
        bucket_capacity = snapshot.maximum_available;
    }

    // A clock that stepped backwards must not add tokens.
    let last_update_ms = view.last_update_ms.unwrap_or(now_ms);
    let elapsed_seconds = now_ms.saturating_sub(last_update_ms) as f64 / 1000f64;
    consumed_tokens = (consumed_tokens - elapsed_seconds * tokens_per_second).max(0f64);

    let counter_repaired = view.concurrency < 0;
    let effective_concurrency = view.concurrency.max(0) as u64 + 1;

    let capacity_pct = 100f64 * (bucket_capacity - consumed_tokens) / bucket_capacity;

    let mut base_margin = config.base_margin;
    let mut concurrency_multiplier = config.concurrency_multiplier;

    if capacity_pct < LOW_CAPACITY_PCT {
        let scale = 1f64 + (LOW_CAPACITY_PCT - capacity_pct) / LOW_CAPACITY_PCT;
        base_margin *= scale;
        concurrency_multiplier *= scale;

        if capacity_pct < CRITICAL_CAPACITY_PCT {
            base_margin *= CRITICAL_MARGIN_SCALE;
            concurrency_multiplier *= CRITICAL_MARGIN_SCALE;
        }
    }

    let max_concurrency = config.max_concurrency as f64;
    let counted_concurrency = max_concurrency.min(effective_concurrency as f64);
    let safety_margin = base_margin + counted_concurrency * concurrency_multiplier;
    let effective_capacity = bucket_capacity - safety_margin;

    let capacity_factor =
        1f64 + ((LOW_CAPACITY_PCT - capacity_pct) / LOW_CAPACITY_PCT).max(0f64);
    let concurrency_factor = 1f64 + effective_concurrency as f64 / max_concurrency;
    let adjusted_cost = cost * capacity_factor * concurrency_factor;

    let decision = if consumed_tokens + adjusted_cost <= effective_capacity {
        AdmissionDecision {
            allowed: true,
            wait_time_ms: 0,
            remaining: (effective_capacity - (consumed_tokens + adjusted_cost)).max(0f64),
        }
    } else {
        let tokens_needed = adjusted_cost + consumed_tokens - effective_capacity;
        let wait_time_ms = (tokens_needed / tokens_per_second
            * 1000f64
            * config.base_factor
            * capacity_factor)
            .ceil();

        AdmissionDecision {
            allowed: false,
            wait_time_ms: wait_time_ms as u64,
            remaining: (effective_capacity - consumed_tokens).max(0f64),
        }
    };

    Evaluation {
        decision,
        trace: DecisionTrace {
            tenant: tenant.clone(),
            now_ms,
            cost,
            snapshot: view.snapshot.status(),
            counter_repaired,
            bucket_capacity,
            tokens_per_second,
            consumed_tokens,
            effective_concurrency,
            capacity_pct,
            base_margin,
            concurrency_multiplier,
            safety_margin,
            effective_capacity,
            capacity_factor,
            concurrency_factor,
            adjusted_cost,
            decision,
        },
    }
}

use std::sync::Arc;

use crate::{
    AdmissionDecision, BudgetStore, DebugSink, Evaluation, RateLimitConfig, SnapshotStatus,
    TenantKey, ThrottleBudgetError,
};

/// Decides whether a unit of work may spend from a tenant's budget.
///
/// Every call is a single atomic execution against the [`BudgetStore`]; the controller adds
/// validation, logging and debug tracing around it. It never sleeps: a rejection carries an
/// advisory `wait_time_ms` and the caller picks its own backoff.
///
/// An admitted request holds a concurrency slot until it is handed back through
/// [`ConcurrencyTracker::release`](crate::ConcurrencyTracker::release).
pub struct AdmissionController<S> {
    store: Arc<S>,
    debug_sink: Arc<DebugSink>,
}

impl<S> Clone for AdmissionController<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            debug_sink: self.debug_sink.clone(),
        }
    }
}

impl<S: BudgetStore> AdmissionController<S> {
    pub(crate) fn new(store: Arc<S>, debug_sink: Arc<DebugSink>) -> Self {
        Self { store, debug_sink }
    }

    /// Check admission for `cost` tokens and, if allowed, charge the adjusted cost.
    ///
    /// Fails with [`ThrottleBudgetError::InvalidConfig`] or
    /// [`ThrottleBudgetError::InvalidCost`] before touching the store. Being throttled is a
    /// normal outcome with `allowed == false`, not an error.
    pub async fn decide(
        &self,
        tenant: &TenantKey,
        cost: f64,
        config: &RateLimitConfig,
    ) -> Result<AdmissionDecision, ThrottleBudgetError> {
        self.decide_with_trace(tenant, cost, config)
            .await
            .map(|evaluation| evaluation.decision)
    } // end method decide

    /// Same as [`decide`](Self::decide) but also returns the [`DecisionTrace`](crate::DecisionTrace).
    pub async fn decide_with_trace(
        &self,
        tenant: &TenantKey,
        cost: f64,
        config: &RateLimitConfig,
    ) -> Result<Evaluation, ThrottleBudgetError> {
        config.validate()?;

        if !(cost.is_finite() && cost >= 0f64) {
            return Err(ThrottleBudgetError::InvalidCost(format!(
                "Cost must be a finite number >= 0, got {cost}"
            )));
        }

        let evaluation = self
            .store
            .decide(tenant, cost, config)
            .await
            .inspect_err(|err| {
                tracing::error!(tenant = %tenant, error = ?err, "admission.decide.error");
            })?;

        let trace = &evaluation.trace;

        if trace.snapshot == SnapshotStatus::Ignored {
            tracing::warn!(
                tenant = %tenant,
                "admission.decide, malformed throttle snapshot ignored"
            );
        }

        if trace.counter_repaired {
            tracing::warn!(
                tenant = %tenant,
                "admission.decide, negative concurrency counter clamped to 0"
            );
        }

        tracing::debug!(
            tenant = %tenant,
            cost,
            allowed = evaluation.decision.allowed,
            wait_time_ms = evaluation.decision.wait_time_ms,
            remaining = evaluation.decision.remaining,
            "admission.decide"
        );

        if config.debug {
            tracing::trace!(trace = ?trace, "admission.decide.trace");
            self.debug_sink.record(trace.clone());
        }

        Ok(evaluation)
    } // end method decide_with_trace
}

use std::sync::Arc;

use super::runtime::block_on;
use crate::{
    LocalBudgetStore, LocalBudgetStoreOptions, ManualClock, RateLimitConfig, SnapshotStatus,
    StoredSnapshot, TenantKey, ThrottleBudget, ThrottleSnapshot,
};

const START_MS: u64 = 1_700_000_000_000;

fn budget() -> (ThrottleBudget<LocalBudgetStore>, ManualClock) {
    let clock = ManualClock::new(START_MS);
    let store = LocalBudgetStore::new(LocalBudgetStoreOptions {
        clock: Arc::new(clock.clone()),
    });

    (ThrottleBudget::new(store), clock)
}

fn key(s: &str) -> TenantKey {
    TenantKey::try_from(s).unwrap()
}

fn config() -> RateLimitConfig {
    RateLimitConfig::new(2000f64, 100f64)
}

#[test]
fn fresh_tenant_is_admitted_and_charged_adjusted_cost() {
    let (budget, _clock) = budget();
    let tenant = key("shop.example.com");

    block_on(async {
        let decision = budget.admission().decide(&tenant, 50f64, &config()).await.unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.wait_time_ms, 0);
        assert_eq!(decision.remaining, 1860f64);

        let state = budget.peek(&tenant).await.unwrap();
        assert_eq!(state.consumed_tokens, 60f64);
        assert_eq!(state.last_update_ms, Some(START_MS));
        assert_eq!(state.concurrency, 1);
        assert_eq!(state.snapshot, StoredSnapshot::Absent);
    });
}

#[test]
fn second_request_at_same_instant_sees_first() {
    let (budget, _clock) = budget();
    let tenant = key("shop.example.com");

    block_on(async {
        assert!(budget.admission().decide(&tenant, 50f64, &config()).await.unwrap().allowed);

        let decision = budget
            .admission()
            .decide(&tenant, 1900f64, &config())
            .await
            .unwrap();

        assert!(!decision.allowed);
        assert_eq!(decision.wait_time_ms, 8910);
        assert_eq!(decision.remaining, 1850f64);

        // Rejection leaves the stored state untouched.
        let state = budget.peek(&tenant).await.unwrap();
        assert_eq!(state.consumed_tokens, 60f64);
        assert_eq!(state.concurrency, 1);
    });
}

#[test]
fn rejection_does_not_increment_concurrency() {
    let (budget, _clock) = budget();
    let tenant = key("shop.example.com");

    block_on(async {
        let decision = budget
            .admission()
            .decide(&tenant, 5000f64, &config())
            .await
            .unwrap();

        assert!(!decision.allowed);
        assert_eq!(decision.wait_time_ms, 44880);
        assert_eq!(decision.remaining, 1920f64);

        let state = budget.peek(&tenant).await.unwrap();
        assert_eq!(state.concurrency, 0);
        assert_eq!(state.consumed_tokens, 0f64);
        assert_eq!(state.last_update_ms, None);
    });
}

#[test]
fn synced_snapshot_drives_decision() {
    let (budget, _clock) = budget();
    let tenant = key("shop.example.com");

    block_on(async {
        budget
            .throttle_sync()
            .sync(&tenant, &ThrottleSnapshot::new(2000f64, 100f64, 100f64))
            .await
            .unwrap();

        let evaluation = budget
            .admission()
            .decide_with_trace(&tenant, 150f64, &config())
            .await
            .unwrap();

        assert_eq!(evaluation.trace.snapshot, SnapshotStatus::Applied);
        assert!(!evaluation.decision.allowed);
        assert_eq!(evaluation.decision.wait_time_ms, 9075);
        assert_eq!(evaluation.decision.remaining, 0f64);
    });
}

#[test]
fn snapshot_expires_after_ttl() {
    let (budget, clock) = budget();
    let tenant = key("shop.example.com");

    block_on(async {
        budget
            .throttle_sync()
            .sync(&tenant, &ThrottleSnapshot::new(2000f64, 100f64, 100f64))
            .await
            .unwrap();

        clock.advance_ms(9_999);
        assert!(matches!(
            budget.peek(&tenant).await.unwrap().snapshot,
            StoredSnapshot::Valid(_)
        ));

        clock.advance_ms(1);
        assert_eq!(budget.peek(&tenant).await.unwrap().snapshot, StoredSnapshot::Absent);

        let evaluation = budget
            .admission()
            .decide_with_trace(&tenant, 50f64, &config())
            .await
            .unwrap();

        assert_eq!(evaluation.trace.snapshot, SnapshotStatus::Absent);
        assert_eq!(evaluation.decision.remaining, 1860f64);
    });
}

#[test]
fn later_sync_replaces_earlier_one() {
    let (budget, _clock) = budget();
    let tenant = key("shop.example.com");

    block_on(async {
        let sync = budget.throttle_sync();
        sync.sync(&tenant, &ThrottleSnapshot::new(2000f64, 100f64, 100f64))
            .await
            .unwrap();
        sync.sync(&tenant, &ThrottleSnapshot::new(2000f64, 2000f64, 100f64))
            .await
            .unwrap();

        assert_eq!(
            budget.peek(&tenant).await.unwrap().snapshot,
            StoredSnapshot::Valid(ThrottleSnapshot::new(2000f64, 2000f64, 100f64))
        );
    });
}

#[test]
fn malformed_snapshot_is_ignored() {
    let (budget, _clock) = budget();
    let tenant = key("shop.example.com");

    budget
        .store()
        .write_raw_snapshot(&tenant, r#"{"maximumAvailable":"lots"}"#);

    block_on(async {
        let evaluation = budget
            .admission()
            .decide_with_trace(&tenant, 50f64, &config())
            .await
            .unwrap();

        assert_eq!(evaluation.trace.snapshot, SnapshotStatus::Ignored);
        assert!(evaluation.decision.allowed);
        assert_eq!(evaluation.decision.remaining, 1860f64);
    });
}

#[test]
fn cleanup_resets_tenant() {
    let (budget, _clock) = budget();
    let tenant = key("shop.example.com");

    block_on(async {
        budget.admission().decide(&tenant, 50f64, &config()).await.unwrap();
        budget
            .throttle_sync()
            .sync(&tenant, &ThrottleSnapshot::new(2000f64, 100f64, 100f64))
            .await
            .unwrap();

        budget.cleanup(&tenant).await.unwrap();
        assert_eq!(budget.store().tenant_count(), 0);

        // Idempotent.
        budget.cleanup(&tenant).await.unwrap();

        let decision = budget.admission().decide(&tenant, 50f64, &config()).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1860f64);
    });
}

#[test]
fn release_decrements_and_floors_at_zero() {
    let (budget, _clock) = budget();
    let tenant = key("shop.example.com");

    block_on(async {
        // Unknown tenant: no-op.
        assert_eq!(budget.concurrency().release(&tenant).await.unwrap(), 0);
        assert_eq!(budget.store().tenant_count(), 0);

        budget.admission().decide(&tenant, 10f64, &config()).await.unwrap();
        budget.admission().decide(&tenant, 10f64, &config()).await.unwrap();
        assert_eq!(budget.peek(&tenant).await.unwrap().concurrency, 2);

        assert_eq!(budget.concurrency().release(&tenant).await.unwrap(), 1);
        assert_eq!(budget.concurrency().release(&tenant).await.unwrap(), 0);
        assert_eq!(budget.concurrency().release(&tenant).await.unwrap(), 0);
        assert_eq!(budget.peek(&tenant).await.unwrap().concurrency, 0);
    });
}

#[test]
fn concurrency_counter_expires_after_last_admission() {
    let (budget, clock) = budget();
    let tenant = key("shop.example.com");

    block_on(async {
        budget.admission().decide(&tenant, 10f64, &config()).await.unwrap();
        budget.admission().decide(&tenant, 10f64, &config()).await.unwrap();

        // Release does not push the expiry out.
        clock.advance_ms(5_000);
        assert_eq!(budget.concurrency().release(&tenant).await.unwrap(), 1);

        clock.advance_ms(5_000);
        assert_eq!(budget.peek(&tenant).await.unwrap().concurrency, 0);

        let evaluation = budget
            .admission()
            .decide_with_trace(&tenant, 10f64, &config())
            .await
            .unwrap();
        assert_eq!(evaluation.trace.effective_concurrency, 1);
    });
}

#[test]
fn admission_refreshes_concurrency_expiry() {
    let (budget, clock) = budget();
    let tenant = key("shop.example.com");

    block_on(async {
        budget.admission().decide(&tenant, 10f64, &config()).await.unwrap();

        clock.advance_ms(8_000);
        budget.admission().decide(&tenant, 10f64, &config()).await.unwrap();

        clock.advance_ms(8_000);
        assert_eq!(budget.peek(&tenant).await.unwrap().concurrency, 2);
    });
}

#[test]
fn negative_counter_is_repaired() {
    let (budget, _clock) = budget();
    let tenant = key("shop.example.com");
    budget.store().write_concurrency(&tenant, -4);

    block_on(async {
        // Rejected: the repair still sticks.
        let evaluation = budget
            .admission()
            .decide_with_trace(&tenant, 5000f64, &config())
            .await
            .unwrap();
        assert!(evaluation.trace.counter_repaired);
        assert!(!evaluation.decision.allowed);
        assert_eq!(budget.peek(&tenant).await.unwrap().concurrency, 0);

        budget.store().write_concurrency(&tenant, -4);

        let evaluation = budget
            .admission()
            .decide_with_trace(&tenant, 50f64, &config())
            .await
            .unwrap();
        assert!(evaluation.trace.counter_repaired);
        assert_eq!(evaluation.decision.remaining, 1860f64);
        assert_eq!(budget.peek(&tenant).await.unwrap().concurrency, 1);
    });
}

#[test]
fn consumed_tokens_decay_on_store_clock() {
    let (budget, clock) = budget();
    let tenant = key("shop.example.com");

    block_on(async {
        // Charges 1000 * 1.2 = 1200.
        assert!(budget.admission().decide(&tenant, 1000f64, &config()).await.unwrap().allowed);
        budget.concurrency().release(&tenant).await.unwrap();

        clock.advance_ms(2_000);
        let evaluation = budget
            .admission()
            .decide_with_trace(&tenant, 0f64, &config())
            .await
            .unwrap();
        assert_eq!(evaluation.trace.consumed_tokens, 1000f64);

        clock.advance_ms(60_000);
        let evaluation = budget
            .admission()
            .decide_with_trace(&tenant, 0f64, &config())
            .await
            .unwrap();
        assert_eq!(evaluation.trace.consumed_tokens, 0f64);
    });
}

#[test]
fn rejected_tenant_recovers_after_wait() {
    let (budget, clock) = budget();
    let tenant = key("shop.example.com");

    block_on(async {
        assert!(budget.admission().decide(&tenant, 1500f64, &config()).await.unwrap().allowed);
        budget.concurrency().release(&tenant).await.unwrap();

        let decision = budget.admission().decide(&tenant, 500f64, &config()).await.unwrap();
        assert!(!decision.allowed);

        clock.advance_ms(decision.wait_time_ms);
        let decision = budget.admission().decide(&tenant, 500f64, &config()).await.unwrap();
        assert!(decision.allowed);
    });
}

#[test]
fn tenants_are_isolated() {
    let (budget, _clock) = budget();
    let a = key("a.example.com");
    let b = key("b.example.com");

    block_on(async {
        budget.admission().decide(&a, 1500f64, &config()).await.unwrap();
        budget
            .throttle_sync()
            .sync(&a, &ThrottleSnapshot::new(2000f64, 0f64, 100f64))
            .await
            .unwrap();

        let decision = budget.admission().decide(&b, 50f64, &config()).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1860f64);

        let state = budget.peek(&b).await.unwrap();
        assert_eq!(state.consumed_tokens, 60f64);
        assert_eq!(state.concurrency, 1);
        assert_eq!(state.snapshot, StoredSnapshot::Absent);
    });
}

#[test]
fn host_port_tenant_is_a_separate_tenant() {
    let (budget, _clock) = budget();
    let with_port = key("shop.example.com:443");
    let without_port = key("shop.example.com");

    block_on(async {
        let decision = budget
            .admission()
            .decide(&with_port, 50f64, &config())
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1860f64);

        assert_eq!(budget.peek(&with_port).await.unwrap().concurrency, 1);
        assert_eq!(budget.peek(&without_port).await.unwrap().concurrency, 0);
    });
}

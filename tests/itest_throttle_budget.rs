use std::sync::Arc;

use futures::executor::block_on;

use throttle_budget::{
    BudgetStore, LocalBudgetStore, LocalBudgetStoreOptions, ManualClock, RateLimitConfig,
    SnapshotStatus, TenantKey, ThrottleBudget, ThrottleSnapshot,
};

fn key(s: &str) -> TenantKey {
    TenantKey::try_from(s).unwrap()
}

/// Walk one tenant through admit, reject, release, sync and cleanup against any store.
async fn run_lifecycle<S: BudgetStore>(budget: &ThrottleBudget<S>, tenant: &TenantKey) {
    let config = RateLimitConfig::new(2000f64, 100f64);

    let decision = budget.admission().decide(tenant, 50f64, &config).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 1860f64);

    let decision = budget.admission().decide(tenant, 5000f64, &config).await.unwrap();
    assert!(!decision.allowed);
    assert!(decision.retry_after().as_millis() > 0);

    assert_eq!(budget.concurrency().release(tenant).await.unwrap(), 0);

    budget
        .throttle_sync()
        .sync(tenant, &ThrottleSnapshot::new(2000f64, 100f64, 100f64))
        .await
        .unwrap();

    let evaluation = budget
        .admission()
        .decide_with_trace(tenant, 150f64, &config)
        .await
        .unwrap();
    assert_eq!(evaluation.trace.snapshot, SnapshotStatus::Applied);
    assert!(!evaluation.decision.allowed);
    // 9075 at the instant of the first admission; a live clock decays it a little.
    assert!(evaluation.decision.wait_time_ms <= 9075);
    assert!(evaluation.decision.wait_time_ms > 9000);

    budget.cleanup(tenant).await.unwrap();

    let decision = budget.admission().decide(tenant, 50f64, &config).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 1860f64);

    budget.cleanup(tenant).await.unwrap();
}

#[test]
fn local_lifecycle() {
    let budget = ThrottleBudget::new(LocalBudgetStore::new(LocalBudgetStoreOptions {
        clock: Arc::new(ManualClock::new(1_700_000_000_000)),
    }));

    block_on(run_lifecycle(&budget, &key("shop.example.com")));
    assert_eq!(budget.store().tenant_count(), 0);
}

#[test]
fn local_budgets_do_not_share_state() {
    let clock = ManualClock::new(1_700_000_000_000);
    let options = LocalBudgetStoreOptions {
        clock: Arc::new(clock),
    };
    let first = ThrottleBudget::new(LocalBudgetStore::new(options.clone()));
    let second = ThrottleBudget::new(LocalBudgetStore::new(options));
    let tenant = key("shop.example.com");
    let config = RateLimitConfig::new(2000f64, 100f64);

    block_on(async {
        first.admission().decide(&tenant, 1500f64, &config).await.unwrap();

        let decision = second.admission().decide(&tenant, 50f64, &config).await.unwrap();
        assert_eq!(decision.remaining, 1860f64);
    });
}

#[cfg(feature = "redis-tokio")]
mod redis_store {
    use std::env;

    use throttle_budget::{RedisBudgetStore, RedisBudgetStoreOptions, ThrottleBudget};

    use super::{key, run_lifecycle};

    fn redis_url() -> Option<String> {
        env::var("REDIS_URL").ok()
    }

    #[test]
    fn redis_lifecycle() {
        let Some(url) = redis_url() else {
            eprintln!("REDIS_URL not set, skipping redis integration test");
            return;
        };

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let client = redis::Client::open(url.as_str()).unwrap();
            let connection_manager = client.get_connection_manager().await.unwrap();
            let n: u64 = rand::random();

            let budget = ThrottleBudget::new(RedisBudgetStore::new(RedisBudgetStoreOptions {
                connection_manager,
                prefix: Some(key(&format!("throttle_budget_itest_{n}"))),
            }));

            run_lifecycle(&budget, &key("shop.example.com")).await;
        });
    }
}

//! In-process budget store.
//!
//! [`LocalBudgetStore`] keeps every tenant's budget in this process using
//! [`DashMap`](dashmap::DashMap). It runs exactly the same decision procedure as the Redis
//! store, which makes it the natural test double for code built on
//! [`ThrottleBudget`](crate::ThrottleBudget) and a complete backend for single-process
//! deployments.
//!
//! # When to Use
//!
//! ✅ **Use the local store when:**
//! - One process makes all calls against the rate-limited system
//! - Tests need deterministic time (pair it with [`ManualClock`])
//!
//! ❌ **Don't use the local store when:**
//! - Several processes or machines spend the same tenant budget
//! - Budgets must survive process restarts

mod clock;
pub use clock::*;

mod local_budget_store;
pub use local_budget_store::*;

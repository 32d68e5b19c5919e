//! Redis-backed budget store.
//!
//! Shares each tenant's budget across every process connected to the same Redis. The
//! decision procedure runs as a Lua script, so it is atomic per tenant and uses the Redis
//! server clock instead of the callers' clocks.

pub(crate) mod common;

mod redis_budget_store;
pub use redis_budget_store::*;

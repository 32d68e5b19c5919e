#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod throttle_budget;
pub use throttle_budget::*;

mod admission;
pub use admission::*;

mod concurrency;
pub use concurrency::*;

mod throttle_sync;
pub use throttle_sync::*;

mod debug_sink;
pub use debug_sink::*;

mod decision;
pub use decision::*;

mod store;
pub use store::*;

pub mod local;
pub use local::*;

#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
#[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
pub mod redis;
#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
pub use self::redis::*;

mod error;
pub use error::*;

mod common;
pub use common::{
    AdmissionDecision, CONCURRENCY_TTL_SECONDS, DEBUG_LOG_CAPACITY, RateLimitConfig,
    SnapshotStatus, StoredSnapshot, THROTTLE_SNAPSHOT_TTL_SECONDS, TenantKey, ThrottleSnapshot,
};

#[cfg(test)]
mod tests;

/// Error type for this crate.
///
/// Being throttled is not an error: a rejected admission comes back as an
/// [`AdmissionDecision`](crate::AdmissionDecision) with `allowed == false`.
#[derive(Debug, thiserror::Error)]
pub enum ThrottleBudgetError {
    /// The [`RateLimitConfig`](crate::RateLimitConfig) failed validation.
    ///
    /// Raised before the store is touched. Retrying without fixing the config is pointless.
    #[error("invalid rate limit config: {0}")]
    InvalidConfig(String),

    /// The cost passed to `decide` was negative or not finite.
    #[error("invalid cost: {0}")]
    InvalidCost(String),

    /// The tenant identifier cannot be used as a store key.
    #[error("invalid tenant key: {0}")]
    InvalidTenantKey(String),

    /// A throttle snapshot handed to `sync` has out-of-range fields.
    #[error("invalid throttle snapshot: {0}")]
    InvalidThrottleSnapshot(String),

    /// The store answered with something that does not have the expected shape.
    #[error("unexpected store response: {0}")]
    UnexpectedStoreResponse(String),

    /// Redis error.
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),
}

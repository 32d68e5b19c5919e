use std::{fmt, ops::Deref, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::ThrottleBudgetError;

/// Seconds a concurrency counter survives without being refreshed by an admission.
pub const CONCURRENCY_TTL_SECONDS: u64 = 10;

/// Seconds an externally reported throttle snapshot stays authoritative.
pub const THROTTLE_SNAPSHOT_TTL_SECONDS: u64 = 10;

/// Maximum number of traces kept by a [`DebugSink`](crate::DebugSink).
pub const DEBUG_LOG_CAPACITY: usize = 1000;

/// A validated newtype for tenant identifiers (for example a store domain).
///
/// Constraints:
/// - Must not be empty
/// - Must not be longer than 255 bytes
///
/// Otherwise the string is opaque: `host:port` forms and braces are fine. Store backends
/// escape whatever their key layout reserves.
#[derive(Debug, Clone, PartialEq, PartialOrd, Hash, Eq)]
pub struct TenantKey(pub(crate) Arc<str>);

impl Deref for TenantKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantKey {
    type Error = ThrottleBudgetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(ThrottleBudgetError::InvalidTenantKey(
                "Tenant key must not be empty".to_string(),
            ))
        } else if value.len() > 255 {
            Err(ThrottleBudgetError::InvalidTenantKey(
                "Tenant key must not be longer than 255 characters".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for TenantKey {
    type Error = ThrottleBudgetError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

fn default_max_concurrency() -> u32 {
    5
}

fn default_base_margin() -> f64 {
    70.0
}

fn default_concurrency_multiplier() -> f64 {
    10.0
}

fn default_concurrency_factor() -> f64 {
    0.2
}

fn default_base_factor() -> f64 {
    1.1
}

/// Per-call bucket configuration. Never persisted.
///
/// Only `bucket_capacity` and `tokens_per_second` are required; the rest default to the
/// values the margin model was tuned with. The struct deserializes from camelCase keys so it
/// can be loaded straight from an application config file:
///
/// ```
/// use throttle_budget::RateLimitConfig;
///
/// let config: RateLimitConfig =
///     serde_json::from_str(r#"{"bucketCapacity": 2000, "tokensPerSecond": 100}"#).unwrap();
///
/// assert_eq!(config.max_concurrency, 5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Nominal bucket size in tokens.
    pub bucket_capacity: f64,
    /// Rate at which consumed tokens decay, in tokens per second.
    pub tokens_per_second: f64,
    /// Concurrency level at which the margin stops growing.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    /// Tokens always withheld from the bucket.
    #[serde(default = "default_base_margin")]
    pub base_margin: f64,
    /// Tokens withheld per in-flight request, up to `max_concurrency`.
    #[serde(default = "default_concurrency_multiplier")]
    pub concurrency_multiplier: f64,
    /// Per-request concurrency weight. Validated but not used by the cost formula, which
    /// derives its concurrency inflation from `effective_concurrency / max_concurrency`.
    #[serde(default = "default_concurrency_factor")]
    pub concurrency_factor: f64,
    /// Multiplier applied to the advisory wait time of rejected requests.
    #[serde(default = "default_base_factor")]
    pub base_factor: f64,
    /// Record a [`DecisionTrace`](crate::DecisionTrace) in the debug sink for this call.
    #[serde(default)]
    pub debug: bool,
}

impl RateLimitConfig {
    /// Create a config with the given bucket and default margins.
    pub fn new(bucket_capacity: f64, tokens_per_second: f64) -> Self {
        Self {
            bucket_capacity,
            tokens_per_second,
            max_concurrency: default_max_concurrency(),
            base_margin: default_base_margin(),
            concurrency_multiplier: default_concurrency_multiplier(),
            concurrency_factor: default_concurrency_factor(),
            base_factor: default_base_factor(),
            debug: false,
        }
    }

    /// Set `max_concurrency`.
    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set `base_margin`.
    pub fn with_base_margin(mut self, base_margin: f64) -> Self {
        self.base_margin = base_margin;
        self
    }

    /// Set `concurrency_multiplier`.
    pub fn with_concurrency_multiplier(mut self, concurrency_multiplier: f64) -> Self {
        self.concurrency_multiplier = concurrency_multiplier;
        self
    }

    /// Set `concurrency_factor`.
    pub fn with_concurrency_factor(mut self, concurrency_factor: f64) -> Self {
        self.concurrency_factor = concurrency_factor;
        self
    }

    /// Set `base_factor`.
    pub fn with_base_factor(mut self, base_factor: f64) -> Self {
        self.base_factor = base_factor;
        self
    }

    /// Enable or disable decision tracing.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Check every field. Called by the controller before any store access.
    pub fn validate(&self) -> Result<(), ThrottleBudgetError> {
        if !(self.bucket_capacity.is_finite() && self.bucket_capacity > 0f64) {
            return Err(ThrottleBudgetError::InvalidConfig(
                "Bucket capacity must be greater than 0".to_string(),
            ));
        }

        if !(self.tokens_per_second.is_finite() && self.tokens_per_second > 0f64) {
            return Err(ThrottleBudgetError::InvalidConfig(
                "Tokens per second must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrency == 0 {
            return Err(ThrottleBudgetError::InvalidConfig(
                "Max concurrency must be greater than 0".to_string(),
            ));
        }

        let non_negative = [
            ("Base margin", self.base_margin),
            ("Concurrency multiplier", self.concurrency_multiplier),
            ("Concurrency factor", self.concurrency_factor),
        ];

        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0f64) {
                return Err(ThrottleBudgetError::InvalidConfig(format!(
                    "{name} must be a finite number >= 0"
                )));
            }
        }

        if !(self.base_factor.is_finite() && self.base_factor > 0f64) {
            return Err(ThrottleBudgetError::InvalidConfig(
                "Base factor must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Ground-truth throttle state reported by the rate-limited system.
///
/// Serialized as `{"maximumAvailable":..,"currentlyAvailable":..,"restoreRate":..}`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleSnapshot {
    /// Bucket size as reported by the remote system.
    pub maximum_available: f64,
    /// Tokens currently left in the remote bucket.
    pub currently_available: f64,
    /// Remote restore rate in tokens per second.
    pub restore_rate: f64,
}

impl ThrottleSnapshot {
    /// Create a snapshot from the three reported values.
    pub fn new(maximum_available: f64, currently_available: f64, restore_rate: f64) -> Self {
        Self {
            maximum_available,
            currently_available,
            restore_rate,
        }
    }

    /// Range-check the fields.
    ///
    /// `maximum_available` and `restore_rate` must be positive, `currently_available` must
    /// lie in `0..=maximum_available`, and all three must be finite.
    pub fn validate(&self) -> Result<(), ThrottleBudgetError> {
        if !(self.maximum_available.is_finite() && self.maximum_available > 0f64) {
            return Err(ThrottleBudgetError::InvalidThrottleSnapshot(
                "Maximum available must be greater than 0".to_string(),
            ));
        }

        if !(self.currently_available.is_finite()
            && self.currently_available >= 0f64
            && self.currently_available <= self.maximum_available)
        {
            return Err(ThrottleBudgetError::InvalidThrottleSnapshot(
                "Currently available must be between 0 and maximum available".to_string(),
            ));
        }

        if !(self.restore_rate.is_finite() && self.restore_rate > 0f64) {
            return Err(ThrottleBudgetError::InvalidThrottleSnapshot(
                "Restore rate must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Tokens the remote system considers consumed.
    pub fn consumed_tokens(&self) -> f64 {
        self.maximum_available - self.currently_available
    }

    pub(crate) fn to_json(self) -> Result<String, ThrottleBudgetError> {
        serde_json::to_string(&self)
            .map_err(|err| ThrottleBudgetError::InvalidThrottleSnapshot(err.to_string()))
    }
}

/// A throttle snapshot as found in the store.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StoredSnapshot {
    /// No snapshot, or it has expired.
    Absent,
    /// A value exists but does not parse or fails range checks. Treated as absent.
    Malformed,
    /// A well-formed snapshot that overrides the internal estimate.
    Valid(ThrottleSnapshot),
}

impl StoredSnapshot {
    /// Schema-checked parse that fails closed.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Absent;
        };

        match serde_json::from_str::<ThrottleSnapshot>(raw) {
            Ok(snapshot) if snapshot.validate().is_ok() => Self::Valid(snapshot),
            _ => Self::Malformed,
        }
    }

    pub(crate) fn status(&self) -> SnapshotStatus {
        match self {
            Self::Absent => SnapshotStatus::Absent,
            Self::Malformed => SnapshotStatus::Ignored,
            Self::Valid(_) => SnapshotStatus::Applied,
        }
    }
}

/// What happened to the tenant's throttle snapshot during a decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// There was no live snapshot.
    Absent,
    /// The snapshot overrode capacity, rate and consumed tokens.
    Applied,
    /// A snapshot was present but malformed, so internal tracking was used.
    Ignored,
}

/// The allow/deny verdict.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdmissionDecision {
    /// Whether the work may proceed. If `true`, the caller owes a `release`.
    pub allowed: bool,
    /// Advisory wait before retrying. Always `0` when allowed.
    pub wait_time_ms: u64,
    /// Tokens left below the effective capacity, never negative.
    pub remaining: f64,
}

impl AdmissionDecision {
    /// The advisory wait as a [`Duration`].
    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }
}

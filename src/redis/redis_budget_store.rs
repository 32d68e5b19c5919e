use redis::{Script, aio::ConnectionManager};

use crate::{
    AdmissionDecision, BudgetSnapshot, BudgetStore, CONCURRENCY_TTL_SECONDS, DecisionTrace,
    Evaluation, RateLimitConfig, SnapshotStatus, StoredSnapshot, THROTTLE_SNAPSHOT_TTL_SECONDS,
    TenantKey, ThrottleBudgetError, ThrottleSnapshot,
    redis::common::{RedisKeyGenerator, default_prefix},
};

// Mirrors `decision::evaluate` expression for expression. Floats leave the script as
// "%.17g" strings because Redis truncates Lua numbers to integers in replies.
const DECIDE_LUA: &str = r#"
    local time_array = redis.call("TIME")
    local now_ms = tonumber(time_array[1]) * 1000 + math.floor(tonumber(time_array[2]) / 1000)

    local tokens_key = KEYS[1]
    local timestamp_key = KEYS[2]
    local external_key = KEYS[3]
    local concurrency_key = KEYS[4]

    local cost = tonumber(ARGV[1])
    local bucket_capacity = tonumber(ARGV[2])
    local tokens_per_second = tonumber(ARGV[3])
    local max_concurrency = tonumber(ARGV[4])
    local base_margin = tonumber(ARGV[5])
    local concurrency_multiplier = tonumber(ARGV[6])
    local base_factor = tonumber(ARGV[7])
    local concurrency_ttl_seconds = tonumber(ARGV[8])

    local function is_finite(value)
        return type(value) == "number" and value == value and value ~= math.huge and value ~= -math.huge
    end

    local function num(value)
        return string.format("%.17g", value)
    end

    local consumed_tokens = tonumber(redis.call("GET", tokens_key)) or 0
    local last_update_ms = tonumber(redis.call("GET", timestamp_key)) or now_ms
    local concurrency = tonumber(redis.call("GET", concurrency_key)) or 0

    -- snapshot status: 0 absent, 1 applied, 2 ignored
    local snapshot_status = 0
    local raw_snapshot = redis.call("GET", external_key)
    if raw_snapshot then
        snapshot_status = 2

        local ok, snapshot = pcall(cjson.decode, raw_snapshot)
        if ok and type(snapshot) == "table" then
            local maximum_available = snapshot["maximumAvailable"]
            local currently_available = snapshot["currentlyAvailable"]
            local restore_rate = snapshot["restoreRate"]

            if is_finite(maximum_available) and is_finite(currently_available) and is_finite(restore_rate)
                and maximum_available > 0 and restore_rate > 0
                and currently_available >= 0 and currently_available <= maximum_available then
                consumed_tokens = maximum_available - currently_available
                tokens_per_second = restore_rate
                bucket_capacity = maximum_available
                snapshot_status = 1
            end
        end
    end

    -- decay
    local elapsed_seconds = math.max(0, now_ms - last_update_ms) / 1000
    consumed_tokens = math.max(0, consumed_tokens - elapsed_seconds * tokens_per_second)

    local counter_repaired = 0
    if concurrency < 0 then
        concurrency = 0
        counter_repaired = 1
    end
    local effective_concurrency = concurrency + 1

    local capacity_pct = 100 * (bucket_capacity - consumed_tokens) / bucket_capacity

    if capacity_pct < 30 then
        local scale = 1 + (30 - capacity_pct) / 30
        base_margin = base_margin * scale
        concurrency_multiplier = concurrency_multiplier * scale

        if capacity_pct < 10 then
            base_margin = base_margin * 1.5
            concurrency_multiplier = concurrency_multiplier * 1.5
        end
    end

    local safety_margin = base_margin + math.min(max_concurrency, effective_concurrency) * concurrency_multiplier
    local effective_capacity = bucket_capacity - safety_margin

    local capacity_factor = 1 + math.max(0, (30 - capacity_pct) / 30)
    local concurrency_factor = 1 + effective_concurrency / max_concurrency
    local adjusted_cost = cost * capacity_factor * concurrency_factor

    local allowed = 0
    local wait_time_ms = 0
    local remaining = 0

    if consumed_tokens + adjusted_cost <= effective_capacity then
        allowed = 1
        local committed_tokens = consumed_tokens + adjusted_cost
        remaining = math.max(0, effective_capacity - committed_tokens)

        redis.call("SET", tokens_key, num(committed_tokens))
        redis.call("SET", timestamp_key, string.format("%.0f", now_ms))
        redis.call("SET", concurrency_key, string.format("%.0f", effective_concurrency), "EX", concurrency_ttl_seconds)
    else
        local tokens_needed = adjusted_cost + consumed_tokens - effective_capacity
        wait_time_ms = math.ceil(tokens_needed / tokens_per_second * 1000 * base_factor * capacity_factor)
        remaining = math.max(0, effective_capacity - consumed_tokens)

        if counter_repaired == 1 then
            redis.call("SET", concurrency_key, "0", "KEEPTTL")
        end
    end

    return {
        tostring(allowed),
        num(wait_time_ms),
        num(remaining),
        string.format("%.0f", now_ms),
        tostring(snapshot_status),
        tostring(counter_repaired),
        num(bucket_capacity),
        num(tokens_per_second),
        num(consumed_tokens),
        num(effective_concurrency),
        num(capacity_pct),
        num(base_margin),
        num(concurrency_multiplier),
        num(safety_margin),
        num(effective_capacity),
        num(capacity_factor),
        num(concurrency_factor),
        num(adjusted_cost)
    }
"#;

const DECIDE_REPLY_LEN: usize = 18;

const RELEASE_LUA: &str = r#"
    local concurrency_key = KEYS[1]

    local concurrency = tonumber(redis.call("GET", concurrency_key))
    if concurrency == nil then
        return 0
    end

    if concurrency > 0 then
        return redis.call("DECR", concurrency_key)
    end

    redis.call("SET", concurrency_key, "0", "KEEPTTL")
    return 0
"#;

/// Configuration for [`RedisBudgetStore`].
///
/// # Requirements
///
/// - **Redis version:** >= 6.2.0 (scripts use `KEEPTTL`)
/// - **Runtime:** Tokio or Smol (via `redis-tokio` or `redis-smol` features)
///
/// # Examples
///
/// ```ignore
/// use throttle_budget::{RedisBudgetStoreOptions, TenantKey};
///
/// let client = redis::Client::open("redis://127.0.0.1:6379/")?;
/// let connection_manager = client.get_connection_manager().await?;
///
/// let options = RedisBudgetStoreOptions {
///     connection_manager,
///     prefix: Some(TenantKey::try_from("myapp")?), // Keys: myapp:{<tenant>}:tokens, ...
/// };
/// ```
#[derive(Clone)]
pub struct RedisBudgetStoreOptions {
    /// Redis connection manager from the `redis` crate.
    ///
    /// Use `ConnectionManager` for automatic reconnection.
    pub connection_manager: ConnectionManager,

    /// Optional prefix for all Redis keys.
    ///
    /// Keys are written as `<prefix>:{<tenant>}:<suffix>`. If `None`, defaults to
    /// `"throttle_budget"`. Must satisfy the [`TenantKey`] constraints.
    pub prefix: Option<TenantKey>,
}

/// A [`BudgetStore`] shared by every process that talks to the same Redis.
///
/// `decide` and `release` are Lua scripts, so each runs atomically inside Redis and reads
/// the clock with `TIME` on the server. `sync` is a single `SET .. EX` and `cleanup` a single
/// multi-key `DEL`, both atomic on their own.
///
/// # Data model
///
/// For a tenant `t` under prefix `p`:
///
/// | key | type | content |
/// |-----|------|---------|
/// | `p:{t}:tokens` | string | consumed tokens, `%.17g` |
/// | `p:{t}:ts` | string | last update, server milliseconds |
/// | `p:{t}:ext` | string | throttle snapshot JSON, 10 s TTL |
/// | `p:{t}:conc` | string | concurrency counter, 10 s TTL |
///
/// The `{t}` hash tag keeps a tenant's keys in one cluster slot.
///
/// # Failure semantics
///
/// Redis errors are returned unchanged and never retried. A call that errors or times out
/// may or may not have been applied.
pub struct RedisBudgetStore {
    connection_manager: ConnectionManager,
    key_generator: RedisKeyGenerator,
    decide_script: Script,
    release_script: Script,
}

impl RedisBudgetStore {
    /// Create a store over an existing connection manager.
    pub fn new(options: RedisBudgetStoreOptions) -> Self {
        let prefix = options.prefix.unwrap_or_else(default_prefix);

        Self {
            connection_manager: options.connection_manager,
            key_generator: RedisKeyGenerator::new(prefix),
            decide_script: Script::new(DECIDE_LUA),
            release_script: Script::new(RELEASE_LUA),
        }
    }

    fn parse_decide_reply(
        tenant: &TenantKey,
        cost: f64,
        reply: Vec<String>,
    ) -> Result<Evaluation, ThrottleBudgetError> {
        if reply.len() != DECIDE_REPLY_LEN {
            return Err(ThrottleBudgetError::UnexpectedStoreResponse(format!(
                "decide script returned {} fields, expected {DECIDE_REPLY_LEN}",
                reply.len()
            )));
        }

        let field = |index: usize| -> Result<f64, ThrottleBudgetError> {
            reply[index].parse::<f64>().map_err(|_| {
                ThrottleBudgetError::UnexpectedStoreResponse(format!(
                    "decide script field {index} is not a number: {:?}",
                    reply[index]
                ))
            })
        };

        let snapshot = match field(4)? as u8 {
            0 => SnapshotStatus::Absent,
            1 => SnapshotStatus::Applied,
            2 => SnapshotStatus::Ignored,
            other => {
                return Err(ThrottleBudgetError::UnexpectedStoreResponse(format!(
                    "unknown snapshot status {other}"
                )));
            }
        };

        let decision = AdmissionDecision {
            allowed: field(0)? == 1f64,
            wait_time_ms: field(1)? as u64,
            remaining: field(2)?,
        };

        Ok(Evaluation {
            decision,
            trace: DecisionTrace {
                tenant: tenant.clone(),
                now_ms: field(3)? as u64,
                cost,
                snapshot,
                counter_repaired: field(5)? == 1f64,
                bucket_capacity: field(6)?,
                tokens_per_second: field(7)?,
                consumed_tokens: field(8)?,
                effective_concurrency: field(9)? as u64,
                capacity_pct: field(10)?,
                base_margin: field(11)?,
                concurrency_multiplier: field(12)?,
                safety_margin: field(13)?,
                effective_capacity: field(14)?,
                capacity_factor: field(15)?,
                concurrency_factor: field(16)?,
                adjusted_cost: field(17)?,
                decision,
            },
        })
    } // end method parse_decide_reply
}

impl BudgetStore for RedisBudgetStore {
    async fn decide(
        &self,
        tenant: &TenantKey,
        cost: f64,
        config: &RateLimitConfig,
    ) -> Result<Evaluation, ThrottleBudgetError> {
        let keys = self.key_generator.get_tenant_keys(tenant);
        let mut connection_manager = self.connection_manager.clone();

        let reply: Vec<String> = self
            .decide_script
            .key(&*keys.tokens)
            .key(&*keys.timestamp)
            .key(&*keys.external)
            .key(&*keys.concurrency)
            .arg(cost)
            .arg(config.bucket_capacity)
            .arg(config.tokens_per_second)
            .arg(config.max_concurrency)
            .arg(config.base_margin)
            .arg(config.concurrency_multiplier)
            .arg(config.base_factor)
            .arg(CONCURRENCY_TTL_SECONDS)
            .invoke_async(&mut connection_manager)
            .await?;

        Self::parse_decide_reply(tenant, cost, reply)
    } // end method decide

    async fn release(&self, tenant: &TenantKey) -> Result<u64, ThrottleBudgetError> {
        let keys = self.key_generator.get_tenant_keys(tenant);
        let mut connection_manager = self.connection_manager.clone();

        let concurrency: i64 = self
            .release_script
            .key(&*keys.concurrency)
            .invoke_async(&mut connection_manager)
            .await?;

        Ok(concurrency.max(0) as u64)
    } // end method release

    async fn sync(
        &self,
        tenant: &TenantKey,
        snapshot: &ThrottleSnapshot,
    ) -> Result<(), ThrottleBudgetError> {
        let keys = self.key_generator.get_tenant_keys(tenant);
        let mut connection_manager = self.connection_manager.clone();
        let raw = snapshot.to_json()?;

        let _: () = redis::cmd("SET")
            .arg(&*keys.external)
            .arg(raw)
            .arg("EX")
            .arg(THROTTLE_SNAPSHOT_TTL_SECONDS)
            .query_async(&mut connection_manager)
            .await?;

        Ok(())
    } // end method sync

    async fn cleanup(&self, tenant: &TenantKey) -> Result<(), ThrottleBudgetError> {
        let keys = self.key_generator.get_tenant_keys(tenant);
        let mut connection_manager = self.connection_manager.clone();

        let _: () = redis::cmd("DEL")
            .arg(&*keys.tokens)
            .arg(&*keys.timestamp)
            .arg(&*keys.external)
            .arg(&*keys.concurrency)
            .query_async(&mut connection_manager)
            .await?;

        Ok(())
    } // end method cleanup

    async fn peek(&self, tenant: &TenantKey) -> Result<BudgetSnapshot, ThrottleBudgetError> {
        let keys = self.key_generator.get_tenant_keys(tenant);
        let mut connection_manager = self.connection_manager.clone();

        let (tokens, timestamp, external, concurrency): (
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        ) = redis::cmd("MGET")
            .arg(&*keys.tokens)
            .arg(&*keys.timestamp)
            .arg(&*keys.external)
            .arg(&*keys.concurrency)
            .query_async(&mut connection_manager)
            .await?;

        Ok(BudgetSnapshot {
            consumed_tokens: tokens.and_then(|v| v.parse().ok()).unwrap_or(0f64),
            last_update_ms: timestamp.and_then(|v| v.parse().ok()),
            concurrency: concurrency.and_then(|v| v.parse().ok()).unwrap_or(0),
            snapshot: StoredSnapshot::parse(external.as_deref()),
        })
    } // end method peek
}

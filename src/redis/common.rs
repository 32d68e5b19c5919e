use std::sync::Arc;

use crate::TenantKey;

/// Default prefix for every key written by the Redis store.
pub(crate) fn default_prefix() -> TenantKey {
    TenantKey(Arc::from("throttle_budget"))
}

/// The four keys holding one tenant's state.
#[derive(Debug)]
pub(crate) struct TenantKeys {
    pub tokens: String,
    pub timestamp: String,
    pub external: String,
    pub concurrency: String,
}

/// Builds the per-tenant key names.
///
/// Keys look like `<prefix>:{<tenant>}:<suffix>`. The braces form a Redis Cluster hash
/// tag, so all of a tenant's keys land in one slot and a single script may touch them.
/// `{`, `}` and `%` in the prefix or tenant are percent-encoded, so any tenant string yields
/// a non-empty, well-formed tag and distinct tenants never share a key.
#[derive(Debug)]
pub(crate) struct RedisKeyGenerator {
    pub prefix: String,
    pub tokens_key_suffix: String,
    pub timestamp_key_suffix: String,
    pub external_key_suffix: String,
    pub concurrency_key_suffix: String,
}

fn encode_key_part(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            '{' => encoded.push_str("%7B"),
            '}' => encoded.push_str("%7D"),
            c => encoded.push(c),
        }
    }
    encoded
}

impl RedisKeyGenerator {
    pub(crate) fn new(prefix: TenantKey) -> Self {
        Self {
            prefix: encode_key_part(&prefix),
            tokens_key_suffix: "tokens".to_string(),
            timestamp_key_suffix: "ts".to_string(),
            external_key_suffix: "ext".to_string(),
            concurrency_key_suffix: "conc".to_string(),
        }
    }

    fn get_key_with_suffix(&self, tag: &str, suffix: &str) -> String {
        format!("{}:{{{}}}:{}", self.prefix, tag, suffix)
    }

    // Built per call: nothing to evict for tenants that are never seen again.
    pub(crate) fn get_tenant_keys(&self, tenant: &TenantKey) -> TenantKeys {
        let tag = encode_key_part(tenant);

        TenantKeys {
            tokens: self.get_key_with_suffix(&tag, &self.tokens_key_suffix),
            timestamp: self.get_key_with_suffix(&tag, &self.timestamp_key_suffix),
            external: self.get_key_with_suffix(&tag, &self.external_key_suffix),
            concurrency: self.get_key_with_suffix(&tag, &self.concurrency_key_suffix),
        }
    }
}

//! Ephemeral coordination store: leases, dedup slots, cooldowns, presence,
//! token caches, and rate-limit counters.
//!
//! Two lease families share one primitive — standard-job leases keyed by
//! `(tenant, job)` and scan-session leases keyed by `(session)` — differing
//! only in key namespace and default TTL. Correctness rules:
//!
//! - `acquire` succeeds only when the key is absent or expired (SET NX).
//! - `renew` is an atomic compare-and-swap on the owner; never a
//!   read-then-write.
//! - `release` is an atomic compare-and-delete; deleting an absent key is
//!   idempotent success, deleting another owner's key is a mismatch error.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CacheError;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Cooldown bookkeeping for interactive scan creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownState {
    pub count: i64,
    pub last_at: DateTime<Utc>,
}

/// Identity snapshot cached against a user-token hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedUserToken {
    pub user_id: i64,
    pub tenant_id: i64,
    pub status: String,
    pub user_expires_at: DateTime<Utc>,
    pub token_expires_at: DateTime<Utc>,
}

/// The full surface the rest of the service needs from the ephemeral store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn ping(&self) -> Result<(), CacheError>;

    // -- Standard-job leases --

    async fn acquire_job_lease(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    async fn is_job_lease_owner(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
    ) -> Result<bool, CacheError>;

    async fn renew_job_lease(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Owner-checked delete. `Err(CacheError::LeaseOwnerMismatch)` when the
    /// key is held by someone else; absent keys release successfully.
    async fn release_job_lease(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
    ) -> Result<(), CacheError>;

    /// Unconditional delete, used by lease-expiry reconciliation.
    async fn clear_job_lease(&self, tenant_id: i64, job_id: i64) -> Result<(), CacheError>;

    // -- Scan-session leases --

    async fn acquire_scan_lease(
        &self,
        session_id: i64,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    async fn is_scan_lease_owner(&self, session_id: i64, node_id: &str)
    -> Result<bool, CacheError>;

    async fn renew_scan_lease(
        &self,
        session_id: i64,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    async fn release_scan_lease(&self, session_id: i64, node_id: &str) -> Result<(), CacheError>;

    async fn clear_scan_lease(&self, session_id: i64) -> Result<(), CacheError>;

    // -- Schedule dedup slots --

    /// The single authorization gate for creating one job instance for one
    /// due occurrence. Never re-acquirable inside its TTL.
    async fn acquire_schedule_slot(
        &self,
        tenant_id: i64,
        user_id: i64,
        task_type: &str,
        slot: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    // -- Scan cooldown --

    async fn scan_cooldown(&self, user_id: i64) -> Result<Option<CooldownState>, CacheError>;

    async fn set_scan_cooldown(
        &self,
        user_id: i64,
        count: i64,
        at: DateTime<Utc>,
    ) -> Result<(), CacheError>;

    // -- Scan user choice (low-latency polling path for the agent) --

    async fn set_scan_user_choice(
        &self,
        session_id: i64,
        choice_type: &str,
        value: &str,
    ) -> Result<(), CacheError>;

    async fn scan_user_choice(
        &self,
        session_id: i64,
    ) -> Result<HashMap<String, String>, CacheError>;

    async fn clear_scan_user_choice(&self, session_id: i64) -> Result<(), CacheError>;

    // -- Scan user presence --

    async fn touch_scan_user_heartbeat(&self, session_id: i64) -> Result<(), CacheError>;

    async fn is_scan_user_online(&self, session_id: i64) -> Result<bool, CacheError>;

    // -- Token caches --

    async fn cached_user_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<CachedUserToken>, CacheError>;

    async fn cache_user_token(
        &self,
        token_hash: &str,
        entry: &CachedUserToken,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn cached_agent_tenant(&self, token_hash: &str) -> Result<Option<i64>, CacheError>;

    async fn cache_agent_tenant(
        &self,
        token_hash: &str,
        tenant_id: i64,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    // -- Rate limiting --

    /// Fixed-window counter; returns whether the request is allowed.
    async fn check_rate_limit(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<bool, CacheError>;
}

/// Join non-empty key parts with `:` under the instance prefix.
pub(crate) fn build_key(prefix: &str, parts: &[&str]) -> String {
    let mut all = Vec::with_capacity(parts.len() + 1);
    if !prefix.is_empty() {
        all.push(prefix.trim_end_matches(':'));
    }
    for part in parts {
        let part = part.trim();
        if !part.is_empty() {
            all.push(part);
        }
    }
    all.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_key_joins_and_skips_empty() {
        assert_eq!(build_key("farmhand", &["job", "lease", "1", "42"]), "farmhand:job:lease:1:42");
        assert_eq!(build_key("farmhand:", &["scan", "", "7"]), "farmhand:scan:7");
        assert_eq!(build_key("", &["ratelimit", "poll"]), "ratelimit:poll");
    }
}

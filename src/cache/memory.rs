//! In-memory coordination store with the same semantics as the Redis
//! implementation. Backs tests and single-process development runs where no
//! Redis is available; TTLs are enforced lazily on access.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cache::{CachedUserToken, CoordinationStore, CooldownState, build_key};
use crate::error::CacheError;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct HashEntry {
    fields: HashMap<String, String>,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(parts: &[&str]) -> String {
        build_key("", parts)
    }

    fn job_lease_key(tenant_id: i64, job_id: i64) -> String {
        Self::key(&["job", "lease", &tenant_id.to_string(), &job_id.to_string()])
    }

    fn scan_lease_key(session_id: i64) -> String {
        Self::key(&["scan", "lease", &session_id.to_string()])
    }

    fn acquire(&self, key: String, owner: &str, ttl: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let live = inner.strings.get(&key).is_some_and(|e| e.expires_at > now);
        if live {
            return false;
        }
        inner.strings.insert(
            key,
            Entry {
                value: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        true
    }

    fn current_owner(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .strings
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    fn renew(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.strings.get_mut(key) {
            Some(entry) if entry.expires_at > now && entry.value == owner => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    fn release(&self, key: &str, owner: &str) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        enum Held {
            Absent,
            Deletable,
            ByOther,
        }
        let held = match inner.strings.get(key) {
            None => Held::Absent,
            Some(entry) if entry.expires_at <= now => Held::Deletable,
            Some(entry) if entry.value == owner => Held::Deletable,
            Some(_) => Held::ByOther,
        };
        match held {
            Held::Absent => Ok(()),
            Held::Deletable => {
                inner.strings.remove(key);
                Ok(())
            }
            Held::ByOther => Err(CacheError::LeaseOwnerMismatch),
        }
    }

    fn clear(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.remove(key);
        inner.hashes.remove(key);
    }

    fn hash_set(&self, key: String, fields: Vec<(String, String)>, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let entry = inner.hashes.entry(key).or_insert_with(|| HashEntry {
            fields: HashMap::new(),
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.fields.clear();
        }
        entry.expires_at = now + ttl;
        for (name, value) in fields {
            entry.fields.insert(name, value);
        }
    }

    fn hash_get(&self, key: &str) -> HashMap<String, String> {
        let inner = self.inner.lock().unwrap();
        inner
            .hashes
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.fields.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn acquire_job_lease(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        Ok(self.acquire(Self::job_lease_key(tenant_id, job_id), node_id, ttl))
    }

    async fn is_job_lease_owner(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
    ) -> Result<bool, CacheError> {
        Ok(self.current_owner(&Self::job_lease_key(tenant_id, job_id)).as_deref() == Some(node_id))
    }

    async fn renew_job_lease(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        Ok(self.renew(&Self::job_lease_key(tenant_id, job_id), node_id, ttl))
    }

    async fn release_job_lease(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
    ) -> Result<(), CacheError> {
        self.release(&Self::job_lease_key(tenant_id, job_id), node_id)
    }

    async fn clear_job_lease(&self, tenant_id: i64, job_id: i64) -> Result<(), CacheError> {
        self.clear(&Self::job_lease_key(tenant_id, job_id));
        Ok(())
    }

    async fn acquire_scan_lease(
        &self,
        session_id: i64,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        Ok(self.acquire(Self::scan_lease_key(session_id), node_id, ttl))
    }

    async fn is_scan_lease_owner(
        &self,
        session_id: i64,
        node_id: &str,
    ) -> Result<bool, CacheError> {
        Ok(self.current_owner(&Self::scan_lease_key(session_id)).as_deref() == Some(node_id))
    }

    async fn renew_scan_lease(
        &self,
        session_id: i64,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        Ok(self.renew(&Self::scan_lease_key(session_id), node_id, ttl))
    }

    async fn release_scan_lease(&self, session_id: i64, node_id: &str) -> Result<(), CacheError> {
        self.release(&Self::scan_lease_key(session_id), node_id)
    }

    async fn clear_scan_lease(&self, session_id: i64) -> Result<(), CacheError> {
        self.clear(&Self::scan_lease_key(session_id));
        Ok(())
    }

    async fn acquire_schedule_slot(
        &self,
        tenant_id: i64,
        user_id: i64,
        task_type: &str,
        slot: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let key = Self::key(&[
            "scheduler",
            "slot",
            &tenant_id.to_string(),
            &user_id.to_string(),
            task_type,
            slot,
        ]);
        Ok(self.acquire(key, "1", ttl))
    }

    async fn scan_cooldown(&self, user_id: i64) -> Result<Option<CooldownState>, CacheError> {
        let key = Self::key(&["scan", "cooldown", &user_id.to_string()]);
        let fields = self.hash_get(&key);
        let count = fields.get("count").and_then(|v| v.parse::<i64>().ok());
        let last_at = fields
            .get("last_at")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc));
        Ok(match (count, last_at) {
            (Some(count), Some(last_at)) => Some(CooldownState { count, last_at }),
            _ => None,
        })
    }

    async fn set_scan_cooldown(
        &self,
        user_id: i64,
        count: i64,
        at: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let key = Self::key(&["scan", "cooldown", &user_id.to_string()]);
        self.hash_set(
            key,
            vec![
                ("count".to_string(), count.to_string()),
                ("last_at".to_string(), at.to_rfc3339()),
            ],
            Duration::from_secs(24 * 3600),
        );
        Ok(())
    }

    async fn set_scan_user_choice(
        &self,
        session_id: i64,
        choice_type: &str,
        value: &str,
    ) -> Result<(), CacheError> {
        let key = Self::key(&["scan", "user_choice", &session_id.to_string()]);
        self.hash_set(
            key,
            vec![(choice_type.to_string(), value.to_string())],
            Duration::from_secs(30 * 60),
        );
        Ok(())
    }

    async fn scan_user_choice(
        &self,
        session_id: i64,
    ) -> Result<HashMap<String, String>, CacheError> {
        let key = Self::key(&["scan", "user_choice", &session_id.to_string()]);
        Ok(self.hash_get(&key))
    }

    async fn clear_scan_user_choice(&self, session_id: i64) -> Result<(), CacheError> {
        let key = Self::key(&["scan", "user_choice", &session_id.to_string()]);
        self.clear(&key);
        Ok(())
    }

    async fn touch_scan_user_heartbeat(&self, session_id: i64) -> Result<(), CacheError> {
        let key = Self::key(&["scan", "user_heartbeat", &session_id.to_string()]);
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(
            key,
            Entry {
                value: Utc::now().to_rfc3339(),
                expires_at: Instant::now() + Duration::from_secs(20),
            },
        );
        Ok(())
    }

    async fn is_scan_user_online(&self, session_id: i64) -> Result<bool, CacheError> {
        let key = Self::key(&["scan", "user_heartbeat", &session_id.to_string()]);
        Ok(self.current_owner(&key).is_some())
    }

    async fn cached_user_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<CachedUserToken>, CacheError> {
        let key = Self::key(&["user", "token", token_hash]);
        let fields = self.hash_get(&key);
        if fields.is_empty() {
            return Ok(None);
        }
        let parse_time = |name: &str| {
            fields
                .get(name)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        Ok((|| {
            Some(CachedUserToken {
                user_id: fields.get("user_id")?.parse().ok()?,
                tenant_id: fields.get("tenant_id")?.parse().ok()?,
                status: fields.get("status")?.clone(),
                user_expires_at: parse_time("user_expires_at")?,
                token_expires_at: parse_time("token_expires_at")?,
            })
        })())
    }

    async fn cache_user_token(
        &self,
        token_hash: &str,
        entry: &CachedUserToken,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = Self::key(&["user", "token", token_hash]);
        self.hash_set(
            key,
            vec![
                ("user_id".to_string(), entry.user_id.to_string()),
                ("tenant_id".to_string(), entry.tenant_id.to_string()),
                ("status".to_string(), entry.status.clone()),
                (
                    "user_expires_at".to_string(),
                    entry.user_expires_at.to_rfc3339(),
                ),
                (
                    "token_expires_at".to_string(),
                    entry.token_expires_at.to_rfc3339(),
                ),
            ],
            ttl,
        );
        Ok(())
    }

    async fn cached_agent_tenant(&self, token_hash: &str) -> Result<Option<i64>, CacheError> {
        let key = Self::key(&["agent", "session", token_hash]);
        Ok(self.hash_get(&key).get("tenant_id").and_then(|v| v.parse().ok()))
    }

    async fn cache_agent_tenant(
        &self,
        token_hash: &str,
        tenant_id: i64,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = Self::key(&["agent", "session", token_hash]);
        self.hash_set(
            key,
            vec![("tenant_id".to_string(), tenant_id.to_string())],
            ttl,
        );
        Ok(())
    }

    async fn check_rate_limit(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<bool, CacheError> {
        let key = Self::key(&["ratelimit", key]);
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let entry = inner.strings.entry(key).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: now + window,
        });
        if entry.expires_at <= now {
            entry.value = "0".to_string();
            entry.expires_at = now + window;
        }
        let count: i64 = entry.value.parse().unwrap_or(0) + 1;
        entry.value = count.to_string();
        Ok(count <= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn second_acquire_fails_while_lease_live() {
        let store = MemoryStore::new();
        assert!(store.acquire_job_lease(1, 10, "node-a", TTL).await.unwrap());
        assert!(!store.acquire_job_lease(1, 10, "node-b", TTL).await.unwrap());
        // Different job id is an independent key.
        assert!(store.acquire_job_lease(1, 11, "node-b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn renew_requires_matching_owner() {
        let store = MemoryStore::new();
        assert!(store.acquire_job_lease(1, 10, "node-a", TTL).await.unwrap());
        assert!(store.renew_job_lease(1, 10, "node-a", TTL).await.unwrap());
        assert!(!store.renew_job_lease(1, 10, "node-b", TTL).await.unwrap());
        assert!(store.is_job_lease_owner(1, 10, "node-a").await.unwrap());
    }

    #[tokio::test]
    async fn release_is_idempotent_and_owner_gated() {
        let store = MemoryStore::new();
        assert!(store.acquire_job_lease(1, 10, "node-a", TTL).await.unwrap());

        // Wrong owner must not delete.
        let err = store.release_job_lease(1, 10, "node-b").await.unwrap_err();
        assert!(matches!(err, CacheError::LeaseOwnerMismatch));
        assert!(store.is_job_lease_owner(1, 10, "node-a").await.unwrap());

        store.release_job_lease(1, 10, "node-a").await.unwrap();
        // Releasing an absent key succeeds.
        store.release_job_lease(1, 10, "node-a").await.unwrap();
        assert!(store.acquire_job_lease(1, 10, "node-b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_reacquirable() {
        let store = MemoryStore::new();
        assert!(
            store
                .acquire_job_lease(1, 10, "node-a", Duration::from_millis(5))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.is_job_lease_owner(1, 10, "node-a").await.unwrap());
        assert!(!store.renew_job_lease(1, 10, "node-a", TTL).await.unwrap());
        assert!(store.acquire_job_lease(1, 10, "node-b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn schedule_slot_acquired_once_per_window() {
        let store = MemoryStore::new();
        assert!(
            store
                .acquire_schedule_slot(1, 2, "bounty", "daily:20260807:0900", TTL)
                .await
                .unwrap()
        );
        assert!(
            !store
                .acquire_schedule_slot(1, 2, "bounty", "daily:20260807:0900", TTL)
                .await
                .unwrap()
        );
        // A different slot id is a different occurrence.
        assert!(
            store
                .acquire_schedule_slot(1, 2, "bounty", "daily:20260808:0900", TTL)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn scan_and_job_leases_use_separate_namespaces() {
        let store = MemoryStore::new();
        assert!(store.acquire_job_lease(1, 7, "node-a", TTL).await.unwrap());
        assert!(store.acquire_scan_lease(7, "node-b", TTL).await.unwrap());
        assert!(store.is_job_lease_owner(1, 7, "node-a").await.unwrap());
        assert!(store.is_scan_lease_owner(7, "node-b").await.unwrap());
    }

    #[tokio::test]
    async fn rate_limit_fixed_window() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(1);
        assert!(store.check_rate_limit("poll:tenant:1", 2, window).await.unwrap());
        assert!(store.check_rate_limit("poll:tenant:1", 2, window).await.unwrap());
        assert!(!store.check_rate_limit("poll:tenant:1", 2, window).await.unwrap());
        // Another tenant has its own window.
        assert!(store.check_rate_limit("poll:tenant:2", 2, window).await.unwrap());
    }

    #[tokio::test]
    async fn cooldown_round_trip() {
        let store = MemoryStore::new();
        assert!(store.scan_cooldown(5).await.unwrap().is_none());
        let at = Utc::now();
        store.set_scan_cooldown(5, 3, at).await.unwrap();
        let state = store.scan_cooldown(5).await.unwrap().unwrap();
        assert_eq!(state.count, 3);
        assert_eq!(state.last_at.timestamp(), at.timestamp());
    }

    #[tokio::test]
    async fn user_choice_set_and_clear() {
        let store = MemoryStore::new();
        store.set_scan_user_choice(9, "zone", "west-2").await.unwrap();
        let choices = store.scan_user_choice(9).await.unwrap();
        assert_eq!(choices.get("zone").map(String::as_str), Some("west-2"));
        store.clear_scan_user_choice(9).await.unwrap();
        assert!(store.scan_user_choice(9).await.unwrap().is_empty());
    }
}

//! Redis-backed coordination store.
//!
//! Renew and release run as Lua scripts so the owner comparison and the
//! expire/delete happen in a single round trip; a renew can therefore never
//! race a steal between its read and its write.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;

use crate::cache::{CachedUserToken, CoordinationStore, CooldownState, build_key};
use crate::config::RedisConfig;
use crate::error::CacheError;

const RENEW_SCRIPT: &str = r#"
local current = redis.call("GET", KEYS[1])
if not current then
  return 0
end
if current ~= ARGV[1] then
  return 0
end
redis.call("PEXPIRE", KEYS[1], ARGV[2])
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
local current = redis.call("GET", KEYS[1])
if not current then
  return 1
end
if current ~= ARGV[1] then
  return 0
end
redis.call("DEL", KEYS[1])
return 1
"#;

/// TTL on the user-presence heartbeat key; its silent expiry, not an explicit
/// disconnect, is what agents observe as "user left".
const USER_HEARTBEAT_TTL: Duration = Duration::from_secs(20);

/// Upper bound on how long a cooldown hash lingers after the last attempt.
const COOLDOWN_RETENTION: Duration = Duration::from_secs(24 * 3600);

const USER_CHOICE_TTL: Duration = Duration::from_secs(30 * 60);

pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    renew_script: Script,
    release_script: Script,
}

impl RedisStore {
    /// Connect and verify the server responds.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, CacheError> {
        let client = redis::Client::open(cfg.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        let store = Self {
            conn,
            prefix: cfg.key_prefix.trim_end_matches(':').to_string(),
            renew_script: Script::new(RENEW_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        };
        store.ping().await?;
        Ok(store)
    }

    fn key(&self, parts: &[&str]) -> String {
        build_key(&self.prefix, parts)
    }

    fn job_lease_key(&self, tenant_id: i64, job_id: i64) -> String {
        self.key(&["job", "lease", &tenant_id.to_string(), &job_id.to_string()])
    }

    fn scan_lease_key(&self, session_id: i64) -> String {
        self.key(&["scan", "lease", &session_id.to_string()])
    }

    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl_millis(ttl);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn current_owner(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let res: i64 = self
            .renew_script
            .key(key)
            .arg(owner)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(res == 1)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let res: i64 = self
            .release_script
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        if res == 1 {
            Ok(())
        } else {
            Err(CacheError::LeaseOwnerMismatch)
        }
    }

    async fn clear(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    let ms = ttl.as_millis() as i64;
    if ms <= 0 { 1000 } else { ms }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn acquire_job_lease(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.acquire(&self.job_lease_key(tenant_id, job_id), node_id, ttl)
            .await
    }

    async fn is_job_lease_owner(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
    ) -> Result<bool, CacheError> {
        let owner = self.current_owner(&self.job_lease_key(tenant_id, job_id)).await?;
        Ok(owner.as_deref() == Some(node_id))
    }

    async fn renew_job_lease(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.renew(&self.job_lease_key(tenant_id, job_id), node_id, ttl)
            .await
    }

    async fn release_job_lease(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
    ) -> Result<(), CacheError> {
        self.release(&self.job_lease_key(tenant_id, job_id), node_id)
            .await
    }

    async fn clear_job_lease(&self, tenant_id: i64, job_id: i64) -> Result<(), CacheError> {
        self.clear(&self.job_lease_key(tenant_id, job_id)).await
    }

    async fn acquire_scan_lease(
        &self,
        session_id: i64,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.acquire(&self.scan_lease_key(session_id), node_id, ttl).await
    }

    async fn is_scan_lease_owner(
        &self,
        session_id: i64,
        node_id: &str,
    ) -> Result<bool, CacheError> {
        let owner = self.current_owner(&self.scan_lease_key(session_id)).await?;
        Ok(owner.as_deref() == Some(node_id))
    }

    async fn renew_scan_lease(
        &self,
        session_id: i64,
        node_id: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.renew(&self.scan_lease_key(session_id), node_id, ttl).await
    }

    async fn release_scan_lease(&self, session_id: i64, node_id: &str) -> Result<(), CacheError> {
        self.release(&self.scan_lease_key(session_id), node_id).await
    }

    async fn clear_scan_lease(&self, session_id: i64) -> Result<(), CacheError> {
        self.clear(&self.scan_lease_key(session_id)).await
    }

    async fn acquire_schedule_slot(
        &self,
        tenant_id: i64,
        user_id: i64,
        task_type: &str,
        slot: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let key = self.key(&[
            "scheduler",
            "slot",
            &tenant_id.to_string(),
            &user_id.to_string(),
            task_type,
            slot,
        ]);
        self.acquire(&key, "1", ttl).await
    }

    async fn scan_cooldown(&self, user_id: i64) -> Result<Option<CooldownState>, CacheError> {
        let key = self.key(&["scan", "cooldown", &user_id.to_string()]);
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let count = fields.get("count").and_then(|v| v.parse::<i64>().ok());
        let last_at = fields
            .get("last_at")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc));
        match (count, last_at) {
            (Some(count), Some(last_at)) => Ok(Some(CooldownState { count, last_at })),
            _ => Ok(None),
        }
    }

    async fn set_scan_cooldown(
        &self,
        user_id: i64,
        count: i64,
        at: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let key = self.key(&["scan", "cooldown", &user_id.to_string()]);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("count")
            .arg(count)
            .arg("last_at")
            .arg(at.to_rfc3339())
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(COOLDOWN_RETENTION.as_secs())
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_scan_user_choice(
        &self,
        session_id: i64,
        choice_type: &str,
        value: &str,
    ) -> Result<(), CacheError> {
        let key = self.key(&["scan", "user_choice", &session_id.to_string()]);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&key)
            .arg(choice_type)
            .arg(value)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(USER_CHOICE_TTL.as_secs())
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn scan_user_choice(
        &self,
        session_id: i64,
    ) -> Result<HashMap<String, String>, CacheError> {
        let key = self.key(&["scan", "user_choice", &session_id.to_string()]);
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await?;
        Ok(fields)
    }

    async fn clear_scan_user_choice(&self, session_id: i64) -> Result<(), CacheError> {
        let key = self.key(&["scan", "user_choice", &session_id.to_string()]);
        self.clear(&key).await
    }

    async fn touch_scan_user_heartbeat(&self, session_id: i64) -> Result<(), CacheError> {
        let key = self.key(&["scan", "user_heartbeat", &session_id.to_string()]);
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(&key)
            .arg(Utc::now().to_rfc3339())
            .arg("EX")
            .arg(USER_HEARTBEAT_TTL.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_scan_user_online(&self, session_id: i64) -> Result<bool, CacheError> {
        let key = self.key(&["scan", "user_heartbeat", &session_id.to_string()]);
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await?;
        Ok(exists == 1)
    }

    async fn cached_user_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<CachedUserToken>, CacheError> {
        let key = self.key(&["user", "token", token_hash]);
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let parse_time = |name: &str| {
            fields
                .get(name)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        let entry = (|| {
            Some(CachedUserToken {
                user_id: fields.get("user_id")?.parse().ok()?,
                tenant_id: fields.get("tenant_id")?.parse().ok()?,
                status: fields.get("status")?.clone(),
                user_expires_at: parse_time("user_expires_at")?,
                token_expires_at: parse_time("token_expires_at")?,
            })
        })();
        Ok(entry)
    }

    async fn cache_user_token(
        &self,
        token_hash: &str,
        entry: &CachedUserToken,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = self.key(&["user", "token", token_hash]);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("user_id")
            .arg(entry.user_id)
            .arg("tenant_id")
            .arg(entry.tenant_id)
            .arg("status")
            .arg(&entry.status)
            .arg("user_expires_at")
            .arg(entry.user_expires_at.to_rfc3339())
            .arg("token_expires_at")
            .arg(entry.token_expires_at.to_rfc3339())
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl.as_secs().max(1))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn cached_agent_tenant(&self, token_hash: &str) -> Result<Option<i64>, CacheError> {
        let key = self.key(&["agent", "session", token_hash]);
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("HGET")
            .arg(&key)
            .arg("tenant_id")
            .query_async(&mut conn)
            .await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    async fn cache_agent_tenant(
        &self,
        token_hash: &str,
        tenant_id: i64,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = self.key(&["agent", "session", token_hash]);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("tenant_id")
            .arg(tenant_id)
            .arg("updated_at")
            .arg(Utc::now().to_rfc3339())
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl.as_secs().max(1))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn check_rate_limit(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<bool, CacheError> {
        let key = self.key(&["ratelimit", key]);
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("INCR").arg(&key).query_async(&mut conn).await?;
        if count == 1 {
            let _: () = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(window.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
        }
        Ok(count <= limit)
    }
}

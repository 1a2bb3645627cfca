//! User, token, and agent-node queries consumed at the service boundary.

use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use crate::error::DatabaseError;
use crate::models::User;
use crate::store::Store;

const USER_COLUMNS: &str =
    "id, account_no, tenant_id, login_id, user_type, status, username, expires_at, notify_config";

fn user_from_row(row: &Row) -> User {
    User {
        id: row.get("id"),
        account_no: row.get("account_no"),
        tenant_id: row.get("tenant_id"),
        login_id: row.get("login_id"),
        user_type: row.get("user_type"),
        status: row.get("status"),
        username: row.get("username"),
        expires_at: row.get("expires_at"),
        notify_config: row.get("notify_config"),
    }
}

/// A validated user token joined with its owner.
#[derive(Debug, Clone)]
pub struct UserTokenLookup {
    pub token_id: i64,
    pub token_expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub user: User,
}

impl Store {
    /// Active, unexpired users ordered by id — one query per generator cycle.
    pub async fn active_users(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<User>, DatabaseError> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at > $1 \
             ORDER BY id ASC LIMIT $2"
        );
        let rows = conn.query(sql.as_str(), &[&now, &limit]).await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn user_by_id(&self, id: i64) -> Result<Option<User>, DatabaseError> {
        let conn = self.conn().await?;
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = conn.query_opt(sql.as_str(), &[&id]).await?;
        Ok(row.as_ref().map(user_from_row))
    }

    /// Resolve an unrevoked, unexpired token hash to its user.
    pub async fn lookup_user_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UserTokenLookup>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT t.id AS token_id, t.expires_at AS token_expires_at, t.last_used_at, \
                        users.id, users.account_no, users.tenant_id, users.login_id, \
                        users.user_type, users.status, users.username, users.expires_at, \
                        users.notify_config \
                 FROM user_tokens t JOIN users ON users.id = t.user_id \
                 WHERE t.token_hash = $1 AND t.revoked_at IS NULL AND t.expires_at > $2",
                &[&token_hash, &now],
            )
            .await?;
        Ok(row.map(|row| UserTokenLookup {
            token_id: row.get("token_id"),
            token_expires_at: row.get("token_expires_at"),
            last_used_at: row.get("last_used_at"),
            user: user_from_row(&row),
        }))
    }

    /// Throttled `last_used_at` bump.
    pub async fn touch_user_token(
        &self,
        token_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE user_tokens SET last_used_at = $2 WHERE id = $1",
            &[&token_id, &now],
        )
        .await?;
        Ok(())
    }

    /// Resolve an agent token hash to its tenant.
    pub async fn lookup_agent_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT tenant_id FROM agent_tokens \
                 WHERE token_hash = $1 AND revoked_at IS NULL \
                   AND (expires_at IS NULL OR expires_at > $2)",
                &[&token_hash, &now],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Register or refresh a worker node's presence row.
    pub async fn upsert_agent_node(
        &self,
        tenant_id: i64,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO agent_nodes (tenant_id, node_id, last_heartbeat, created_at, updated_at) \
             VALUES ($1, $2, $3, $3, $3) \
             ON CONFLICT (node_id) DO UPDATE \
             SET last_heartbeat = EXCLUDED.last_heartbeat, status = 'online', \
                 updated_at = EXCLUDED.updated_at",
            &[&tenant_id, &node_id, &now],
        )
        .await?;
        Ok(())
    }
}

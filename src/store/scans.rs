//! Interactive scan-session queries: creation, lease reconciliation with the
//! attempts cap, phase/choice updates, and the sweeper's timeout scans.

use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use crate::error::DatabaseError;
use crate::models::{ScanSession, ScanStatus, scan_phase};
use crate::store::Store;

const SCAN_COLUMNS: &str = "id, tenant_id, user_id, login_id, status, phase, leased_by_node, \
     lease_until, screenshots, user_choice, error_message, attempts, max_attempts, \
     user_heartbeat, created_at, updated_at";

fn scan_from_row(row: &Row) -> ScanSession {
    let status: String = row.get("status");
    ScanSession {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        user_id: row.get("user_id"),
        login_id: row.get("login_id"),
        status: ScanStatus::parse(&status).unwrap_or(ScanStatus::Pending),
        phase: row.get("phase"),
        leased_by_node: row.get("leased_by_node"),
        lease_until: row.get("lease_until"),
        screenshots: row.get("screenshots"),
        user_choice: row.get("user_choice"),
        error_message: row.get("error_message"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        user_heartbeat: row.get("user_heartbeat"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// One session repaired by lease-expiry reconciliation.
#[derive(Debug, Clone)]
pub struct ExpiredScanLease {
    pub id: i64,
    pub user_id: i64,
    /// True when the session hit its attempts bound and was expired instead
    /// of requeued.
    pub expired: bool,
}

/// Result of an agent `fail` report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFailOutcome {
    /// Returned to the queue for another attempt.
    Requeued,
    /// Attempts exhausted; terminally failed.
    Failed,
}

impl Store {
    pub async fn create_scan_session(
        &self,
        tenant_id: i64,
        user_id: i64,
        login_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO scan_sessions \
                 (tenant_id, user_id, login_id, status, phase, created_at, updated_at) \
                 VALUES ($1, $2, $3, 'pending', 'waiting', $4, $4) \
                 RETURNING id",
                &[&tenant_id, &user_id, &login_id, &now],
            )
            .await?;
        Ok(row.get(0))
    }

    pub async fn count_active_scans_for_user(&self, user_id: i64) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM scan_sessions \
                 WHERE user_id = $1 AND status IN ('pending', 'leased', 'running')",
                &[&user_id],
            )
            .await?;
        Ok(row.get(0))
    }

    pub async fn latest_active_scan_for_user(
        &self,
        user_id: i64,
    ) -> Result<Option<ScanSession>, DatabaseError> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM scan_sessions \
             WHERE user_id = $1 AND status NOT IN ('success', 'failed', 'cancelled', 'expired') \
             ORDER BY id DESC LIMIT 1"
        );
        let row = conn.query_opt(sql.as_str(), &[&user_id]).await?;
        Ok(row.as_ref().map(scan_from_row))
    }

    /// Queue position: pending sessions with a lower id, plus one.
    pub async fn scan_queue_position(&self, session_id: i64) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM scan_sessions WHERE status = 'pending' AND id < $1",
                &[&session_id],
            )
            .await?;
        let ahead: i64 = row.get(0);
        Ok(ahead + 1)
    }

    pub async fn scan_by_id(&self, id: i64) -> Result<Option<ScanSession>, DatabaseError> {
        let conn = self.conn().await?;
        let sql = format!("SELECT {SCAN_COLUMNS} FROM scan_sessions WHERE id = $1");
        let row = conn.query_opt(sql.as_str(), &[&id]).await?;
        Ok(row.as_ref().map(scan_from_row))
    }

    pub async fn scan_for_user(
        &self,
        id: i64,
        user_id: i64,
    ) -> Result<Option<ScanSession>, DatabaseError> {
        let conn = self.conn().await?;
        let sql = format!("SELECT {SCAN_COLUMNS} FROM scan_sessions WHERE id = $1 AND user_id = $2");
        let row = conn.query_opt(sql.as_str(), &[&id, &user_id]).await?;
        Ok(row.as_ref().map(scan_from_row))
    }

    /// Merge one `choice_type → value` pair into the stored choice document
    /// under a row lock.
    pub async fn merge_scan_choice(
        &self,
        id: i64,
        choice_type: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt(
                "SELECT user_choice FROM scan_sessions WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?;
        let Some(row) = row else {
            return Ok(());
        };
        let mut choices: serde_json::Value = row.get("user_choice");
        if !choices.is_object() {
            choices = serde_json::json!({});
        }
        choices[choice_type] = serde_json::Value::String(value.to_string());
        tx.execute(
            "UPDATE scan_sessions SET user_choice = $2, updated_at = $3 WHERE id = $1",
            &[&id, &choices, &now],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn cancel_scan(
        &self,
        id: i64,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE scan_sessions \
             SET status = 'cancelled', error_message = $2, updated_at = $3 WHERE id = $1",
            &[&id, &message, &now],
        )
        .await?;
        Ok(())
    }

    pub async fn set_scan_user_heartbeat(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE scan_sessions SET user_heartbeat = $2, updated_at = $2 WHERE id = $1",
            &[&id, &now],
        )
        .await?;
        Ok(())
    }

    /// Repair sessions whose lease expired. Unlike standard jobs this DOES
    /// branch on the attempts bound: exhausted sessions go to `expired`,
    /// others return to `pending`/`waiting`. Tenant-scoped from the agent
    /// poll path, global from the sweeper.
    pub async fn reset_expired_scan_leases(
        &self,
        tenant_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExpiredScanLease>, DatabaseError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        let rows = match tenant_id {
            Some(tenant_id) => {
                tx.query(
                    "SELECT id, user_id, attempts, max_attempts FROM scan_sessions \
                     WHERE tenant_id = $1 AND status IN ('leased', 'running') \
                       AND lease_until IS NOT NULL AND lease_until < $2 \
                     FOR UPDATE",
                    &[&tenant_id, &now],
                )
                .await?
            }
            None => {
                tx.query(
                    "SELECT id, user_id, attempts, max_attempts FROM scan_sessions \
                     WHERE status IN ('leased', 'running') \
                       AND lease_until IS NOT NULL AND lease_until < $1 \
                     FOR UPDATE",
                    &[&now],
                )
                .await?
            }
        };

        let mut repaired = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.get("id");
            let user_id: i64 = row.get("user_id");
            let attempts: i32 = row.get("attempts");
            let max_attempts: i32 = row.get("max_attempts");
            let expired = attempts + 1 >= max_attempts;
            if expired {
                tx.execute(
                    "UPDATE scan_sessions \
                     SET status = 'expired', error_message = 'lease timed out', \
                         leased_by_node = NULL, lease_until = NULL, \
                         attempts = attempts + 1, updated_at = $2 \
                     WHERE id = $1",
                    &[&id, &now],
                )
                .await?;
            } else {
                tx.execute(
                    "UPDATE scan_sessions \
                     SET status = 'pending', phase = 'waiting', \
                         leased_by_node = NULL, lease_until = NULL, \
                         attempts = attempts + 1, updated_at = $2 \
                     WHERE id = $1",
                    &[&id, &now],
                )
                .await?;
            }
            repaired.push(ExpiredScanLease { id, user_id, expired });
        }

        tx.commit().await?;
        Ok(repaired)
    }

    /// Oldest-first pending sessions, skipping rows locked by a concurrent
    /// poller.
    pub async fn claim_scan_candidates(
        &self,
        tenant_id: i64,
        limit: i64,
    ) -> Result<Vec<ScanSession>, DatabaseError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;
        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM scan_sessions \
             WHERE tenant_id = $1 AND status = 'pending' \
             ORDER BY created_at ASC LIMIT $2 \
             FOR UPDATE SKIP LOCKED"
        );
        let rows = tx.query(sql.as_str(), &[&tenant_id, &limit]).await?;
        tx.commit().await?;
        Ok(rows.iter().map(scan_from_row).collect())
    }

    /// Conditional `pending` → `leased` transition for a scan session.
    pub async fn mark_scan_leased(
        &self,
        id: i64,
        node_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "UPDATE scan_sessions \
                 SET status = 'leased', leased_by_node = $2, lease_until = $3, updated_at = $4 \
                 WHERE id = $1 AND status = 'pending'",
                &[&id, &node_id, &lease_until, &now],
            )
            .await?;
        Ok(affected > 0)
    }

    pub async fn start_scan(&self, id: i64, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE scan_sessions SET status = 'running', phase = $2, updated_at = $3 \
             WHERE id = $1",
            &[&id, &scan_phase::LAUNCHING, &now],
        )
        .await?;
        Ok(())
    }

    /// Record a phase transition, merging an optional screenshot into the
    /// stored map under the caller-supplied key.
    pub async fn set_scan_phase(
        &self,
        id: i64,
        phase: &str,
        screenshot: Option<(&str, &str)>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt(
                "SELECT screenshots FROM scan_sessions WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?;
        let Some(row) = row else {
            return Ok(());
        };
        let mut screenshots: serde_json::Value = row.get("screenshots");
        if !screenshots.is_object() {
            screenshots = serde_json::json!({});
        }
        if let Some((key, data)) = screenshot {
            screenshots[key] = serde_json::Value::String(data.to_string());
        }
        tx.execute(
            "UPDATE scan_sessions SET phase = $2, screenshots = $3, updated_at = $4 \
             WHERE id = $1",
            &[&id, &phase, &screenshots, &now],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn extend_scan_lease(
        &self,
        id: i64,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE scan_sessions SET lease_until = $2, updated_at = $3 WHERE id = $1",
            &[&id, &lease_until, &now],
        )
        .await?;
        Ok(())
    }

    pub async fn complete_scan(&self, id: i64, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE scan_sessions SET status = 'success', phase = $2, updated_at = $3 \
             WHERE id = $1",
            &[&id, &scan_phase::DONE, &now],
        )
        .await?;
        Ok(())
    }

    /// Record an agent failure, requeuing while attempts remain.
    pub async fn fail_scan(
        &self,
        id: i64,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanFailOutcome>, DatabaseError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt(
                "SELECT attempts, max_attempts FROM scan_sessions WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let attempts: i32 = row.get("attempts");
        let max_attempts: i32 = row.get("max_attempts");
        let outcome = if attempts + 1 < max_attempts {
            tx.execute(
                "UPDATE scan_sessions \
                 SET status = 'pending', phase = 'waiting', attempts = attempts + 1, \
                     error_message = $2, leased_by_node = NULL, lease_until = NULL, \
                     updated_at = $3 \
                 WHERE id = $1",
                &[&id, &error_message, &now],
            )
            .await?;
            ScanFailOutcome::Requeued
        } else {
            tx.execute(
                "UPDATE scan_sessions \
                 SET status = 'failed', attempts = attempts + 1, error_message = $2, \
                     leased_by_node = NULL, lease_until = NULL, updated_at = $3 \
                 WHERE id = $1",
                &[&id, &error_message, &now],
            )
            .await?;
            ScanFailOutcome::Failed
        };
        tx.commit().await?;
        Ok(Some(outcome))
    }

    /// Running sessions whose user heartbeat fell silent before `cutoff`.
    pub async fn scans_without_user_heartbeat(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ScanSession>, DatabaseError> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM scan_sessions \
             WHERE status = 'running' AND user_heartbeat IS NOT NULL AND user_heartbeat < $1"
        );
        let rows = conn.query(sql.as_str(), &[&cutoff]).await?;
        Ok(rows.iter().map(scan_from_row).collect())
    }

    /// Force-expire any non-terminal session created before `cutoff`,
    /// regardless of lease state. Returns the number expired.
    pub async fn expire_overage_scans(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "UPDATE scan_sessions \
                 SET status = 'expired', error_message = 'session exceeded maximum age', \
                     updated_at = $2 \
                 WHERE status IN ('pending', 'leased', 'running') AND created_at < $1",
                &[&cutoff, &now],
            )
            .await?;
        Ok(affected)
    }
}

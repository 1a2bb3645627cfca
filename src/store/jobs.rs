//! Standard-job queries: lease reconciliation, claiming, and agent reports.
//!
//! Every mutation of a leased row is conditional — either on the prior status
//! (`pending` → `leased`) or on the recorded leaseholder — so a worker that
//! lost its lease can never overwrite another worker's transition.

use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use crate::error::DatabaseError;
use crate::models::{JobStatus, TaskJob};
use crate::store::Store;

/// The per-job calls an agent makes after claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobReport {
    Start,
    Heartbeat,
    Complete,
    Fail,
}

impl JobReport {
    pub fn event_type(&self) -> &'static str {
        match self {
            JobReport::Start => "start",
            JobReport::Heartbeat => "heartbeat",
            JobReport::Complete => "success",
            JobReport::Fail => "fail",
        }
    }

    /// Whether this report extends the durable lease expiry.
    pub fn extends_lease(&self) -> bool {
        matches!(self, JobReport::Start | JobReport::Heartbeat)
    }

    /// Whether this report ends the job and releases the lease.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobReport::Complete | JobReport::Fail)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobReportError {
    #[error("job not found")]
    NotFound,

    #[error("node does not own this job")]
    NotOwner,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<tokio_postgres::Error> for JobReportError {
    fn from(e: tokio_postgres::Error) -> Self {
        JobReportError::Database(DatabaseError::Query(e))
    }
}

const JOB_COLUMNS: &str = "id, tenant_id, user_id, task_type, payload, priority, scheduled_at, \
     status, leased_by_node, lease_until, attempts, max_attempts, created_at, updated_at";

fn job_from_row(row: &Row) -> TaskJob {
    let status: String = row.get("status");
    TaskJob {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        user_id: row.get("user_id"),
        task_type: row.get("task_type"),
        payload: row.get("payload"),
        priority: row.get("priority"),
        scheduled_at: row.get("scheduled_at"),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        leased_by_node: row.get("leased_by_node"),
        lease_until: row.get("lease_until"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl Store {
    /// Insert a fresh pending job (used by the schedule generator).
    pub async fn create_job(
        &self,
        tenant_id: i64,
        user_id: i64,
        task_type: &str,
        payload: &serde_json::Value,
        priority: i32,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO task_jobs \
                 (tenant_id, user_id, task_type, payload, priority, scheduled_at, status, \
                  max_attempts, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $6, $6) \
                 RETURNING id",
                &[
                    &tenant_id,
                    &user_id,
                    &task_type,
                    payload,
                    &priority,
                    &now,
                    &max_attempts,
                ],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Requeue every job of this tenant whose lease expired: increment
    /// attempts, clear the leaseholder, return to pending, and record a
    /// `requeued` event. Returns the affected job ids so the caller can clear
    /// the matching ephemeral leases.
    ///
    /// Deliberately does NOT cap on `max_attempts` — that asymmetry with the
    /// scan-session sweep mirrors the observed production behavior.
    pub async fn reset_expired_job_leases(
        &self,
        tenant_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, DatabaseError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        let rows = tx
            .query(
                "UPDATE task_jobs \
                 SET status = 'pending', leased_by_node = NULL, lease_until = NULL, \
                     attempts = attempts + 1, updated_at = $2 \
                 WHERE tenant_id = $1 AND status IN ('leased', 'running') \
                   AND lease_until IS NOT NULL AND lease_until < $2 \
                 RETURNING id",
                &[&tenant_id, &now],
            )
            .await?;
        let ids: Vec<i64> = rows.iter().map(|r| r.get(0)).collect();

        for id in &ids {
            tx.execute(
                "INSERT INTO task_job_events (job_id, event_type, message, event_at) \
                 VALUES ($1, 'requeued', 'lease expired, returned to queue', $2)",
                &[id, &now],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Select up to `limit` due pending jobs, best first, skipping rows a
    /// concurrent claimer already has locked.
    pub async fn claim_candidates(
        &self,
        tenant_id: i64,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskJob>, DatabaseError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM task_jobs \
             WHERE tenant_id = $1 AND status = 'pending' AND scheduled_at <= $2 \
             ORDER BY priority DESC, scheduled_at ASC \
             LIMIT $3 \
             FOR UPDATE SKIP LOCKED"
        );
        let rows = tx.query(sql.as_str(), &[&tenant_id, &now, &limit]).await?;
        tx.commit().await?;
        Ok(rows.iter().map(job_from_row).collect())
    }

    /// Conditional `pending` → `leased` transition plus its event row.
    /// Returns false when the row was claimed by someone else in the
    /// meantime; the caller must then roll back its ephemeral acquisition.
    pub async fn mark_job_leased(
        &self,
        job_id: i64,
        node_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        let affected = tx
            .execute(
                "UPDATE task_jobs \
                 SET status = 'leased', leased_by_node = $2, lease_until = $3, updated_at = $4 \
                 WHERE id = $1 AND status = 'pending'",
                &[&job_id, &node_id, &lease_until, &now],
            )
            .await?;
        if affected == 0 {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO task_job_events (job_id, event_type, message, event_at) \
             VALUES ($1, 'leased', $2, $3)",
            &[&job_id, &format!("claimed by node {}", node_id), &now],
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn job_by_id(&self, job_id: i64) -> Result<Option<TaskJob>, DatabaseError> {
        let conn = self.conn().await?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM task_jobs WHERE id = $1");
        let row = conn.query_opt(sql.as_str(), &[&job_id]).await?;
        Ok(row.as_ref().map(job_from_row))
    }

    /// Apply an agent report under a row lock and an explicit leaseholder
    /// check, independent of the ephemeral-lease gate the handler already
    /// passed. Appends one event row per report.
    pub async fn apply_job_report(
        &self,
        tenant_id: i64,
        job_id: i64,
        node_id: &str,
        report: JobReport,
        message: &str,
        error_code: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), JobReportError> {
        let mut client = self.conn().await.map_err(JobReportError::Database)?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT leased_by_node FROM task_jobs \
                 WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
                &[&job_id, &tenant_id],
            )
            .await?;
        let Some(row) = row else {
            return Err(JobReportError::NotFound);
        };
        let holder: Option<String> = row.get("leased_by_node");
        if holder.as_deref() != Some(node_id) {
            return Err(JobReportError::NotOwner);
        }

        match report {
            JobReport::Start => {
                tx.execute(
                    "UPDATE task_jobs SET status = 'running', lease_until = $2, updated_at = $3 \
                     WHERE id = $1",
                    &[&job_id, &lease_until, &now],
                )
                .await?;
            }
            JobReport::Heartbeat => {
                tx.execute(
                    "UPDATE task_jobs SET lease_until = $2, updated_at = $3 WHERE id = $1",
                    &[&job_id, &lease_until, &now],
                )
                .await?;
            }
            JobReport::Complete => {
                tx.execute(
                    "UPDATE task_jobs SET status = 'success', updated_at = $2 WHERE id = $1",
                    &[&job_id, &now],
                )
                .await?;
            }
            JobReport::Fail => {
                tx.execute(
                    "UPDATE task_jobs \
                     SET status = 'failed', attempts = attempts + 1, updated_at = $2 \
                     WHERE id = $1",
                    &[&job_id, &now],
                )
                .await?;
            }
        }

        tx.execute(
            "INSERT INTO task_job_events (job_id, event_type, message, error_code, event_at) \
             VALUES ($1, $2, $3, $4, $5)",
            &[&job_id, &report.event_type(), &message, &error_code, &now],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Count of still-active jobs per `(user, task type)`, used to enforce
    /// the one-active-job rule during generation.
    pub async fn count_active_jobs(
        &self,
        tenant_id: i64,
        user_id: i64,
        task_type: &str,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM task_jobs \
                 WHERE tenant_id = $1 AND user_id = $2 AND task_type = $3 \
                   AND status IN ('pending', 'leased', 'running')",
                &[&tenant_id, &user_id, &task_type],
            )
            .await?;
        Ok(row.get(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_kinds() {
        assert_eq!(JobReport::Start.event_type(), "start");
        assert_eq!(JobReport::Complete.event_type(), "success");
        assert!(JobReport::Start.extends_lease());
        assert!(JobReport::Heartbeat.extends_lease());
        assert!(!JobReport::Complete.extends_lease());
        assert!(JobReport::Complete.is_terminal());
        assert!(JobReport::Fail.is_terminal());
        assert!(!JobReport::Heartbeat.is_terminal());
    }
}

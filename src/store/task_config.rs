//! Per-user task-configuration documents.
//!
//! The document is shared mutable state between the generator and the
//! user-facing endpoints, so every persisted mutation bumps the version
//! counter, and read-modify-write merges hold the row lock for the duration.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::models::TaskConfigDoc;
use crate::store::Store;

fn doc_from_row(row: &tokio_postgres::Row) -> TaskConfigDoc {
    let config: serde_json::Value = row.get("task_config");
    TaskConfigDoc {
        id: row.get("id"),
        user_id: row.get("user_id"),
        config: config.as_object().cloned().unwrap_or_default(),
        version: row.get("version"),
    }
}

impl Store {
    pub async fn task_config_for_user(
        &self,
        user_id: i64,
    ) -> Result<Option<TaskConfigDoc>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, user_id, task_config, version FROM user_task_configs \
                 WHERE user_id = $1",
                &[&user_id],
            )
            .await?;
        Ok(row.as_ref().map(doc_from_row))
    }

    /// Bulk preload for a generation cycle: one query for all scanned users.
    pub async fn task_configs_for_users(
        &self,
        user_ids: &[i64],
    ) -> Result<HashMap<i64, TaskConfigDoc>, DatabaseError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, user_id, task_config, version FROM user_task_configs \
                 WHERE user_id = ANY($1)",
                &[&user_ids],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let doc = doc_from_row(row);
                (doc.user_id, doc)
            })
            .collect())
    }

    /// Bulk preload of still-active job counts per `(user, task type)`.
    pub async fn active_job_counts(
        &self,
        user_ids: &[i64],
    ) -> Result<HashMap<(i64, String), i64>, DatabaseError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT user_id, task_type, COUNT(*) AS active FROM task_jobs \
                 WHERE user_id = ANY($1) AND status IN ('pending', 'leased', 'running') \
                 GROUP BY user_id, task_type",
                &[&user_ids],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let user_id: i64 = row.get("user_id");
                let task_type: String = row.get("task_type");
                let active: i64 = row.get("active");
                ((user_id, task_type), active)
            })
            .collect())
    }

    /// Persist a rewritten document, bumping the version counter.
    pub async fn save_task_config(
        &self,
        doc_id: i64,
        config: &serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let value = serde_json::Value::Object(config.clone());
        conn.execute(
            "UPDATE user_task_configs \
             SET task_config = $2, updated_at = $3, version = version + 1 \
             WHERE id = $1",
            &[&doc_id, &value, &now],
        )
        .await?;
        Ok(())
    }

    /// Rewrite one task's `next_time` under the row lock, bumping the
    /// version. Used by the post-report reschedule path.
    pub async fn update_task_next_time(
        &self,
        user_id: i64,
        task_type: &str,
        next_time: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt(
                "SELECT id, task_config FROM user_task_configs WHERE user_id = $1 FOR UPDATE",
                &[&user_id],
            )
            .await?;
        let Some(row) = row else {
            return Ok(());
        };
        let doc_id: i64 = row.get("id");
        let mut config: serde_json::Value = row.get("task_config");
        let Some(task) = config.get_mut(task_type).and_then(|t| t.as_object_mut()) else {
            return Ok(());
        };
        task.insert(
            "next_time".to_string(),
            serde_json::Value::String(next_time.to_string()),
        );
        tx.execute(
            "UPDATE user_task_configs \
             SET task_config = $2, updated_at = $3, version = version + 1 \
             WHERE id = $1",
            &[&doc_id, &config, &now],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

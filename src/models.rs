//! Row types and status/phase vocabularies for the durable store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const USER_STATUS_ACTIVE: &str = "active";

/// Coarse lifecycle of a standard task job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Leased,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Leased => "leased",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "leased" => Some(JobStatus::Leased),
            "running" => Some(JobStatus::Running),
            "success" => Some(JobStatus::Success),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Coarse lifecycle of an interactive scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Leased,
    Running,
    Success,
    Failed,
    Cancelled,
    Expired,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Leased => "leased",
            ScanStatus::Running => "running",
            ScanStatus::Success => "success",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
            ScanStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ScanStatus::Pending),
            "leased" => Some(ScanStatus::Leased),
            "running" => Some(ScanStatus::Running),
            "success" => Some(ScanStatus::Success),
            "failed" => Some(ScanStatus::Failed),
            "cancelled" => Some(ScanStatus::Cancelled),
            "expired" => Some(ScanStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Success | ScanStatus::Failed | ScanStatus::Cancelled | ScanStatus::Expired
        )
    }
}

/// Fine-grained step of the human-in-the-loop scan flow, orthogonal to status.
pub mod scan_phase {
    pub const WAITING: &str = "waiting";
    pub const LAUNCHING: &str = "launching";
    pub const CHOOSE_SYSTEM: &str = "choose_system";
    pub const CHOOSE_ZONE: &str = "choose_zone";
    pub const CHOOSE_ROLE: &str = "choose_role";
    pub const DONE: &str = "done";
}

/// A tenant-visible automation account.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub account_no: String,
    pub tenant_id: i64,
    pub login_id: String,
    pub user_type: String,
    pub status: String,
    pub username: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub notify_config: serde_json::Value,
}

/// A queued unit of remote work.
#[derive(Debug, Clone, Serialize)]
pub struct TaskJob {
    pub id: i64,
    pub tenant_id: i64,
    pub user_id: i64,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub status: JobStatus,
    pub leased_by_node: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-user task-configuration document with its optimistic version counter.
#[derive(Debug, Clone)]
pub struct TaskConfigDoc {
    pub id: i64,
    pub user_id: i64,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub version: i32,
}

/// An interactive login-scan session.
#[derive(Debug, Clone)]
pub struct ScanSession {
    pub id: i64,
    pub tenant_id: i64,
    pub user_id: i64,
    pub login_id: String,
    pub status: ScanStatus,
    pub phase: String,
    pub leased_by_node: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub screenshots: serde_json::Value,
    pub user_choice: serde_json::Value,
    pub error_message: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub user_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Leased,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn scan_terminal_statuses() {
        assert!(ScanStatus::Success.is_terminal());
        assert!(ScanStatus::Expired.is_terminal());
        assert!(!ScanStatus::Running.is_terminal());
        assert!(!ScanStatus::Pending.is_terminal());
    }
}

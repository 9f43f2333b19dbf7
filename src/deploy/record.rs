//! Deployment records and their state machine
//!
//! ```text
//! pending -> running -> completed
//!    |          |
//!    +----------+--> failed -> rolling_back -> completed | rollback_failed
//! ```

use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::schema::VersionNumber;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RollingBack,
    RollbackFailed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RollingBack => "rolling_back",
            DeploymentStatus::RollbackFailed => "rollback_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let status = match value {
            "pending" => DeploymentStatus::Pending,
            "running" => DeploymentStatus::Running,
            "completed" => DeploymentStatus::Completed,
            "failed" => DeploymentStatus::Failed,
            "rolling_back" => DeploymentStatus::RollingBack,
            "rollback_failed" => DeploymentStatus::RollbackFailed,
            _ => return None,
        };
        Some(status)
    }

    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, RollingBack)
                | (RollingBack, Completed)
                | (RollingBack, RollbackFailed)
        )
    }

    /// States a finished deployment can rest in
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Completed | DeploymentStatus::Failed | DeploymentStatus::RollbackFailed
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt to apply a migration to a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    pub schema_version: Option<VersionNumber>,
    pub forward_sql: String,
    pub status: DeploymentStatus,
    pub backup_id: Option<Uuid>,
    pub rolled_back: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl DeploymentRecord {
    pub fn new(project_id: Uuid, schema_version: Option<VersionNumber>, forward_sql: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            schema_version,
            forward_sql: forward_sql.into(),
            status: DeploymentStatus::Pending,
            backup_id: None,
            rolled_back: false,
            started_at: Utc::now(),
            completed_at: None,
            error_kind: None,
            error_message: None,
        }
    }

    /// Move to `next`, failing with `Conflict` on an illegal transition
    pub fn transition(&mut self, next: DeploymentStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Conflict(format!(
                "Deployment {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.completed_at = next.is_terminal().then(Utc::now);
        Ok(())
    }

    /// Record the error and move to `failed`
    pub fn fail(&mut self, error: &EngineError) -> EngineResult<()> {
        self.transition(DeploymentStatus::Failed)?;
        self.error_kind = Some(error.kind());
        self.error_message = Some(error.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_happy_path() {
        let mut record = DeploymentRecord::new(Uuid::new_v4(), None, "ALTER TABLE t ADD COLUMN x text;");
        assert_eq!(record.status, DeploymentStatus::Pending);
        assert_ok!(record.transition(DeploymentStatus::Running));
        assert_ok!(record.transition(DeploymentStatus::Completed));
        assert!(record.completed_at.is_some());
        assert!(record.status.is_terminal());
    }

    #[test]
    fn test_rollback_path() {
        let mut record = DeploymentRecord::new(Uuid::new_v4(), None, "");
        assert_ok!(record.transition(DeploymentStatus::Running));
        assert_ok!(record.fail(&EngineError::Execution("boom".to_string())));
        assert_eq!(record.error_kind, Some(ErrorKind::Execution));
        assert!(record.completed_at.is_some());
        assert_ok!(record.transition(DeploymentStatus::RollingBack));
        assert!(!record.status.is_terminal());
        assert!(record.completed_at.is_none());
        assert_ok!(record.transition(DeploymentStatus::RollbackFailed));
        assert!(record.status.is_terminal());
    }

    #[test]
    fn test_illegal_transitions_conflict() {
        let mut record = DeploymentRecord::new(Uuid::new_v4(), None, "");
        let err = assert_err!(record.transition(DeploymentStatus::Completed));
        assert_eq!(err.kind(), ErrorKind::Conflict);

        assert_ok!(record.transition(DeploymentStatus::Running));
        assert_ok!(record.transition(DeploymentStatus::Completed));
        assert_err!(record.transition(DeploymentStatus::RollingBack));
        assert_err!(record.transition(DeploymentStatus::Running));
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            DeploymentStatus::Pending,
            DeploymentStatus::Running,
            DeploymentStatus::Completed,
            DeploymentStatus::Failed,
            DeploymentStatus::RollingBack,
            DeploymentStatus::RollbackFailed,
        ] {
            assert_eq!(DeploymentStatus::parse(status.as_str()), Some(status));
        }
    }
}

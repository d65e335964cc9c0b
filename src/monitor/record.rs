//! Progress records and the download status state machine
//!
//! A [`ProgressRecord`] is one reading of a remote task's progress, whether it
//! arrived as a push notification or came back from a poll.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a monitored task
///
/// ```text
/// pending ──► running ──► verifying ──► complete
///    │           │            │
///    └───────────┴────────────┴──► failed | cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Verifying,
    Complete,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses absorb every later observation
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Position along the forward chain; terminal statuses share the top rank
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Verifying => 2,
            Self::Complete | Self::Failed | Self::Cancelled => 3,
        }
    }

    /// Whether a stored status may be replaced by `next`.
    ///
    /// Forward skips are allowed (a poller can miss `verifying` entirely),
    /// staying in place is allowed, moving backward or out of a terminal
    /// status is not.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Verifying => write!(f, "verifying"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" | "downloading" => Ok(Self::Running),
            "verifying" => Ok(Self::Verifying),
            "complete" | "completed" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("Unknown status: {}", other)),
        }
    }
}

/// One observation of a task's progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Identifier of the tracked operation
    pub task_id: String,
    pub status: TaskStatus,
    /// Completion percentage, 0..=100
    pub percent: u8,
    /// Source-assigned ordering counter
    pub sequence: u64,
    /// Error text or stage name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProgressRecord {
    /// The record a store starts from before anything was observed
    pub fn initial(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            percent: 0,
            sequence: 0,
            detail: None,
        }
    }

    pub fn new(task_id: impl Into<String>, status: TaskStatus, percent: u8, sequence: u64) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            percent,
            sequence,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Checks the record is internally consistent.
    ///
    /// `percent == 100` if and only if the status is `complete`.
    pub fn validate(&self) -> Result<(), String> {
        if self.percent > 100 {
            return Err(format!("percent {} is out of range", self.percent));
        }
        match (self.status, self.percent) {
            (TaskStatus::Complete, 100) => Ok(()),
            (TaskStatus::Complete, p) => Err(format!("complete status with percent {}", p)),
            (status, 100) => Err(format!("percent 100 with non-complete status {}", status)),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ProgressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}% (seq {})",
            self.task_id, self.status, self.percent, self.sequence
        )?;
        if let Some(detail) = &self.detail {
            write!(f, " - {}", detail)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Verifying.is_terminal());
    }

    #[test]
    fn test_state_machine() {
        assert!(TaskStatus::Pending.can_advance_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_advance_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_advance_to(TaskStatus::Complete));
        assert!(TaskStatus::Verifying.can_advance_to(TaskStatus::Failed));
        assert!(TaskStatus::Pending.can_advance_to(TaskStatus::Cancelled));

        assert!(!TaskStatus::Verifying.can_advance_to(TaskStatus::Running));
        assert!(!TaskStatus::Running.can_advance_to(TaskStatus::Pending));
        assert!(!TaskStatus::Complete.can_advance_to(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_advance_to(TaskStatus::Failed));
    }

    #[test]
    fn test_validate() {
        assert!(ProgressRecord::new("m", TaskStatus::Complete, 100, 1).validate().is_ok());
        assert!(ProgressRecord::new("m", TaskStatus::Running, 55, 1).validate().is_ok());
        assert!(ProgressRecord::new("m", TaskStatus::Failed, 0, 1).validate().is_ok());

        assert!(ProgressRecord::new("m", TaskStatus::Complete, 90, 1).validate().is_err());
        assert!(ProgressRecord::new("m", TaskStatus::Running, 100, 1).validate().is_err());
        assert!(ProgressRecord::new("m", TaskStatus::Running, 101, 1).validate().is_err());
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("downloading".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
        assert_eq!("COMPLETE".parse::<TaskStatus>().unwrap(), TaskStatus::Complete);
        assert_eq!("canceled".parse::<TaskStatus>().unwrap(), TaskStatus::Cancelled);
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_record_serializes_lowercase_status() {
        let record = ProgressRecord::new("gemma3-1b", TaskStatus::Verifying, 95, 7);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "verifying");
        assert!(json.get("detail").is_none());
    }
}

//! Task types: the action kinds, the per-action payload, and the persisted row.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
#[allow(clippy::module_name_repetitions)]
pub enum TaskStatus {
    /// Waiting to be processed.
    Pending = 0,
    /// Completed; rows in this status are deleted rather than kept around.
    Done = 1,
    /// Failed at least once; eligible again once `next_retry_at` elapses.
    Retry = 2,
}

impl TaskStatus {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for TaskStatus {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Done),
            2 => Ok(Self::Retry),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

/// The action a task asks the worker to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskAction {
    Upload,
    Mkdir,
    Delete,
    Rename,
    Audit,
}

impl TaskAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "UPLOAD",
            Self::Mkdir => "MKDIR",
            Self::Delete => "DELETE",
            Self::Rename => "RENAME",
            Self::Audit => "AUDIT",
        }
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOAD" => Ok(Self::Upload),
            "MKDIR" => Ok(Self::Mkdir),
            "DELETE" => Ok(Self::Delete),
            "RENAME" => Ok(Self::Rename),
            "AUDIT" => Ok(Self::Audit),
            other => Err(format!("invalid task action: {other}")),
        }
    }
}

/// The tagged per-action payload. Stored as JSON in the `extra` column.
///
/// Each variant carries exactly the fields that action needs; an unknown
/// tag encountered while deserializing a stored row is a hard error (the
/// row is logged and skipped, never silently reinterpreted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TaskExtra {
    /// Payload for `UPLOAD` tasks: the fingerprint identifying the file's
    /// content and its modification time at enqueue time.
    Upload { md5: String, mtime: f64 },
    /// Payload for `MKDIR` tasks. No fields beyond the task's `rel_path`.
    Mkdir {},
    /// Payload for `DELETE` tasks: whether the deleted entry was a directory.
    Delete { is_dir: bool },
    /// Payload for `RENAME` tasks: the destination path (the task's own
    /// `rel_path` carries the source).
    Rename { new_path: String },
    /// Payload for `AUDIT` tasks: a free-standing log record of a raw
    /// filesystem event, independent of any content-sync task it may have
    /// also spawned.
    Audit {
        id: String,
        timestamp: String,
        machine_id: String,
        event: String,
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        old_path: Option<String>,
    },
}

impl TaskExtra {
    /// The action this payload shape belongs to.
    #[must_use]
    pub fn action(&self) -> TaskAction {
        match self {
            Self::Upload { .. } => TaskAction::Upload,
            Self::Mkdir {} => TaskAction::Mkdir,
            Self::Delete { .. } => TaskAction::Delete,
            Self::Rename { .. } => TaskAction::Rename,
            Self::Audit { .. } => TaskAction::Audit,
        }
    }
}

/// A single durable queue row, as read back from storage.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub action: String,
    pub local_path: String,
    pub rel_path: String,
    pub extra: String,
    pub status: i64,
    pub created_at: String,
    pub next_retry_at: String,
    pub retry_count: i64,
}

impl TaskRow {
    /// Parses the stored action string.
    ///
    /// # Errors
    /// Returns an error if the stored action tag is not one of the five
    /// known kinds.
    pub fn parsed_action(&self) -> Result<TaskAction, String> {
        self.action.parse()
    }

    /// Parses the stored `extra` JSON payload.
    ///
    /// # Errors
    /// Returns an error if the payload is not valid JSON or carries an
    /// unrecognized `kind` tag.
    pub fn parsed_extra(&self) -> Result<TaskExtra, serde_json::Error> {
        serde_json::from_str(&self.extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_action_round_trips_through_str() {
        for action in [
            TaskAction::Upload,
            TaskAction::Mkdir,
            TaskAction::Delete,
            TaskAction::Rename,
            TaskAction::Audit,
        ] {
            let parsed: TaskAction = action.as_str().parse().unwrap();
            assert_eq!(parsed, action);
        }
    }

    fn parse_eq(action: TaskAction) -> bool {
        matches!(
            (action, action.as_str()),
            (TaskAction::Upload, "UPLOAD")
                | (TaskAction::Mkdir, "MKDIR")
                | (TaskAction::Delete, "DELETE")
                | (TaskAction::Rename, "RENAME")
                | (TaskAction::Audit, "AUDIT")
        )
    }

    #[test]
    fn task_action_str_matches_action() {
        for action in [
            TaskAction::Upload,
            TaskAction::Mkdir,
            TaskAction::Delete,
            TaskAction::Rename,
            TaskAction::Audit,
        ] {
            assert!(parse_eq(action));
        }
    }

    #[test]
    fn upload_extra_serializes_with_kind_tag() {
        let extra = TaskExtra::Upload {
            md5: "abc123".to_string(),
            mtime: 1_700_000_000.5,
        };
        let json = serde_json::to_string(&extra).unwrap();
        assert!(json.contains("\"kind\":\"Upload\""));
        let back: TaskExtra = serde_json::from_str(&json).unwrap();
        assert_eq!(back, extra);
        assert_eq!(back.action(), TaskAction::Upload);
    }

    #[test]
    fn unknown_extra_kind_fails_to_parse() {
        let row = TaskRow {
            id: 1,
            action: "UPLOAD".to_string(),
            local_path: String::new(),
            rel_path: String::new(),
            extra: "{\"kind\":\"SomethingElse\"}".to_string(),
            status: 0,
            created_at: String::new(),
            next_retry_at: String::new(),
            retry_count: 0,
        };
        assert!(row.parsed_extra().is_err());
    }

    #[test]
    fn invalid_status_code_is_rejected() {
        assert!(TaskStatus::try_from(99).is_err());
        assert_eq!(TaskStatus::try_from(0).unwrap(), TaskStatus::Pending);
    }
}

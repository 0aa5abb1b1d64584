// Parsing task lifecycle

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a menu parsing task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsingTaskStatus {
    /// Created and published, waiting for a worker
    Queued,
    /// A worker picked the task up
    Processing,
    /// Menu persisted; `menu_id` is set
    Completed,
    /// Terminal failure; `error_message` explains why
    Failed,
}

impl ParsingTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParsingTaskStatus::Queued => "queued",
            ParsingTaskStatus::Processing => "processing",
            ParsingTaskStatus::Completed => "completed",
            ParsingTaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ParsingTaskStatus::Queued),
            "processing" => Some(ParsingTaskStatus::Processing),
            "completed" => Some(ParsingTaskStatus::Completed),
            "failed" => Some(ParsingTaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ParsingTaskStatus::Completed | ParsingTaskStatus::Failed
        )
    }
}

impl fmt::Display for ParsingTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to turn a spreadsheet into a menu
///
/// `menu_id` is set if and only if `status` is [`ParsingTaskStatus::Completed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsingTask {
    pub id: Uuid,
    pub status: ParsingTaskStatus,
    pub spreadsheet_id: String,
    pub restaurant_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub menu_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParsingTask {
    /// Create a new queued task
    pub fn new(spreadsheet_id: impl Into<String>, restaurant_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            status: ParsingTaskStatus::Queued,
            spreadsheet_id: spreadsheet_id.into(),
            restaurant_name: restaurant_name.into(),
            menu_id: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a non-completing status change.
    ///
    /// The error message is only replaced when a non-empty one is given.
    /// Returns `false` for `Completed`, which requires a menu id.
    pub fn transition(&mut self, status: ParsingTaskStatus, error_message: Option<&str>) -> bool {
        if status == ParsingTaskStatus::Completed {
            return false;
        }
        self.status = status;
        self.menu_id = None;
        if let Some(message) = error_message.filter(|m| !m.is_empty()) {
            self.error_message = Some(message.to_string());
        }
        self.updated_at = Utc::now();
        true
    }

    /// Mark the task completed with the menu it produced
    pub fn complete(&mut self, menu_id: Uuid) {
        self.status = ParsingTaskStatus::Completed;
        self.menu_id = Some(menu_id);
        self.updated_at = Utc::now();
    }

    pub fn is_consistent(&self) -> bool {
        (self.status == ParsingTaskStatus::Completed) == self.menu_id.is_some()
    }
}

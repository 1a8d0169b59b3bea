// change-ledger-rs/src/model.rs
// Records kept by the change ledger.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
    Refactor,
    Fix,
    Feature,
    Optimization,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeType::Create => "CREATE",
            ChangeType::Modify => "MODIFY",
            ChangeType::Delete => "DELETE",
            ChangeType::Refactor => "REFACTOR",
            ChangeType::Fix => "FIX",
            ChangeType::Feature => "FEATURE",
            ChangeType::Optimization => "OPTIMIZATION",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeStatus {
    Proposed,
    Tested,
    Applied,
    RolledBack,
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeStatus::Proposed => "PROPOSED",
            ChangeStatus::Tested => "TESTED",
            ChangeStatus::Applied => "APPLIED",
            ChangeStatus::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

/// Pointer into the content-addressed snapshot store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    /// Hex SHA-256 of the content, also its file name in the store
    pub checksum: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeChange {
    pub id: Uuid,
    pub proposal_id: Option<Uuid>,
    pub file_path: PathBuf,
    pub description: String,
    pub change_type: ChangeType,
    /// Content before the change; `None` when the file did not exist
    pub before_snapshot: Option<SnapshotRef>,
    pub after_snapshot: Option<SnapshotRef>,
    /// SHA-256 of the before content (of empty content when absent)
    pub checksum: String,
    pub status: ChangeStatus,
    #[serde(default)]
    pub tests_generated: Vec<String>,
    pub tests_passed: Option<bool>,
    /// Finalized without passing tests
    #[serde(default)]
    pub needs_review: bool,
    pub rollback_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

/// What a ledger line records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEvent {
    Tracked,
    Finalized,
    Applied,
    RolledBack,
}

/// Outcome of the implementer's verification step
#[derive(Debug, Clone, Default)]
pub struct Finalization {
    pub tests_generated: Vec<String>,
    pub tests_passed: Option<bool>,
    pub after_content: Vec<u8>,
}

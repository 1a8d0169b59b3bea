// change-ledger-rs/src/lib.rs
// Append-only ledger of code changes produced by delegated improvements.
//
// This crate provides an in-process tracker with strong invariants:
//
// - Every mutation appends a line to a SHA-256 hash-chained log; nothing
//   already written is modified.
// - File bodies before and after a change are kept in a content-addressed
//   snapshot store so any change can be rolled back byte-for-byte.
// - Public API:
//     * CodeChangeTracker::track
//     * CodeChangeTracker::finalize
//     * CodeChangeTracker::apply
//     * CodeChangeTracker::rollback
//     * CodeChangeTracker::generate_changelog / statistics

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use config_rs::LedgerSettings;
use error_handling_rs::{Error, ErrorKind};
use metrics::increment_counter;
use uuid::Uuid;

mod chain;
pub mod model;
pub mod report;
mod snapshot;

#[cfg(test)]
mod tests;

pub use crate::chain::{LedgerEntry, GENESIS_HASH};
pub use crate::model::{ChangeEvent, ChangeStatus, ChangeType, CodeChange, Finalization, SnapshotRef};
pub use crate::report::ChangeStatistics;

use crate::chain::{sha256_hex, ChainLog};
use crate::snapshot::SnapshotStore;

const LOG_FILE: &str = "changes.ndjson";
const SNAPSHOT_DIR: &str = "snapshots";
const CHANGELOG_FILE: &str = "CHANGELOG.md";

/// Errors produced by the ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("ledger integrity violation: {0}")]
    Integrity(String),

    #[error("unknown change {0}")]
    NotFound(Uuid),

    #[error("cannot {action} change in status {status}")]
    InvalidTransition {
        action: &'static str,
        status: ChangeStatus,
    },

    #[error("change {0} has no before snapshot to restore")]
    NoBeforeSnapshot(Uuid),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        let kind = match &err {
            LedgerError::Io(_) | LedgerError::Serde(_) | LedgerError::Integrity(_) => {
                ErrorKind::Storage
            }
            LedgerError::InvalidTransition { .. } | LedgerError::NoBeforeSnapshot(_) => {
                ErrorKind::InvalidStateTransition
            }
            LedgerError::InvalidInput(_) => ErrorKind::InputValidation,
            LedgerError::NotFound(_) => ErrorKind::Internal,
        };
        Error::new(kind, err.to_string()).service("change_ledger")
    }
}

struct LedgerState {
    log: ChainLog,
    changes: HashMap<Uuid, CodeChange>,
    order: Vec<Uuid>,
}

impl LedgerState {
    fn change(&self, id: Uuid) -> Result<&CodeChange, LedgerError> {
        self.changes.get(&id).ok_or(LedgerError::NotFound(id))
    }

    /// Appends `change` to the log, then makes it the current record.
    fn record(&mut self, event: ChangeEvent, change: CodeChange) -> Result<CodeChange, LedgerError> {
        self.log.append(event, &change)?;
        if !self.changes.contains_key(&change.id) {
            self.order.push(change.id);
        }
        self.changes.insert(change.id, change.clone());
        Ok(change)
    }

    fn ordered(&self) -> impl Iterator<Item = &CodeChange> {
        self.order.iter().filter_map(|id| self.changes.get(id))
    }
}

/// Tracks, finalizes, applies and rolls back code changes.
pub struct CodeChangeTracker {
    dir: PathBuf,
    snapshots: SnapshotStore,
    // One writer at a time; the chain head lives inside.
    state: Mutex<LedgerState>,
}

impl CodeChangeTracker {
    /// Opens the ledger in `dir`, verifying the hash chain of any existing
    /// log and rebuilding the latest record per change.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let snapshots = SnapshotStore::open(dir.join(SNAPSHOT_DIR))?;
        let (log, entries) = ChainLog::open(&dir.join(LOG_FILE))?;

        let mut changes = HashMap::new();
        let mut order = Vec::new();
        for entry in entries {
            if !changes.contains_key(&entry.change.id) {
                order.push(entry.change.id);
            }
            changes.insert(entry.change.id, entry.change);
        }
        tracing::info!(
            dir = %dir.display(),
            changes = changes.len(),
            head = %log.head(),
            "Change ledger opened"
        );

        Ok(Self {
            dir,
            snapshots,
            state: Mutex::new(LedgerState {
                log,
                changes,
                order,
            }),
        })
    }

    pub fn from_settings(settings: &LedgerSettings) -> Result<Self, LedgerError> {
        Self::open(settings.dir.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts tracking a change to `file_path`, capturing its current
    /// content. A file that does not exist yet is always tracked as CREATE.
    pub fn track(
        &self,
        file_path: impl AsRef<Path>,
        description: &str,
        change_type: ChangeType,
        proposal_id: Option<Uuid>,
    ) -> Result<Uuid, LedgerError> {
        let file_path = file_path.as_ref().to_path_buf();
        if file_path.as_os_str().is_empty() {
            return Err(LedgerError::InvalidInput("file path must not be empty".into()));
        }

        let (before_snapshot, checksum, change_type) = match fs::read(&file_path) {
            Ok(content) => {
                let snapshot = self.snapshots.put(&content)?;
                let checksum = snapshot.checksum.clone();
                (Some(snapshot), checksum, change_type)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                (None, sha256_hex(b""), ChangeType::Create)
            }
            Err(err) => return Err(err.into()),
        };

        let now = Utc::now();
        let change = CodeChange {
            id: Uuid::new_v4(),
            proposal_id,
            file_path,
            description: description.to_string(),
            change_type,
            before_snapshot,
            after_snapshot: None,
            checksum,
            status: ChangeStatus::Proposed,
            tests_generated: Vec::new(),
            tests_passed: None,
            needs_review: false,
            rollback_reason: None,
            created_at: now,
            updated_at: now,
            finalized_at: None,
            applied_at: None,
            rolled_back_at: None,
        };

        let change = self.lock().record(ChangeEvent::Tracked, change)?;
        increment_counter!("ledger_changes_tracked_total", "type" => change.change_type.to_string());
        tracing::info!(
            change_id = %change.id,
            proposal_id = ?change.proposal_id,
            file = %change.file_path.display(),
            change_type = %change.change_type,
            "Change tracked"
        );
        Ok(change.id)
    }

    /// Records the generated content and its test outcome. The change
    /// becomes TESTED only when tests passed; otherwise it stays PROPOSED
    /// and is flagged for review.
    pub fn finalize(&self, change_id: Uuid, outcome: Finalization) -> Result<CodeChange, LedgerError> {
        let mut state = self.lock();
        let current = state.change(change_id)?;
        if current.status != ChangeStatus::Proposed {
            return Err(LedgerError::InvalidTransition {
                action: "finalize",
                status: current.status,
            });
        }

        let after = self.snapshots.put(&outcome.after_content)?;
        let passed = outcome.tests_passed == Some(true);
        let now = Utc::now();

        let mut next = current.clone();
        next.after_snapshot = Some(after);
        next.tests_generated = outcome.tests_generated;
        next.tests_passed = outcome.tests_passed;
        next.status = if passed {
            ChangeStatus::Tested
        } else {
            ChangeStatus::Proposed
        };
        next.needs_review = !passed;
        next.finalized_at = Some(now);
        next.updated_at = now;

        let change = state.record(ChangeEvent::Finalized, next)?;
        tracing::info!(
            change_id = %change.id,
            status = %change.status,
            tests_passed = ?change.tests_passed,
            "Change finalized"
        );
        Ok(change)
    }

    /// Writes the finalized content to the target file. Only TESTED
    /// changes can be applied.
    pub fn apply(&self, change_id: Uuid) -> Result<CodeChange, LedgerError> {
        let mut state = self.lock();
        let current = state.change(change_id)?;
        if current.status != ChangeStatus::Tested {
            return Err(LedgerError::InvalidTransition {
                action: "apply",
                status: current.status,
            });
        }

        if current.change_type == ChangeType::Delete {
            remove_if_exists(&current.file_path)?;
        } else {
            let after = current
                .after_snapshot
                .as_ref()
                .ok_or_else(|| LedgerError::Integrity(format!("tested change {change_id} has no after snapshot")))?;
            let content = self.snapshots.get(after)?;
            write_file(&current.file_path, &content)?;
        }

        let now = Utc::now();
        let mut next = current.clone();
        next.status = ChangeStatus::Applied;
        next.applied_at = Some(now);
        next.updated_at = now;

        let change = state.record(ChangeEvent::Applied, next)?;
        increment_counter!("ledger_changes_applied_total");
        tracing::info!(change_id = %change.id, file = %change.file_path.display(), "Change applied");
        Ok(change)
    }

    /// Restores `file_path` to exactly its content before the change, or
    /// deletes it when the change created it. The record is kept.
    pub fn rollback(&self, change_id: Uuid, reason: &str) -> Result<CodeChange, LedgerError> {
        if reason.trim().is_empty() {
            return Err(LedgerError::InvalidInput("rollback reason must not be empty".into()));
        }

        let mut state = self.lock();
        let current = state.change(change_id)?;
        if current.status == ChangeStatus::RolledBack {
            return Err(LedgerError::InvalidTransition {
                action: "roll back",
                status: current.status,
            });
        }

        match (&current.before_snapshot, current.change_type) {
            (Some(before), _) => {
                let content = self.snapshots.get(before)?;
                write_file(&current.file_path, &content)?;
            }
            (None, ChangeType::Create) => remove_if_exists(&current.file_path)?,
            (None, _) => return Err(LedgerError::NoBeforeSnapshot(change_id)),
        }

        let now = Utc::now();
        let mut next = current.clone();
        next.status = ChangeStatus::RolledBack;
        next.rollback_reason = Some(reason.to_string());
        next.rolled_back_at = Some(now);
        next.updated_at = now;

        let change = state.record(ChangeEvent::RolledBack, next)?;
        increment_counter!("ledger_rollbacks_total");
        tracing::warn!(
            change_id = %change.id,
            file = %change.file_path.display(),
            reason = %reason,
            "Change rolled back"
        );
        Ok(change)
    }

    pub fn change(&self, change_id: Uuid) -> Option<CodeChange> {
        self.lock().changes.get(&change_id).cloned()
    }

    /// All changes in the order they were first tracked
    pub fn changes(&self) -> Vec<CodeChange> {
        self.lock().ordered().cloned().collect()
    }

    pub fn changes_for_proposal(&self, proposal_id: Uuid) -> Vec<CodeChange> {
        self.lock()
            .ordered()
            .filter(|c| c.proposal_id == Some(proposal_id))
            .cloned()
            .collect()
    }

    /// Reads back a stored snapshot body
    pub fn snapshot_content(&self, snapshot: &SnapshotRef) -> Result<Vec<u8>, LedgerError> {
        self.snapshots.get(snapshot)
    }

    pub fn statistics(&self) -> ChangeStatistics {
        report::statistics(self.lock().ordered())
    }

    /// Renders release notes and writes them to `CHANGELOG.md` in the
    /// ledger directory.
    pub fn generate_changelog(&self) -> Result<String, LedgerError> {
        let text = report::render_changelog(self.lock().ordered());
        fs::write(self.dir.join(CHANGELOG_FILE), &text)?;
        Ok(text)
    }

    /// Where `generate_changelog` writes
    pub fn changelog_path(&self) -> PathBuf {
        self.dir.join(CHANGELOG_FILE)
    }

    pub fn snapshots_dir(&self) -> &Path {
        self.snapshots.dir()
    }
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, content)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), LedgerError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

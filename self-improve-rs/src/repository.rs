// self-improve-rs/src/repository.rs
// Persistence layer for capability gaps and improvement proposals.
//
// Implementation notes:
// - Two append-only NDJSON files, one timestamped record per line.
// - Every mutation appends the full record; loading keeps the latest
//   record per id, so history is never rewritten.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::gap::CapabilityGap;
use crate::proposal::ImprovementProposal;

const GAPS_FILE: &str = "capability_gaps.ndjson";
const PROPOSALS_FILE: &str = "improvement_proposals.ndjson";

/// Repository error type.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One line of a log file
#[derive(Debug, Serialize, Deserialize)]
struct LogEntry<T> {
    recorded_at: DateTime<Utc>,
    record: T,
}

/// Latest state per id, as reconstructed from the logs.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub gaps: Vec<CapabilityGap>,
    pub proposals: Vec<ImprovementProposal>,
}

#[async_trait]
pub trait ImprovementRepository {
    async fn append_gap(&self, gap: &CapabilityGap) -> Result<(), RepositoryError>;

    async fn append_proposal(&self, proposal: &ImprovementProposal)
        -> Result<(), RepositoryError>;

    async fn load(&self) -> Result<Snapshot, RepositoryError>;
}

/// File-backed repository writing NDJSON logs under one directory.
pub struct FileBackedRepository {
    dir: PathBuf,
}

impl FileBackedRepository {
    /// Create a repository rooted at `dir`.
    ///
    /// The directory is created eagerly so that an unwritable location
    /// fails at startup rather than on the first mutation.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn append<T: Serialize>(&self, file_name: &str, record: &T) -> Result<(), RepositoryError> {
        fs::create_dir_all(&self.dir).await?;

        let entry = LogEntry {
            recorded_at: Utc::now(),
            record,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file_name))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    async fn read_latest<T, F>(&self, file_name: &str, id_of: F) -> Result<Vec<T>, RepositoryError>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> Uuid,
    {
        let path = self.dir.join(file_name);
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }

        let buf = fs::read_to_string(&path).await?;

        // Keep first-seen order so reloads are stable.
        let mut order: Vec<Uuid> = Vec::new();
        let mut latest: HashMap<Uuid, T> = HashMap::new();
        for (line_no, line) in buf.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry<T>>(line) {
                Ok(entry) => {
                    let id = id_of(&entry.record);
                    if latest.insert(id, entry.record).is_none() {
                        order.push(id);
                    }
                }
                Err(err) => {
                    // Log and continue on parse failures so one torn line does
                    // not lose the rest of the history.
                    tracing::warn!(
                        file = %file_name,
                        line = line_no + 1,
                        error = %err,
                        "failed to parse log line; skipping"
                    );
                }
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }
}

#[async_trait]
impl ImprovementRepository for FileBackedRepository {
    async fn append_gap(&self, gap: &CapabilityGap) -> Result<(), RepositoryError> {
        self.append(GAPS_FILE, gap).await
    }

    async fn append_proposal(
        &self,
        proposal: &ImprovementProposal,
    ) -> Result<(), RepositoryError> {
        self.append(PROPOSALS_FILE, proposal).await
    }

    async fn load(&self) -> Result<Snapshot, RepositoryError> {
        Ok(Snapshot {
            gaps: self.read_latest(GAPS_FILE, |g: &CapabilityGap| g.id).await?,
            proposals: self
                .read_latest(PROPOSALS_FILE, |p: &ImprovementProposal| p.id)
                .await?,
        })
    }
}

/// Volatile repository for tests and dry runs.
#[derive(Default)]
pub struct InMemoryRepository {
    gaps: Mutex<Vec<CapabilityGap>>,
    proposals: Mutex<Vec<ImprovementProposal>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of proposal records appended so far
    pub async fn proposal_writes(&self) -> usize {
        self.proposals.lock().await.len()
    }
}

#[async_trait]
impl ImprovementRepository for InMemoryRepository {
    async fn append_gap(&self, gap: &CapabilityGap) -> Result<(), RepositoryError> {
        self.gaps.lock().await.push(gap.clone());
        Ok(())
    }

    async fn append_proposal(
        &self,
        proposal: &ImprovementProposal,
    ) -> Result<(), RepositoryError> {
        self.proposals.lock().await.push(proposal.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Snapshot, RepositoryError> {
        fn latest<T: Clone>(records: &[T], id_of: impl Fn(&T) -> Uuid) -> Vec<T> {
            let mut out: Vec<T> = Vec::new();
            for record in records {
                match out.iter().position(|r| id_of(r) == id_of(record)) {
                    Some(index) => out[index] = record.clone(),
                    None => out.push(record.clone()),
                }
            }
            out
        }

        Ok(Snapshot {
            gaps: latest(&self.gaps.lock().await, |g| g.id),
            proposals: latest(&self.proposals.lock().await, |p| p.id),
        })
    }
}

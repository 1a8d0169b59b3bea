// change-ledger-rs/src/snapshot.rs
// Content-addressed snapshot store: raw bytes under snapshots/<sha256-hex>.

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::chain::sha256_hex;
use crate::model::SnapshotRef;
use crate::LedgerError;

pub(crate) struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub(crate) fn open(dir: PathBuf) -> Result<Self, LedgerError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, checksum: &str) -> PathBuf {
        self.dir.join(checksum)
    }

    /// Stores `content` once; storing identical content again is a no-op.
    pub(crate) fn put(&self, content: &[u8]) -> Result<SnapshotRef, LedgerError> {
        let checksum = sha256_hex(content);
        let path = self.path_for(&checksum);
        if !path.exists() {
            // Write then rename so a crash never leaves a partial snapshot
            // under its final name. Concurrent writers of the same content
            // each use their own temp file.
            let tmp = self.dir.join(format!(".{checksum}.{}.tmp", Uuid::new_v4()));
            fs::write(&tmp, content)?;
            if let Err(err) = fs::rename(&tmp, &path) {
                let _ = fs::remove_file(&tmp);
                if !path.exists() {
                    return Err(err.into());
                }
            }
        }
        Ok(SnapshotRef {
            checksum,
            size: content.len() as u64,
        })
    }

    /// Reads a snapshot back, checking it still matches its checksum.
    pub(crate) fn get(&self, snapshot: &SnapshotRef) -> Result<Vec<u8>, LedgerError> {
        let content = fs::read(self.path_for(&snapshot.checksum)).map_err(|e| {
            LedgerError::Integrity(format!("snapshot {} unreadable: {e}", snapshot.checksum))
        })?;
        if sha256_hex(&content) != snapshot.checksum {
            return Err(LedgerError::Integrity(format!(
                "snapshot {} does not match its checksum",
                snapshot.checksum
            )));
        }
        Ok(content)
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }
}

// change-ledger-rs/src/chain.rs
// Append-only NDJSON log where each line participates in a SHA-256 hash
// chain: hash = SHA-256(prev_hash || canonical_body_json).
//
// The body is hashed in its canonical `serde_json::Value` form (sorted
// keys), so verification does not depend on field order in the file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::{ChangeEvent, CodeChange};
use crate::LedgerError;

/// Chain head of an empty log
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Body of one ledger line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: ChangeEvent,
    pub change: CodeChange,
}

/// On-disk representation of a single line.
#[derive(Debug, Serialize, Deserialize)]
struct ChainLine {
    prev_hash: String,
    hash: String,
    body: serde_json::Value,
}

pub(crate) struct ChainLog {
    path: PathBuf,
    head: String,
    next_seq: u64,
}

impl ChainLog {
    /// Opens the log at `path`, verifying every link. Returns the log and
    /// its entries in append order.
    pub(crate) fn open(path: &Path) -> Result<(Self, Vec<LedgerEntry>), LedgerError> {
        let mut log = Self {
            path: path.to_path_buf(),
            head: GENESIS_HASH.to_string(),
            next_seq: 0,
        };
        if !path.exists() {
            return Ok((log, Vec::new()));
        }

        let content = fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let line_no = index + 1;
            let parsed: ChainLine = serde_json::from_str(line).map_err(|e| {
                LedgerError::Integrity(format!("line {line_no}: unreadable record: {e}"))
            })?;

            if parsed.prev_hash != log.head {
                return Err(LedgerError::Integrity(format!(
                    "line {line_no}: chain broken (expected prev {}, found {})",
                    log.head, parsed.prev_hash
                )));
            }
            let computed = link_hash(&log.head, &parsed.body)?;
            if computed != parsed.hash {
                return Err(LedgerError::Integrity(format!(
                    "line {line_no}: hash mismatch; possible tampering"
                )));
            }

            let entry: LedgerEntry = serde_json::from_value(parsed.body).map_err(|e| {
                LedgerError::Integrity(format!("line {line_no}: malformed entry: {e}"))
            })?;
            log.head = parsed.hash;
            log.next_seq = entry.seq + 1;
            entries.push(entry);
        }

        Ok((log, entries))
    }

    /// Appends one entry and advances the chain head.
    pub(crate) fn append(
        &mut self,
        event: ChangeEvent,
        change: &CodeChange,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = LedgerEntry {
            seq: self.next_seq,
            recorded_at: Utc::now(),
            event,
            change: change.clone(),
        };
        let body = serde_json::to_value(&entry)?;
        let hash = link_hash(&self.head, &body)?;
        let line = ChainLine {
            prev_hash: self.head.clone(),
            hash: hash.clone(),
            body,
        };

        let mut encoded = serde_json::to_string(&line)?;
        encoded.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(encoded.as_bytes())?;
        file.flush()?;

        // Update chain head in memory only once the line is on disk.
        self.head = hash;
        self.next_seq += 1;
        Ok(entry)
    }

    pub(crate) fn head(&self) -> &str {
        &self.head
    }
}

fn link_hash(prev: &str, body: &serde_json::Value) -> Result<String, LedgerError> {
    let canonical = serde_json::to_string(body)?;
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_digests() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn genesis_is_64_zeroes() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }
}

// self-improve-rs/src/gap.rs
// Capability gaps: recurring requests the assistant could not satisfy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of a gap, also used as proposal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityGap {
    pub id: Uuid,
    pub description: String,
    pub example: String,
    pub severity: Severity,
    pub frequency: u32,
    pub affected_workers: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl CapabilityGap {
    pub fn new(
        description: &str,
        example: &str,
        severity: Severity,
        affected_workers: &[String],
    ) -> Self {
        let now = Utc::now();
        let mut gap = Self {
            id: Uuid::new_v4(),
            description: description.trim().to_string(),
            example: example.to_string(),
            severity,
            frequency: 1,
            affected_workers: Vec::new(),
            first_seen: now,
            last_seen: now,
        };
        gap.merge_workers(affected_workers);
        gap
    }

    /// Key under which equivalent gaps are matched
    pub fn key(&self) -> String {
        gap_key(&self.description)
    }

    /// Folds a repeat detection into this gap. Severity only ever rises.
    pub fn record_occurrence(&mut self, example: &str, severity: Severity, workers: &[String]) {
        self.frequency = self.frequency.saturating_add(1);
        self.last_seen = Utc::now();
        self.severity = self.severity.max(severity);
        if !example.trim().is_empty() {
            self.example = example.to_string();
        }
        self.merge_workers(workers);
    }

    fn merge_workers(&mut self, workers: &[String]) {
        for worker in workers {
            if !self.affected_workers.contains(worker) {
                self.affected_workers.push(worker.clone());
            }
        }
    }
}

/// Normalized description: trimmed, lowercased, inner whitespace collapsed.
pub fn gap_key(description: &str) -> String {
    description
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

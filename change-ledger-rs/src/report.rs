// change-ledger-rs/src/report.rs
// Read-only views over tracked changes: statistics and release notes.

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

use crate::model::{ChangeStatus, ChangeType, CodeChange};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeStatistics {
    pub total: usize,
    pub by_type: BTreeMap<ChangeType, usize>,
    pub by_status: BTreeMap<ChangeStatus, usize>,
    /// Changes with a recorded test outcome
    pub tested: usize,
    pub passed: usize,
    /// `passed / tested`, absent when nothing was tested
    pub pass_rate: Option<f64>,
    pub rollbacks: usize,
}

pub fn statistics<'a, I>(changes: I) -> ChangeStatistics
where
    I: IntoIterator<Item = &'a CodeChange>,
{
    let mut stats = ChangeStatistics::default();
    for change in changes {
        stats.total += 1;
        *stats.by_type.entry(change.change_type).or_default() += 1;
        *stats.by_status.entry(change.status).or_default() += 1;
        if let Some(passed) = change.tests_passed {
            stats.tested += 1;
            if passed {
                stats.passed += 1;
            }
        }
        if change.status == ChangeStatus::RolledBack {
            stats.rollbacks += 1;
        }
    }
    if stats.tested > 0 {
        stats.pass_rate = Some(stats.passed as f64 / stats.tested as f64);
    }
    stats
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Group {
    Proposal(Uuid),
    Day(NaiveDate),
}

/// Renders release notes, one section per proposal and one per UTC day for
/// changes without a proposal. Sections are ordered by their first change.
pub fn render_changelog<'a, I>(changes: I) -> String
where
    I: IntoIterator<Item = &'a CodeChange>,
{
    let mut sections: Vec<(Group, Vec<&CodeChange>)> = Vec::new();
    for change in changes {
        let group = match change.proposal_id {
            Some(id) => Group::Proposal(id),
            None => Group::Day(change.created_at.date_naive()),
        };
        match sections.iter_mut().find(|(g, _)| *g == group) {
            Some((_, members)) => members.push(change),
            None => sections.push((group, vec![change])),
        }
    }
    sections.sort_by_key(|(_, members)| members.iter().map(|c| c.created_at).min());

    let mut out = String::from("# Changelog\n");
    if sections.is_empty() {
        out.push_str("\nNo changes recorded.\n");
        return out;
    }

    for (group, members) in sections {
        match group {
            Group::Proposal(id) => {
                let _ = writeln!(out, "\n## Proposal {id}\n");
                let _ = writeln!(out, "Related proposal: [`{id}`](proposal:{id})\n");
            }
            Group::Day(day) => {
                let _ = writeln!(out, "\n## Changes on {day}\n");
            }
        }
        for change in members {
            let _ = writeln!(
                out,
                "- **{}** `{}`: {} (tests: {}, status: {})",
                change.change_type,
                change.file_path.display(),
                change.description,
                test_outcome(change),
                change.status,
            );
            if let Some(reason) = &change.rollback_reason {
                let _ = writeln!(out, "  - rolled back: {reason}");
            }
        }
    }
    out
}

fn test_outcome(change: &CodeChange) -> String {
    match change.tests_passed {
        Some(true) => format!("passed, {} generated", change.tests_generated.len()),
        Some(false) => format!("failed, {} generated", change.tests_generated.len()),
        None => "not run".to_string(),
    }
}

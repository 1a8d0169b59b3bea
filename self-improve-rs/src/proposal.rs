// self-improve-rs/src/proposal.rs
// Improvement proposals and their lifecycle.
//
// IDENTIFIED -> PLANNED -> IN_PROGRESS -> TESTING -> COMPLETED
// Any non-terminal state may also move to FAILED or CANCELLED.
// COMPLETED, FAILED and CANCELLED are terminal.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gap::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalKind {
    CapabilityGap,
    Performance,
    ErrorPattern,
    FeatureRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Identified,
    Planned,
    InProgress,
    Testing,
    Completed,
    Failed,
    Cancelled,
}

impl ProposalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProposalStatus::Completed | ProposalStatus::Failed | ProposalStatus::Cancelled
        )
    }

    /// Whether `self -> to` is an edge of the lifecycle graph
    pub fn can_transition_to(self, to: ProposalStatus) -> bool {
        use ProposalStatus::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, to),
            (Identified, Planned)
                | (Planned, InProgress)
                | (InProgress, Testing)
                | (Testing, Completed)
                | (_, Failed)
                | (_, Cancelled)
        )
    }

    /// Lowercase wire name used in status messages
    pub fn as_wire(self) -> &'static str {
        match self {
            ProposalStatus::Identified => "identified",
            ProposalStatus::Planned => "planned",
            ProposalStatus::InProgress => "in_progress",
            ProposalStatus::Testing => "testing",
            ProposalStatus::Completed => "completed",
            ProposalStatus::Failed => "failed",
            ProposalStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_wire().to_ascii_uppercase())
    }
}

impl FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identified" => Ok(ProposalStatus::Identified),
            "planned" => Ok(ProposalStatus::Planned),
            "in_progress" => Ok(ProposalStatus::InProgress),
            "testing" => Ok(ProposalStatus::Testing),
            "completed" => Ok(ProposalStatus::Completed),
            "failed" => Ok(ProposalStatus::Failed),
            "cancelled" => Ok(ProposalStatus::Cancelled),
            other => Err(format!("unknown proposal status: {other}")),
        }
    }
}

/// Input for creating a proposal
#[derive(Debug, Clone)]
pub struct NewProposal {
    pub gap_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub priority: Severity,
    pub kind: ProposalKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementProposal {
    pub id: Uuid,
    pub gap_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub priority: Severity,
    #[serde(rename = "type")]
    pub kind: ProposalKind,
    pub status: ProposalStatus,
    pub assigned_worker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the proposal reaches a terminal status
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl ImprovementProposal {
    pub fn new(input: NewProposal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            gap_id: input.gap_id,
            title: input.title,
            description: input.description,
            priority: input.priority,
            kind: input.kind,
            status: ProposalStatus::Identified,
            assigned_worker: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            notes: Vec::new(),
        }
    }

    /// Returns a copy moved to `to`, or the rejected edge.
    pub fn transitioned(
        &self,
        to: ProposalStatus,
    ) -> Result<Self, (ProposalStatus, ProposalStatus)> {
        if !self.status.can_transition_to(to) {
            return Err((self.status, to));
        }
        let now = Utc::now();
        let mut next = self.clone();
        next.status = to;
        next.updated_at = now;
        if to.is_terminal() {
            next.completed_at = Some(now);
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProposalStatus::*;

    const ALL: [ProposalStatus; 7] = [
        Identified, Planned, InProgress, Testing, Completed, Failed, Cancelled,
    ];

    #[test]
    fn happy_path_edges_are_allowed() {
        assert!(Identified.can_transition_to(Planned));
        assert!(Planned.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Testing));
        assert!(Testing.can_transition_to(Completed));
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(!Identified.can_transition_to(Completed));
        assert!(!Identified.can_transition_to(InProgress));
        assert!(!Planned.can_transition_to(Testing));
        assert!(!Testing.can_transition_to(Planned));
        assert!(!Planned.can_transition_to(Planned));
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for from in [Completed, Failed, Cancelled] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn non_terminal_states_can_fail_or_cancel() {
        for from in [Identified, Planned, InProgress, Testing] {
            assert!(from.can_transition_to(Failed));
            assert!(from.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn terminal_transition_sets_completed_at() {
        let proposal = ImprovementProposal::new(NewProposal {
            gap_id: None,
            title: "t".into(),
            description: "d".into(),
            priority: Severity::Low,
            kind: ProposalKind::FeatureRequest,
        });
        let cancelled = proposal.transitioned(Cancelled).unwrap();
        assert!(cancelled.completed_at.is_some());
        assert_eq!(proposal.transitioned(Completed), Err((Identified, Completed)));
    }

    #[test]
    fn wire_names_round_trip() {
        for status in ALL {
            assert_eq!(status.as_wire().parse::<ProposalStatus>(), Ok(status));
        }
        assert!("done".parse::<ProposalStatus>().is_err());
    }
}

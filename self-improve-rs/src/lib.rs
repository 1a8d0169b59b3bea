// self-improve-rs/src/lib.rs
// Library interface for the Improvement Engine.
//
// Design notes:
// - Capability gaps are deduplicated by normalized description and escalate
//   into improvement proposals once they are critical or recur often enough.
// - Proposals follow a fixed lifecycle; every mutation is appended to the
//   repository before it becomes visible in memory.
// - Implementation work is delegated over the message broker and reported
//   back as status messages to the engine's own mailbox.

use std::collections::HashMap;
use std::sync::Arc;

use agent_registry::{BrokerError, Message, MessageBroker, Priority};
use config_rs::ImprovementSettings;
use error_handling_rs::{Error, ErrorKind};
use metrics::increment_counter;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

pub mod gap;
pub mod proposal;
pub mod repository;


pub use crate::gap::{CapabilityGap, Severity, gap_key};
pub use crate::proposal::{ImprovementProposal, NewProposal, ProposalKind, ProposalStatus};
pub use crate::repository::{
    FileBackedRepository, ImprovementRepository, InMemoryRepository, RepositoryError, Snapshot,
};

/// Context keys of delegation and status messages.
pub mod protocol {
    pub const PROPOSAL_ID: &str = "proposal_id";
    pub const STATUS: &str = "status";
    pub const KIND: &str = "kind";
    pub const TITLE: &str = "title";
    pub const REPLY_TO: &str = "reply_to";
    pub const REASON: &str = "reason";
    pub const CHANGE_ID: &str = "change_id";

    /// `kind` of a delegation message
    pub const DELEGATION: &str = "delegation";
    /// `kind` of a status report
    pub const STATUS_REPORT: &str = "status";
}

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, ImproveError>;

/// Top-level error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum ImproveError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("invalid proposal transition {from} -> {to}")]
    InvalidTransition {
        from: ProposalStatus,
        to: ProposalStatus,
    },

    #[error("unknown capability gap {0}")]
    GapNotFound(Uuid),

    #[error("unknown proposal {0}")]
    ProposalNotFound(Uuid),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("malformed status message: {0}")]
    MalformedMessage(String),
}

impl From<ImproveError> for Error {
    fn from(err: ImproveError) -> Self {
        let kind = match &err {
            ImproveError::Repository(_) => ErrorKind::Storage,
            ImproveError::Broker(BrokerError::UnknownRecipient(_)) => ErrorKind::UnknownRecipient,
            ImproveError::Broker(_) => ErrorKind::Internal,
            ImproveError::InvalidTransition { .. } => ErrorKind::InvalidStateTransition,
            ImproveError::InvalidInput(_) => ErrorKind::InputValidation,
            ImproveError::GapNotFound(_)
            | ImproveError::ProposalNotFound(_)
            | ImproveError::MalformedMessage(_) => ErrorKind::Internal,
        };
        Error::new(kind, err.to_string()).service("improvement_engine")
    }
}

/// Outcome of draining the engine mailbox
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InboxReport {
    pub applied: usize,
    pub rejected: usize,
}

#[derive(Default)]
struct EngineState {
    gaps: HashMap<Uuid, CapabilityGap>,
    gap_keys: HashMap<String, Uuid>,
    proposals: HashMap<Uuid, ImprovementProposal>,
}

impl EngineState {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = Self::default();
        for gap in snapshot.gaps {
            state.gap_keys.insert(gap.key(), gap.id);
            state.gaps.insert(gap.id, gap);
        }
        for proposal in snapshot.proposals {
            state.proposals.insert(proposal.id, proposal);
        }
        state
    }

    fn has_open_proposal(&self, gap_id: Uuid) -> bool {
        self.proposals
            .values()
            .any(|p| p.gap_id == Some(gap_id) && !p.status.is_terminal())
    }

    fn proposal(&self, id: Uuid) -> Result<&ImprovementProposal> {
        self.proposals.get(&id).ok_or(ImproveError::ProposalNotFound(id))
    }
}

/// Core improvement engine.
///
/// Typical usage (inside an async context):
///
/// ```ignore
/// let engine = ImprovementEngine::open(settings, broker, repo).await?;
/// let gap_id = engine
///     .detect_gap("cannot edit video", "trim my clip", Severity::Critical, &[])
///     .await?;
/// for proposal in engine.proposals_for_gap(gap_id).await {
///     engine.delegate(proposal.id, "implementer").await?;
/// }
/// ```
pub struct ImprovementEngine {
    settings: ImprovementSettings,
    broker: Arc<MessageBroker>,
    repo: Arc<dyn ImprovementRepository + Send + Sync>,
    // Held across repository appends: one writer at a time.
    state: Mutex<EngineState>,
}

impl ImprovementEngine {
    /// Rebuilds state from `repo` and registers the engine mailbox.
    pub async fn open(
        settings: ImprovementSettings,
        broker: Arc<MessageBroker>,
        repo: Arc<dyn ImprovementRepository + Send + Sync>,
    ) -> Result<Self> {
        let snapshot = repo.load().await?;
        tracing::info!(
            gaps = snapshot.gaps.len(),
            proposals = snapshot.proposals.len(),
            "Improvement state loaded"
        );
        broker.register(&settings.engine_agent).await?;

        Ok(Self {
            settings,
            broker,
            repo,
            state: Mutex::new(EngineState::from_snapshot(snapshot)),
        })
    }

    /// Mailbox name status reports should be sent to
    pub fn agent_name(&self) -> &str {
        &self.settings.engine_agent
    }

    /// Records one occurrence of a capability gap and returns its id.
    ///
    /// Equivalent descriptions (see [`gap_key`]) update the existing gap.
    /// A gap that is critical, or has reached the escalation frequency, gets
    /// an improvement proposal unless it already has an open one.
    #[instrument(skip_all, fields(severity = %severity))]
    pub async fn detect_gap(
        &self,
        description: &str,
        example: &str,
        severity: Severity,
        affected_workers: &[String],
    ) -> Result<Uuid> {
        let key = gap_key(description);
        if key.is_empty() {
            return Err(ImproveError::InvalidInput(
                "gap description must not be empty".to_string(),
            ));
        }

        let mut state = self.state.lock().await;

        let gap = match state.gap_keys.get(&key).and_then(|id| state.gaps.get(id)) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.record_occurrence(example, severity, affected_workers);
                updated
            }
            None => CapabilityGap::new(description, example, severity, affected_workers),
        };

        self.repo.append_gap(&gap).await?;
        state.gap_keys.insert(key, gap.id);
        state.gaps.insert(gap.id, gap.clone());
        increment_counter!("improvement_gap_detections_total", "severity" => gap.severity.to_string());
        tracing::info!(
            gap_id = %gap.id,
            frequency = gap.frequency,
            severity = %gap.severity,
            "Capability gap recorded"
        );

        let escalate = gap.severity == Severity::Critical
            || gap.frequency >= self.settings.escalation_frequency;
        if escalate && !state.has_open_proposal(gap.id) {
            let proposal = ImprovementProposal::new(proposal_for_gap(&gap));
            self.insert_proposal(&mut state, proposal).await?;
        }

        Ok(gap.id)
    }

    /// Creates a proposal in status IDENTIFIED.
    #[instrument(skip_all, fields(title = %input.title))]
    pub async fn create_proposal(&self, input: NewProposal) -> Result<Uuid> {
        if input.title.trim().is_empty() {
            return Err(ImproveError::InvalidInput(
                "proposal title must not be empty".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        if let Some(gap_id) = input.gap_id {
            if !state.gaps.contains_key(&gap_id) {
                return Err(ImproveError::GapNotFound(gap_id));
            }
        }
        self.insert_proposal(&mut state, ImprovementProposal::new(input))
            .await
    }

    async fn insert_proposal(
        &self,
        state: &mut EngineState,
        proposal: ImprovementProposal,
    ) -> Result<Uuid> {
        self.repo.append_proposal(&proposal).await?;
        let id = proposal.id;
        tracing::info!(
            proposal_id = %id,
            gap_id = ?proposal.gap_id,
            priority = %proposal.priority,
            "Improvement proposal identified"
        );
        increment_counter!("improvement_proposals_created_total");
        state.proposals.insert(id, proposal);
        Ok(id)
    }

    /// Moves a proposal along one edge of its lifecycle, optionally
    /// attaching a note.
    #[instrument(skip_all, fields(proposal_id = %proposal_id, to = %to))]
    pub async fn transition(
        &self,
        proposal_id: Uuid,
        to: ProposalStatus,
        note: Option<String>,
    ) -> Result<ImprovementProposal> {
        let mut state = self.state.lock().await;
        let current = state.proposal(proposal_id)?;
        let mut next = current
            .transitioned(to)
            .map_err(|(from, to)| ImproveError::InvalidTransition { from, to })?;
        if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
            next.notes.push(note);
        }
        self.commit(&mut state, next).await
    }

    async fn commit(
        &self,
        state: &mut EngineState,
        next: ImprovementProposal,
    ) -> Result<ImprovementProposal> {
        self.repo.append_proposal(&next).await?;
        let previous = state
            .proposals
            .insert(next.id, next.clone())
            .map(|p| p.status);
        increment_counter!("improvement_proposal_transitions_total", "to" => next.status.to_string());
        tracing::info!(
            proposal_id = %next.id,
            from = ?previous,
            to = %next.status,
            "Proposal status changed"
        );
        Ok(next)
    }

    /// Hands a proposal to `implementer`: moves it to PLANNED and sends one
    /// HIGH priority delegation message. Returns the message id.
    #[instrument(skip_all, fields(proposal_id = %proposal_id, worker = %implementer))]
    pub async fn delegate(&self, proposal_id: Uuid, implementer: &str) -> Result<Uuid> {
        if !self.broker.is_registered(implementer).await {
            return Err(BrokerError::UnknownRecipient(implementer.to_string()).into());
        }

        let mut state = self.state.lock().await;
        let current = state.proposal(proposal_id)?;
        let mut next = current
            .transitioned(ProposalStatus::Planned)
            .map_err(|(from, to)| ImproveError::InvalidTransition { from, to })?;
        next.assigned_worker = Some(implementer.to_string());
        let next = self.commit(&mut state, next).await?;

        let message_id = self
            .broker
            .send(
                &self.settings.engine_agent,
                implementer,
                next.description.clone(),
                agent_registry::context([
                    (protocol::PROPOSAL_ID, next.id.to_string()),
                    (protocol::KIND, protocol::DELEGATION.to_string()),
                    (protocol::TITLE, next.title.clone()),
                    (protocol::REPLY_TO, self.settings.engine_agent.clone()),
                ]),
                Priority::High,
            )
            .await?;

        tracing::info!(
            proposal_id = %proposal_id,
            worker = %implementer,
            message_id = %message_id,
            "Proposal delegated"
        );
        Ok(message_id)
    }

    /// Cancels a non-terminal proposal
    pub async fn cancel(&self, proposal_id: Uuid, reason: &str) -> Result<ImprovementProposal> {
        self.transition(proposal_id, ProposalStatus::Cancelled, Some(reason.to_string()))
            .await
    }

    /// Applies one status report from a worker. Returns the new status.
    pub async fn handle_message(&self, message: &Message) -> Result<ProposalStatus> {
        let proposal_id = message
            .context_value(protocol::PROPOSAL_ID)
            .ok_or_else(|| ImproveError::MalformedMessage("missing proposal_id".to_string()))
            .and_then(|raw| {
                Uuid::parse_str(raw).map_err(|e| {
                    ImproveError::MalformedMessage(format!("bad proposal_id {raw:?}: {e}"))
                })
            })?;
        let status: ProposalStatus = message
            .context_value(protocol::STATUS)
            .ok_or_else(|| ImproveError::MalformedMessage("missing status".to_string()))?
            .parse()
            .map_err(ImproveError::MalformedMessage)?;

        let note = message
            .context_value(protocol::REASON)
            .map(str::to_string)
            .or_else(|| {
                (status == ProposalStatus::Failed && !message.content.trim().is_empty())
                    .then(|| message.content.clone())
            });

        let updated = self.transition(proposal_id, status, note).await?;
        Ok(updated.status)
    }

    /// Drains the engine mailbox, applying each status report once.
    /// Rejected reports are logged and counted, never retried.
    pub async fn process_inbox(&self) -> Result<InboxReport> {
        let mut report = InboxReport::default();
        loop {
            let batch = self.broker.receive(&self.settings.engine_agent, 64).await?;
            if batch.is_empty() {
                break;
            }
            for message in &batch {
                match self.handle_message(message).await {
                    Ok(_) => report.applied += 1,
                    Err(err) => {
                        report.rejected += 1;
                        let err = Error::from(err).context("message_id", message.id.to_string());
                        error_handling_rs::log_structured_error(&err);
                    }
                }
            }
        }
        Ok(report)
    }

    pub async fn gap(&self, id: Uuid) -> Option<CapabilityGap> {
        self.state.lock().await.gaps.get(&id).cloned()
    }

    /// All gaps, most frequent first
    pub async fn gaps(&self) -> Vec<CapabilityGap> {
        let mut gaps: Vec<_> = self.state.lock().await.gaps.values().cloned().collect();
        gaps.sort_by(|a, b| b.frequency.cmp(&a.frequency).then(a.first_seen.cmp(&b.first_seen)));
        gaps
    }

    pub async fn proposal(&self, id: Uuid) -> Option<ImprovementProposal> {
        self.state.lock().await.proposals.get(&id).cloned()
    }

    /// All proposals, oldest first
    pub async fn proposals(&self) -> Vec<ImprovementProposal> {
        let mut proposals: Vec<_> = self.state.lock().await.proposals.values().cloned().collect();
        proposals.sort_by_key(|p| p.created_at);
        proposals
    }

    pub async fn proposals_for_gap(&self, gap_id: Uuid) -> Vec<ImprovementProposal> {
        let mut proposals: Vec<_> = self
            .state
            .lock()
            .await
            .proposals
            .values()
            .filter(|p| p.gap_id == Some(gap_id))
            .cloned()
            .collect();
        proposals.sort_by_key(|p| p.created_at);
        proposals
    }
}

fn proposal_for_gap(gap: &CapabilityGap) -> NewProposal {
    let mut description = format!(
        "Add support for: {}\n\nSeen {} time(s), most recently with: {}",
        gap.description, gap.frequency, gap.example
    );
    if !gap.affected_workers.is_empty() {
        description.push_str(&format!(
            "\nAffected workers: {}",
            gap.affected_workers.join(", ")
        ));
    }

    NewProposal {
        gap_id: Some(gap.id),
        title: format!("Close capability gap: {}", gap.description),
        description,
        priority: gap.severity,
        kind: ProposalKind::CapabilityGap,
    }
}

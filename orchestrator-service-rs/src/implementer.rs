// orchestrator-service-rs/src/implementer.rs
//
// The implementer worker: turns delegated improvement proposals into tracked
// code changes.
//
// For each delegation message it reports `in_progress`, asks its generator
// worker for a source file, records the change in the ledger, reports
// `testing`, verifies the content with static checks and then either applies
// the change and reports `completed`, or rolls it back and reports `failed`.
// Generated code is never executed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_registry::{Message, MessageBroker, Priority};
use change_ledger::{ChangeType, CodeChangeTracker, Finalization, LedgerError};
use error_handling_rs::sanitization::denylist_match;
use error_handling_rs::{log_structured_error, Error, Result};
use metrics::increment_counter;
use self_improve::{protocol, ProposalStatus};
use serde::Serialize;
use tokio::sync::watch;
use tracing::instrument;
use uuid::Uuid;

use crate::worker::Worker;

/// Result of the static checks run against generated content
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    /// Names of the checks that were run
    pub checks: Vec<String>,
    pub failures: Vec<String>,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Static, non-executing checks for generated files.
#[derive(Debug, Clone, Default)]
pub struct ChangeVerifier;

impl ChangeVerifier {
    pub fn verify(&self, path: &Path, content: &str) -> Verification {
        let mut checks = Vec::new();
        let mut failures = Vec::new();

        checks.push("check_not_empty".to_string());
        if content.trim().is_empty() {
            failures.push("generated content is empty".to_string());
        }

        checks.push("check_no_unsafe_content".to_string());
        if let Some(rule) = denylist_match(content) {
            failures.push(format!("content matches denylist rule {}", rule));
        }

        if is_source_file(path) {
            checks.push("check_balanced_delimiters".to_string());
            if let Err(problem) = balanced_delimiters(content) {
                failures.push(problem);
            }

            checks.push("check_no_placeholders".to_string());
            for marker in ["todo!()", "unimplemented!()"] {
                if content.contains(marker) {
                    failures.push(format!("content contains placeholder {}", marker));
                }
            }
        }

        Verification { checks, failures }
    }
}

fn is_source_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("rs" | "py" | "js" | "ts" | "json" | "toml")
    )
}

// Brackets outside string literals must nest. Line comments are skipped.
fn balanced_delimiters(content: &str) -> std::result::Result<(), String> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
            }
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    return Err(format!("unbalanced delimiter {}", c));
                }
            }
            _ => {}
        }
    }

    if in_string {
        return Err("unterminated string literal".to_string());
    }
    match stack.last() {
        Some(open) => Err(format!("unclosed delimiter {}", open)),
        None => Ok(()),
    }
}

/// Strips a surrounding Markdown code fence, if the reply has one.
pub fn extract_code(reply: &str) -> String {
    let trimmed = reply.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after_fence = &trimmed[start + 3..];
    // Skip the language tag on the opening fence line.
    let body = match after_fence.find('\n') {
        Some(newline) => &after_fence[newline + 1..],
        None => after_fence,
    };
    match body.find("```") {
        Some(end) => body[..end].trim_end().to_string() + "\n",
        None => body.trim_end().to_string() + "\n",
    }
}

fn file_stem(title: &str, proposal_id: Uuid) -> String {
    let mut slug = String::new();
    for c in title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('_');
    let short_id = &proposal_id.simple().to_string()[..8];
    if slug.is_empty() {
        format!("proposal_{}", short_id)
    } else {
        format!("{}_{}", slug, short_id)
    }
}

/// How one delegation ended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImplementationOutcome {
    pub proposal_id: Uuid,
    pub change_id: Option<Uuid>,
    pub status: ProposalStatus,
    pub reason: Option<String>,
}

struct Delegation {
    proposal_id: Uuid,
    title: String,
    description: String,
    reply_to: String,
}

impl Delegation {
    fn parse(message: &Message, default_reply_to: &str) -> Result<Self> {
        if message.context_value(protocol::KIND) != Some(protocol::DELEGATION) {
            return Err(Error::input_validation("message is not a delegation")
                .context("message_id", message.id.to_string()));
        }
        let raw = message.context_value(protocol::PROPOSAL_ID).ok_or_else(|| {
            Error::input_validation("delegation without proposal_id")
                .context("message_id", message.id.to_string())
        })?;
        let proposal_id = Uuid::parse_str(raw).map_err(|e| {
            Error::input_validation(format!("bad proposal_id {:?}", raw)).cause(e)
        })?;

        Ok(Self {
            proposal_id,
            title: message
                .context_value(protocol::TITLE)
                .unwrap_or("improvement")
                .to_string(),
            description: message.content.clone(),
            reply_to: message
                .context_value(protocol::REPLY_TO)
                .unwrap_or(default_reply_to)
                .to_string(),
        })
    }
}

pub struct ImplementerWorker {
    name: String,
    default_reply_to: String,
    broker: Arc<MessageBroker>,
    ledger: Arc<CodeChangeTracker>,
    generator: Arc<dyn Worker>,
    generated_dir: PathBuf,
    verifier: ChangeVerifier,
}

impl ImplementerWorker {
    /// Registers the implementer mailbox under `name`.
    pub async fn new(
        name: impl Into<String>,
        default_reply_to: impl Into<String>,
        broker: Arc<MessageBroker>,
        ledger: Arc<CodeChangeTracker>,
        generator: Arc<dyn Worker>,
        generated_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let name = name.into();
        broker.register(&name).await?;
        Ok(Self {
            name,
            default_reply_to: default_reply_to.into(),
            broker,
            ledger,
            generator,
            generated_dir: generated_dir.into(),
            verifier: ChangeVerifier,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handles every pending delegation. Returns the outcomes of the
    /// messages that were well-formed.
    pub async fn process_pending(&self) -> Result<Vec<ImplementationOutcome>> {
        let mut outcomes = Vec::new();
        loop {
            let batch = self.broker.receive(&self.name, 16).await?;
            if batch.is_empty() {
                break;
            }
            for message in &batch {
                match self.handle_delegation(message).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(err) => log_structured_error(&err.service(self.name.as_str())),
                }
            }
        }
        Ok(outcomes)
    }

    /// Waits for delegations until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %self.name, "Implementer loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                waited = self.broker.wait(&self.name, Duration::from_secs(1)) => {
                    match waited {
                        Ok(true) => {
                            if let Err(err) = self.process_pending().await {
                                log_structured_error(&err);
                            }
                        }
                        Ok(false) => {}
                        Err(err) => {
                            log_structured_error(&Error::from(err));
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!(worker = %self.name, "Implementer loop stopped");
    }

    /// Implements one delegated proposal end to end.
    ///
    /// Only a malformed message or an unreachable engine mailbox is returned
    /// as an error; implementation failures are reported to the engine as
    /// `failed` and returned as an outcome.
    #[instrument(skip_all, fields(worker = %self.name, message_id = %message.id))]
    pub async fn handle_delegation(&self, message: &Message) -> Result<ImplementationOutcome> {
        let delegation = Delegation::parse(message, &self.default_reply_to)?;
        let proposal_id = delegation.proposal_id;
        self.report(&delegation, ProposalStatus::InProgress, None, None)
            .await?;

        let (status, change_id, reason) = match self.implement(&delegation).await {
            Ok(change_id) => (ProposalStatus::Completed, Some(change_id), None),
            Err((change_id, reason)) => (ProposalStatus::Failed, change_id, Some(reason)),
        };

        self.report(&delegation, status, change_id, reason.as_deref())
            .await?;
        increment_counter!("implementer_outcomes_total", "status" => status.as_wire());
        tracing::info!(
            proposal_id = %proposal_id,
            change_id = ?change_id,
            status = %status,
            "Delegation handled"
        );

        Ok(ImplementationOutcome {
            proposal_id,
            change_id,
            status,
            reason,
        })
    }

    // On failure returns the change id, if one was tracked, and a reason.
    async fn implement(
        &self,
        delegation: &Delegation,
    ) -> std::result::Result<Uuid, (Option<Uuid>, String)> {
        let prompt = format!(
            "Implement the following improvement as one self-contained Rust source file. \
             Reply with the file content only.\n\nTitle: {}\n\n{}",
            delegation.title, delegation.description
        );
        let reply = self
            .generator
            .handle(&prompt)
            .await
            .map_err(|err| (None, format!("generation failed: {}", err.message)))?;
        let content = extract_code(&reply);

        let path = self
            .generated_dir
            .join(format!("{}.rs", file_stem(&delegation.title, delegation.proposal_id)));
        let tracked_path = path.clone();
        let description = delegation.title.clone();
        let proposal_id = delegation.proposal_id;
        let change_id = self
            .with_ledger(move |ledger| {
                ledger.track(&tracked_path, &description, ChangeType::Feature, Some(proposal_id))
            })
            .await
            .map_err(|err| (None, format!("could not track change: {}", err.message)))?;

        if let Err(err) = self
            .report(delegation, ProposalStatus::Testing, Some(change_id), None)
            .await
        {
            log_structured_error(&err);
        }

        let verification = self.verifier.verify(&path, &content);
        let passed = verification.passed();
        let finalization = Finalization {
            tests_generated: verification.checks.clone(),
            tests_passed: Some(passed),
            after_content: content.into_bytes(),
        };

        let applied = self
            .with_ledger(move |ledger| {
                ledger.finalize(change_id, finalization)?;
                if passed {
                    ledger.apply(change_id)?;
                }
                Ok(())
            })
            .await;

        let reason = match applied {
            Ok(()) if passed => return Ok(change_id),
            Ok(()) => format!("verification failed: {}", verification.failures.join("; ")),
            Err(err) => format!("could not apply change: {}", err.message),
        };

        let rollback_reason = reason.clone();
        if let Err(err) = self
            .with_ledger(move |ledger| ledger.rollback(change_id, &rollback_reason).map(|_| ()))
            .await
        {
            log_structured_error(&err.context("change_id", change_id.to_string()));
        }
        Err((Some(change_id), reason))
    }

    async fn report(
        &self,
        delegation: &Delegation,
        status: ProposalStatus,
        change_id: Option<Uuid>,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut context = agent_registry::context([
            (protocol::PROPOSAL_ID, delegation.proposal_id.to_string()),
            (protocol::KIND, protocol::STATUS_REPORT.to_string()),
            (protocol::STATUS, status.as_wire().to_string()),
        ]);
        if let Some(change_id) = change_id {
            context.insert(protocol::CHANGE_ID.to_string(), change_id.to_string());
        }
        if let Some(reason) = reason {
            context.insert(protocol::REASON.to_string(), reason.to_string());
        }

        let content = match reason {
            Some(reason) => format!("{}: {}", status.as_wire(), reason),
            None => status.as_wire().to_string(),
        };
        self.broker
            .send(&self.name, &delegation.reply_to, content, context, Priority::Normal)
            .await?;
        Ok(())
    }

    // Ledger operations touch the filesystem synchronously.
    async fn with_ledger<F, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&CodeChangeTracker) -> std::result::Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || op(&ledger))
            .await
            .map_err(|e| Error::internal(format!("ledger task failed: {}", e)))?
            .map_err(Error::from)
    }
}

// orchestrator-service-rs/src/assistant.rs
//
// Process-wide wiring: one broker, one breaker registry, the workers, the
// router, the improvement engine, the change ledger and the implementer.
// Everything is constructed once here and handed down explicitly.

use std::sync::Arc;
use std::time::Duration;

use agent_registry::{CapabilityRegistry, MessageBroker};
use change_ledger::CodeChangeTracker;
use config_rs::AssistantConfig;
use error_handling_rs::{log_structured_error, Error, ErrorKind, ResilientCaller, Result};
use once_cell::sync::Lazy;
use regex::RegexSet;
use self_improve::{
    FileBackedRepository, ImproveError, ImprovementEngine, ImprovementProposal, ImprovementRepository,
    InboxReport, ProposalStatus, Severity,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::implementer::{ImplementationOutcome, ImplementerWorker};
use crate::inference::{HttpInferenceClient, InferenceBackend};
use crate::router::{RouteResult, Router};
use crate::routing::{RouteDecision, RoutingTable};
use crate::worker::{LlmWorker, Worker, WorkerRegistry};

/// Capability the video editor cannot work without
pub const VIDEO_CAPABILITY: &str = "ffmpeg";

const IMPLEMENTER_PROMPT: &str = "You are a careful Rust engineer. You write small, \
     self-contained, well-documented modules that compile without external crates.";

fn system_prompt(worker: &str) -> &'static str {
    match worker {
        "researcher" => "You research questions thoroughly and report findings as concise bullet points with sources where possible.",
        "organizer" => "You organize material into clear structured notes with headings and short summaries.",
        "scheduler" => "You turn plans into concrete schedules with dates, times and reminders.",
        "coder" => "You are a pragmatic software engineer. Answer with working code and a brief explanation.",
        "video_editor" => "You plan video edits as precise ffmpeg command sequences.",
        _ => "You are a helpful personal assistant. Be accurate and concise, and say plainly when you cannot do something.",
    }
}

// Phrases a worker uses when it cannot satisfy a request.
static INABILITY: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\bI(?:\s+am|'m|’m)\s+(?:not\s+able|unable)\s+to\b",
        r"(?i)\bI\s+(?:cannot|can\s+not|can't|can’t)\s+(?:do|help|perform|access|edit|open|process|run|create)\b",
        r"(?i)\bI\s+(?:don't|don’t|do\s+not)\s+have\s+(?:the\s+ability|access|a\s+way)\b",
        r"(?i)\b(?:beyond|outside)\s+(?:of\s+)?my\s+(?:current\s+)?capabilities\b",
    ])
    .expect("inability patterns are valid regular expressions")
});

/// Whether a worker reply admits it could not do what was asked
pub fn expresses_inability(reply: &str) -> bool {
    INABILITY.is_match(reply)
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "please", "can", "could", "would", "will", "you", "me", "my", "i", "to",
    "for", "of", "and", "some", "this", "that", "it", "is", "in", "on",
];

/// Short, stable description of what a request asks for, used as the gap
/// description so repeats of the same ask collapse onto one gap.
pub fn request_topic(request: &str) -> String {
    request
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !STOPWORDS.contains(w))
        .take(6)
        .collect::<Vec<_>>()
        .join(" ")
}

/// What one pass of the improvement pipeline did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImprovementCycle {
    pub delegated: usize,
    pub outcomes: Vec<ImplementationOutcome>,
    pub applied_reports: usize,
    pub rejected_reports: usize,
}

pub struct AssistantBuilder {
    config: AssistantConfig,
    backend: Option<Arc<dyn InferenceBackend>>,
    repository: Option<Arc<dyn ImprovementRepository + Send + Sync>>,
    capabilities: CapabilityRegistry,
    routes: Option<RoutingTable>,
}

impl AssistantBuilder {
    pub fn backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn ImprovementRepository + Send + Sync>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn capabilities(mut self, capabilities: CapabilityRegistry) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn routes(mut self, routes: RoutingTable) -> Self {
        self.routes = Some(routes);
        self
    }

    pub async fn build(self) -> Result<Assistant> {
        let config = self.config;

        let backend: Arc<dyn InferenceBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(HttpInferenceClient::new(&config.inference)?),
        };
        let repository: Arc<dyn ImprovementRepository + Send + Sync> = match self.repository {
            Some(repository) => repository,
            None => Arc::new(
                FileBackedRepository::new(&config.improvement.data_dir)
                    .map_err(|e| Error::from(ImproveError::from(e)))?,
            ),
        };
        let ledger = Arc::new(CodeChangeTracker::from_settings(&config.ledger)?);

        let broker = Arc::new(MessageBroker::new());
        let caller = Arc::new(ResilientCaller::from_settings(&config.resilience));

        let table = match self.routes {
            Some(table) => table,
            None => RoutingTable::standard()?,
        };
        let workers = standard_workers(&config, &backend, &caller, &table)?;
        let router = Router::new(table, workers)?;

        let engine = Arc::new(
            ImprovementEngine::open(config.improvement.clone(), Arc::clone(&broker), repository)
                .await?,
        );

        let generator: Arc<dyn Worker> = Arc::new(LlmWorker::new(
            config.improvement.implementer_agent.clone(),
            config.inference.default_model.clone(),
            IMPLEMENTER_PROMPT,
            Arc::clone(&backend),
            Arc::clone(&caller),
        ));
        let implementer = Arc::new(
            ImplementerWorker::new(
                config.improvement.implementer_agent.clone(),
                engine.agent_name(),
                Arc::clone(&broker),
                Arc::clone(&ledger),
                generator,
                config.ledger.generated_dir.clone(),
            )
            .await?,
        );

        tracing::info!(
            service = %config.logging.service_name,
            workers = router.workers().len(),
            capabilities = ?self.capabilities.available(),
            "Assistant assembled"
        );

        Ok(Assistant {
            config,
            broker,
            caller,
            capabilities: self.capabilities,
            router,
            engine,
            ledger,
            implementer,
        })
    }
}

// One LLM worker for every worker name the table refers to.
fn standard_workers(
    config: &AssistantConfig,
    backend: &Arc<dyn InferenceBackend>,
    caller: &Arc<ResilientCaller>,
    table: &RoutingTable,
) -> Result<WorkerRegistry> {
    let mut names: Vec<&str> = vec![table.default_worker()];
    for rule in table.rules() {
        names.extend(rule.workers.iter().map(String::as_str));
    }

    let mut registry = WorkerRegistry::new();
    for name in names {
        if registry.contains(name) {
            continue;
        }
        let mut worker = LlmWorker::new(
            name,
            config.inference.default_model.clone(),
            system_prompt(name),
            Arc::clone(backend),
            Arc::clone(caller),
        );
        if name == "video_editor" {
            worker = worker.with_capabilities([VIDEO_CAPABILITY]);
        }
        registry.register(Arc::new(worker))?;
    }
    Ok(registry)
}

pub struct Assistant {
    config: AssistantConfig,
    broker: Arc<MessageBroker>,
    caller: Arc<ResilientCaller>,
    capabilities: CapabilityRegistry,
    router: Router,
    engine: Arc<ImprovementEngine>,
    ledger: Arc<CodeChangeTracker>,
    implementer: Arc<ImplementerWorker>,
}

impl Assistant {
    pub fn builder(config: AssistantConfig) -> AssistantBuilder {
        AssistantBuilder {
            config,
            backend: None,
            repository: None,
            capabilities: CapabilityRegistry::default(),
            routes: None,
        }
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    pub fn caller(&self) -> &Arc<ResilientCaller> {
        &self.caller
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn engine(&self) -> &Arc<ImprovementEngine> {
        &self.engine
    }

    pub fn ledger(&self) -> &Arc<CodeChangeTracker> {
        &self.ledger
    }

    pub fn implementer(&self) -> &Arc<ImplementerWorker> {
        &self.implementer
    }

    /// Routes one request and reports any capability gap it reveals.
    #[instrument(skip_all)]
    pub async fn handle(&self, request: &str) -> RouteResult {
        let decision = self.router.classify(request);

        let missing = self.missing_capabilities(&decision);
        if !missing.is_empty() {
            for (worker, capability) in &missing {
                self.report_gap(
                    &format!("missing capability: {}", capability),
                    request,
                    Severity::High,
                    &[worker.clone()],
                )
                .await;
            }
            let names: Vec<&str> = missing.iter().map(|(_, c)| c.as_str()).collect();
            let err = Error::new(
                ErrorKind::DependencyUnavailable,
                format!("missing capabilities: {}", names.join(", ")),
            )
            .permanent()
            .service("router")
            .user_message(format!(
                "I can't do that yet: {} is not available on this system.",
                names.join(", ")
            ));
            return RouteResult::failure(&err, decision.rule.clone(), Vec::new());
        }

        let result = self.router.execute(request, &decision).await;
        if result.success && decision.is_default() && expresses_inability(&result.output) {
            let topic = request_topic(request);
            if !topic.is_empty() {
                self.report_gap(
                    &format!("unable to handle: {}", topic),
                    request,
                    Severity::Medium,
                    &decision.workers,
                )
                .await;
            }
        }
        result
    }

    // (worker, capability) pairs the decision needs but the host lacks.
    fn missing_capabilities(&self, decision: &RouteDecision) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for name in &decision.workers {
            if let Some(worker) = self.router.workers().get(name) {
                for capability in self.capabilities.missing(worker.required_capabilities()) {
                    missing.push((name.clone(), capability));
                }
            }
        }
        missing
    }

    // Gap reporting never fails the request that revealed the gap.
    async fn report_gap(&self, description: &str, example: &str, severity: Severity, workers: &[String]) {
        match self
            .engine
            .detect_gap(description, example, severity, workers)
            .await
        {
            Ok(gap_id) => tracing::info!(gap_id = %gap_id, description = %description, "Capability gap reported"),
            Err(err) => log_structured_error(&Error::from(err)),
        }
    }

    /// Delegates every IDENTIFIED proposal to the implementer.
    pub async fn delegate_identified(&self) -> Result<usize> {
        let proposals = self.engine.proposals().await;
        Ok(self.delegate_proposals(&proposals).await)
    }

    /// A proposal that cannot be delegated is logged and skipped; the rest
    /// of the batch still goes out.
    pub(crate) async fn delegate_proposals(&self, proposals: &[ImprovementProposal]) -> usize {
        let mut delegated = 0;
        for proposal in proposals {
            if proposal.status != ProposalStatus::Identified {
                continue;
            }
            match self
                .engine
                .delegate(proposal.id, self.implementer.name())
                .await
            {
                Ok(_) => delegated += 1,
                Err(err) => log_structured_error(
                    &Error::from(err).context("proposal_id", proposal.id.to_string()),
                ),
            }
        }
        delegated
    }

    /// Runs the improvement pipeline once: delegate, implement, then apply
    /// the implementer's status reports.
    pub async fn process_improvements(&self) -> Result<ImprovementCycle> {
        let delegated = self.delegate_identified().await?;
        let outcomes = self.implementer.process_pending().await?;
        let InboxReport { applied, rejected } = self.engine.process_inbox().await?;
        Ok(ImprovementCycle {
            delegated,
            outcomes,
            applied_reports: applied,
            rejected_reports: rejected,
        })
    }

    /// Starts the implementer and engine loops. They stop once `shutdown`
    /// carries `true`.
    pub fn spawn_background(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let implementer = Arc::clone(&self.implementer);
        let implementer_shutdown = shutdown.clone();
        let this = Arc::clone(self);
        vec![
            tokio::spawn(async move { implementer.run(implementer_shutdown).await }),
            tokio::spawn(async move { this.run_engine(shutdown).await }),
        ]
    }

    async fn run_engine(&self, mut shutdown: watch::Receiver<bool>) {
        let inbox = self.engine.agent_name().to_string();
        tracing::info!(agent = %inbox, "Improvement loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                waited = self.broker.wait(&inbox, Duration::from_secs(1)) => {
                    if let Err(err) = self.delegate_identified().await {
                        log_structured_error(&err);
                    }
                    match waited {
                        Ok(true) => {
                            if let Err(err) = self.engine.process_inbox().await {
                                log_structured_error(&Error::from(err));
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
        tracing::info!(agent = %inbox, "Improvement loop stopped");
    }
}

// orchestrator-service-rs/src/router.rs
//
// Runs a classified request through its worker sequence.
//
// Each step receives the previous step's output. The first failing step
// aborts the sequence; the steps recorded so far are returned with the
// failure so callers can report partial progress. Nothing is retried here.

use std::time::Instant;

use error_handling_rs::{log_structured_error, Error, ErrorKind};
use metrics::{histogram, increment_counter};
use serde::Serialize;
use tracing::instrument;

use crate::routing::{RouteDecision, RoutingTable};
use crate::worker::{WorkerError, WorkerRegistry};

/// One worker invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step_name: String,
    pub worker: String,
    pub output: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteResult {
    pub success: bool,
    /// Final step output, or the user-facing error message
    pub output: String,
    pub steps: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Name of the matching rule, `None` for the default route
    pub rule: Option<String>,
}

impl RouteResult {
    pub fn failure(error: &Error, rule: Option<String>, steps: Vec<StepRecord>) -> Self {
        let message = error.user_facing();
        Self {
            success: false,
            output: message.clone(),
            steps,
            error: Some(message),
            error_kind: Some(error.kind),
            rule,
        }
    }
}

/// Stateless dispatcher over a validated routing table.
pub struct Router {
    table: RoutingTable,
    workers: WorkerRegistry,
}

impl Router {
    /// Fails when the table names a worker the registry does not have.
    pub fn new(table: RoutingTable, workers: WorkerRegistry) -> Result<Self, WorkerError> {
        table.validate(&workers)?;
        tracing::info!(
            rules = table.rules().len(),
            workers = workers.len(),
            default_worker = %table.default_worker(),
            "Router initialized"
        );
        Ok(Self { table, workers })
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn classify(&self, request: &str) -> RouteDecision {
        self.table.classify(request)
    }

    pub async fn route(&self, request: &str) -> RouteResult {
        let decision = self.classify(request);
        self.execute(request, &decision).await
    }

    /// Runs an already classified request.
    #[instrument(skip_all, fields(rule = %decision.label(), steps = decision.workers.len()))]
    pub async fn execute(&self, request: &str, decision: &RouteDecision) -> RouteResult {
        let started = Instant::now();
        increment_counter!("router_requests_total", "rule" => decision.label().to_string());

        if request.trim().is_empty() {
            let err = Error::input_validation("Please tell me what you need help with.");
            return RouteResult::failure(&err, decision.rule.clone(), Vec::new());
        }

        let mut steps = Vec::with_capacity(decision.workers.len());
        let mut input = request.to_string();

        for (index, name) in decision.workers.iter().enumerate() {
            let step_name = format!("{}#{}", decision.label(), index + 1);
            let outcome = match self.workers.get(name) {
                Some(worker) => worker.handle(&input).await,
                None => Err(WorkerError::UnknownWorker(name.clone()).into()),
            };

            match outcome {
                Ok(output) => {
                    tracing::debug!(step = %step_name, worker = %name, "Step completed");
                    steps.push(StepRecord {
                        step_name,
                        worker: name.clone(),
                        output: output.clone(),
                        success: true,
                    });
                    input = output;
                }
                Err(err) => {
                    let err = err
                        .context("step", step_name.as_str())
                        .context("worker", name.as_str())
                        .context("completed_steps", steps.len());
                    log_structured_error(&err);
                    increment_counter!(
                        "router_failures_total",
                        "rule" => decision.label().to_string(),
                        "kind" => format!("{:?}", err.kind)
                    );
                    steps.push(StepRecord {
                        step_name,
                        worker: name.clone(),
                        output: err.user_facing(),
                        success: false,
                    });
                    return RouteResult::failure(&err, decision.rule.clone(), steps);
                }
            }
        }

        histogram!(
            "router_request_duration_seconds",
            started.elapsed().as_secs_f64(),
            "rule" => decision.label().to_string()
        );
        RouteResult {
            success: true,
            output: input,
            steps,
            error: None,
            error_kind: None,
            rule: decision.rule.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{Matcher, RoutingRule};
    use crate::worker::Worker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // Appends its own name to the input, or fails with `fail_with`.
    struct Stamp {
        name: String,
        fail_with: Option<ErrorKind>,
        calls: AtomicUsize,
    }

    impl Stamp {
        fn ok(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail_with: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &str, kind: ErrorKind) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail_with: Some(kind),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Worker for Stamp {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, task: &str) -> error_handling_rs::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(kind) => Err(Error::new(kind, format!("{} failed", self.name))),
                None => Ok(format!("{} > {}", task, self.name)),
            }
        }
    }

    fn table() -> RoutingTable {
        RoutingTable::new("general")
            .with_rule(RoutingRule::new(
                "workflow",
                vec![Matcher::keywords(["plan"]).unwrap()],
                ["researcher", "organizer", "scheduler"],
            ))
            .with_rule(RoutingRule::new(
                "notes",
                vec![Matcher::keywords(["notes"]).unwrap()],
                ["organizer"],
            ))
    }

    fn registry(workers: &[Arc<Stamp>]) -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        for worker in workers {
            registry.register(worker.clone() as Arc<dyn Worker>).unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_multi_step_chains_outputs() {
        let workers = [Stamp::ok("general"), Stamp::ok("researcher"), Stamp::ok("organizer"), Stamp::ok("scheduler")];
        let router = Router::new(table(), registry(&workers)).unwrap();

        let result = router.route("plan my trip").await;
        assert!(result.success);
        assert_eq!(result.rule.as_deref(), Some("workflow"));
        assert_eq!(result.output, "plan my trip > researcher > organizer > scheduler");
        let names: Vec<_> = result.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["workflow#1", "workflow#2", "workflow#3"]);
        assert_eq!(result.steps[1].output, "plan my trip > researcher > organizer");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_failing_step_aborts_remaining_steps() {
        let scheduler = Stamp::ok("scheduler");
        let workers = [
            Stamp::ok("general"),
            Stamp::ok("researcher"),
            Stamp::failing("organizer", ErrorKind::CircuitOpen),
            scheduler.clone(),
        ];
        let router = Router::new(table(), registry(&workers)).unwrap();

        let result = router.route("plan my week").await;
        assert!(!result.success);
        assert_eq!(result.steps.len(), 2);
        assert!(result.steps[0].success);
        assert!(!result.steps[1].success);
        assert_eq!(result.error_kind, Some(ErrorKind::CircuitOpen));
        assert_eq!(
            result.error.as_deref(),
            Some("That service is temporarily unavailable. Please try again shortly.")
        );
        assert_eq!(scheduler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_router_does_not_retry() {
        let general = Stamp::failing("general", ErrorKind::DependencyUnavailable);
        let workers = [general.clone(), Stamp::ok("researcher"), Stamp::ok("organizer"), Stamp::ok("scheduler")];
        let router = Router::new(table(), registry(&workers)).unwrap();

        let result = router.route("hello there").await;
        assert!(!result.success);
        assert!(result.rule.is_none());
        assert_eq!(general.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result.output,
            "I'm having trouble connecting right now. Please try again."
        );
    }

    #[tokio::test]
    async fn test_empty_request_is_rejected_without_steps() {
        let workers = [Stamp::ok("general"), Stamp::ok("researcher"), Stamp::ok("organizer"), Stamp::ok("scheduler")];
        let router = Router::new(table(), registry(&workers)).unwrap();

        let result = router.route("   ").await;
        assert!(!result.success);
        assert!(result.steps.is_empty());
        assert_eq!(result.error_kind, Some(ErrorKind::InputValidation));
    }

    #[test]
    fn test_router_rejects_unknown_workers() {
        let workers = [Stamp::ok("general"), Stamp::ok("organizer")];
        match Router::new(table(), registry(&workers)) {
            Err(WorkerError::InvalidRule { rule, .. }) => assert_eq!(rule, "workflow"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("router must not accept a table naming missing workers"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_routes_share_the_router() {
        let workers = [Stamp::ok("general"), Stamp::ok("researcher"), Stamp::ok("organizer"), Stamp::ok("scheduler")];
        let router = Arc::new(Router::new(table(), registry(&workers)).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let router = Arc::clone(&router);
                tokio::spawn(async move { router.route(&format!("notes {}", i)).await })
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap();
            assert!(result.success);
            assert_eq!(result.output, format!("notes {} > organizer", i));
        }
        assert_eq!(workers[2].calls.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_result_serializes_without_empty_error() {
        let result = RouteResult {
            success: true,
            output: "done".to_string(),
            steps: vec![],
            error: None,
            error_kind: None,
            rule: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["success"], serde_json::json!(true));
    }
}

// orchestrator-service-rs/src/lib.rs
// Library interface for the request router and its workers.
//
// Design notes:
// - Requests are classified by an ordered routing table and run through a
//   fixed worker sequence; each step gets the previous step's output.
// - Workers reach the inference backend only through the shared
//   ResilientCaller, one breaker per worker/model pair.
// - The Assistant wires the router to the improvement engine and the change
//   ledger, and owns the implementer that closes capability gaps.

pub mod assistant;
pub mod implementer;
pub mod inference;
pub mod router;
pub mod routing;
pub mod worker;


pub use crate::assistant::{Assistant, AssistantBuilder, ImprovementCycle};
pub use crate::implementer::{ChangeVerifier, ImplementationOutcome, ImplementerWorker, Verification};
pub use crate::inference::{ChatMessage, HttpInferenceClient, InferenceBackend};
pub use crate::router::{RouteResult, Router, StepRecord};
pub use crate::routing::{Matcher, RouteDecision, RoutingRule, RoutingTable, RuleSpec};
pub use crate::worker::{LlmWorker, Worker, WorkerError, WorkerRegistry};

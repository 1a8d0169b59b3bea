//! # Error Handling Framework
//!
//! Error taxonomy, structured logging and resilience primitives for the
//! assistant coordination core.
//!
//! ## Features
//!
//! - A single structured [`Error`] with a closed set of [`ErrorKind`]s
//! - Structured logging through `tracing`
//! - Input length and injection-denylist validation
//! - Per-dependency circuit breakers
//! - Retries with exponential backoff and bounded jitter
//! - [`ResilientCaller`], which composes all of the above around one call

pub mod types;
pub mod logging;
pub mod sanitization;
pub mod circuit_breaker;
pub mod retry;
pub mod caller;

// Re-export commonly used types
pub use types::{Error, ErrorKind, Result};
pub use logging::{init_logging, log_structured_error};
pub use sanitization::{InputValidator, DEFAULT_MAX_INPUT_CHARS};
pub use circuit_breaker::{
    BreakerPermit, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState, CircuitState,
};
pub use retry::RetryPolicy;
pub use caller::{CallOptions, ResilientCaller};

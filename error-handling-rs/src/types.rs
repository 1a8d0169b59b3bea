//! Error taxonomy.
//!
//! This module provides the error taxonomy shared by the coordination core:
//! resilience failures, messaging failures, lifecycle violations and
//! persistence errors all travel as one structured [`Error`].

use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result defaulting to the shared [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How a failure is surfaced and whether it may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed, oversized or unsafe input; correctable by the caller
    InputValidation,
    /// The dependency's circuit breaker is open; the call was not attempted
    CircuitOpen,
    /// A single attempt exceeded its hard deadline
    Timeout,
    /// All attempts against a dependency failed
    DependencyUnavailable,
    /// A message was addressed to a mailbox that was never registered
    UnknownRecipient,
    /// A proposal or change lifecycle edge outside the allowed graph
    InvalidStateTransition,
    /// Durable storage could not be read or written
    Storage,
    /// Connection-level failure talking to a dependency
    Communication,
    /// A dependency answered with something we could not interpret
    MalformedResponse,
    /// Anything else
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InputValidation => write!(f, "Input Validation Error"),
            ErrorKind::CircuitOpen => write!(f, "Circuit Breaker Open"),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::DependencyUnavailable => write!(f, "Dependency Unavailable"),
            ErrorKind::UnknownRecipient => write!(f, "Unknown Recipient"),
            ErrorKind::InvalidStateTransition => write!(f, "Invalid State Transition"),
            ErrorKind::Storage => write!(f, "Storage Error"),
            ErrorKind::Communication => write!(f, "Communication Error"),
            ErrorKind::MalformedResponse => write!(f, "Malformed Response"),
            ErrorKind::Internal => write!(f, "Internal Error"),
        }
    }
}

/// Core error type for the coordination core
///
/// `Clone` drops the opaque `cause`; everything structured is preserved.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    pub id: Uuid,
    pub kind: ErrorKind,
    /// Operator-facing detail; never shown to the requester as-is
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// The dependency or component where the error originated
    pub service: Option<String>,
    /// User-facing message overriding the default for the kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    /// Structured fields for logs: dependency, attempts, step, proposal_id
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Underlying cause (not serialized)
    #[serde(skip)]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
    /// Whether a retry could plausibly succeed
    pub transient: bool,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            message: self.message.clone(),
            timestamp: self.timestamp,
            service: self.service.clone(),
            user_message: self.user_message.clone(),
            context: self.context.clone(),
            cause: None,
            transient: self.transient,
        }
    }
}

impl Error {
    /// Connection, timeout and decode failures start out transient.
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            service: None,
            user_message: None,
            context: serde_json::Map::new(),
            cause: None,
            transient: matches!(
                kind,
                ErrorKind::Timeout | ErrorKind::Communication | ErrorKind::MalformedResponse
            ),
        }
    }

    pub fn input_validation<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::InputValidation, message)
    }

    pub fn circuit_open<S: Into<String>>(dependency: S) -> Self {
        let dependency = dependency.into();
        Self::new(
            ErrorKind::CircuitOpen,
            format!("circuit breaker open for {}", dependency),
        )
        .service(dependency)
    }

    pub fn timeout<S: Into<String>>(dependency: S, after: std::time::Duration) -> Self {
        let dependency = dependency.into();
        Self::new(
            ErrorKind::Timeout,
            format!("call to {} timed out after {:?}", dependency, after),
        )
        .service(dependency)
        .context("timeout_ms", after.as_millis() as u64)
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Sets the originating service or dependency
    pub fn service<S: Into<String>>(mut self, service: S) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn user_message<S: Into<String>>(mut self, message: S) -> Self {
        self.user_message = Some(message.into());
        self
    }

    /// Values that fail to serialize are dropped.
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Permanent failures are surfaced without retrying and without
    /// counting against the dependency's breaker.
    pub fn permanent(mut self) -> Self {
        self.transient = false;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Whether the retry loop may attempt the call again after this error.
    /// Only transient failures qualify, and never a validation failure or a
    /// fast-fail from an open breaker.
    pub fn is_retryable(&self) -> bool {
        self.transient
            && !matches!(
                self.kind,
                ErrorKind::InputValidation | ErrorKind::CircuitOpen | ErrorKind::UnknownRecipient
            )
    }

    /// Message suitable for showing to the person who made the request.
    pub fn user_facing(&self) -> String {
        if let Some(message) = &self.user_message {
            return message.clone();
        }
        match self.kind {
            ErrorKind::InputValidation => self.message.clone(),
            ErrorKind::CircuitOpen => {
                "That service is temporarily unavailable. Please try again shortly.".to_string()
            }
            ErrorKind::Timeout
            | ErrorKind::DependencyUnavailable
            | ErrorKind::Communication
            | ErrorKind::MalformedResponse => {
                "I'm having trouble connecting right now. Please try again.".to_string()
            }
            ErrorKind::UnknownRecipient
            | ErrorKind::InvalidStateTransition
            | ErrorKind::Storage
            | ErrorKind::Internal => "Something went wrong while handling that request.".to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;

        if let Some(service) = &self.service {
            write!(f, " [Service: {}]", service)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Storage, err.to_string()).cause(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            ErrorKind::Communication
        } else if err.is_decode() {
            ErrorKind::MalformedResponse
        } else {
            ErrorKind::DependencyUnavailable
        };

        let transient = err.is_timeout()
            || err.is_connect()
            || err.is_decode()
            || err.status().map_or(false, |s| s.as_u16() >= 500);

        let mut error = Self::new(kind, format!("HTTP request error: {}", err)).cause(err);
        error.transient = transient;
        error
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::MalformedResponse, format!("JSON error: {}", err)).cause(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::new(ErrorKind::Communication, "connection refused")
            .service("planner:llama3")
            .context("attempt", 2);

        assert_eq!(err.kind, ErrorKind::Communication);
        assert_eq!(err.message, "connection refused");
        assert_eq!(err.service.as_deref(), Some("planner:llama3"));
        assert_eq!(err.context.get("attempt"), Some(&serde_json::json!(2)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = Error::circuit_open("planner:llama3");
        let display = format!("{}", err);
        assert!(display.contains("Circuit Breaker Open"));
        assert!(display.contains("Service: planner:llama3"));
    }

    #[test]
    fn test_user_facing_messages() {
        let validation = Error::input_validation("input exceeds 10000 characters");
        assert_eq!(validation.user_facing(), "input exceeds 10000 characters");

        let open = Error::circuit_open("dep");
        assert!(open.user_facing().contains("temporarily unavailable"));

        let unavailable = Error::new(ErrorKind::DependencyUnavailable, "gave up");
        assert!(unavailable.user_facing().contains("trouble connecting"));

        let storage = Error::new(ErrorKind::Storage, "disk full at /var/data");
        assert!(!storage.user_facing().contains("/var/data"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!Error::input_validation("bad").is_retryable());
        assert!(!Error::circuit_open("dep").is_retryable());
        assert!(Error::timeout("dep", std::time::Duration::from_secs(1)).is_retryable());
        assert!(Error::new(ErrorKind::MalformedResponse, "garbage").is_retryable());
        assert!(!Error::new(ErrorKind::Communication, "HTTP 404").permanent().is_retryable());
        assert!(!Error::internal("bug").is_retryable());
        assert!(Error::internal("task panicked").transient().is_retryable());
    }

    #[test]
    fn test_clone_drops_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::from(io);
        assert!(err.source().is_some());
        let cloned = err.clone();
        assert!(cloned.source().is_none());
        assert_eq!(cloned.id, err.id);
    }
}

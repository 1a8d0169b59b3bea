//! # Resilient Caller
//!
//! Wraps every call to an external dependency with input validation, a
//! per-dependency circuit breaker, a hard per-attempt timeout and retries
//! with exponential backoff.
//!
//! Each attempt runs as its own task. When the deadline passes the task is
//! aborted and its result discarded, so an operation that never yields back
//! to the executor still cannot hold the caller past its timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use config_rs::ResilienceSettings;
use metrics::{histogram, increment_counter};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState};
use crate::retry::RetryPolicy;
use crate::sanitization::InputValidator;
use crate::types::{Error, ErrorKind, Result};

/// Per-call knobs; defaults come from the caller's configuration
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Hard deadline for a single attempt
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&ResilienceSettings> for CallOptions {
    fn from(settings: &ResilienceSettings) -> Self {
        Self {
            timeout: settings.call_timeout(),
            retry: RetryPolicy::from(settings),
        }
    }
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Composition of validation, breaker, timeout and retry around a call
#[derive(Debug, Clone)]
pub struct ResilientCaller {
    validator: InputValidator,
    breakers: Arc<CircuitBreakerRegistry>,
    defaults: CallOptions,
}

impl Default for ResilientCaller {
    fn default() -> Self {
        Self::new(
            InputValidator::default(),
            Arc::new(CircuitBreakerRegistry::default()),
            CallOptions::default(),
        )
    }
}

impl ResilientCaller {
    pub fn new(
        validator: InputValidator,
        breakers: Arc<CircuitBreakerRegistry>,
        defaults: CallOptions,
    ) -> Self {
        Self {
            validator,
            breakers,
            defaults,
        }
    }

    pub fn from_settings(settings: &ResilienceSettings) -> Self {
        Self::new(
            InputValidator::new(settings.max_input_chars),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::from(
                settings,
            ))),
            CallOptions::from(settings),
        )
    }

    /// Options used when a caller does not supply its own
    pub fn default_options(&self) -> &CallOptions {
        &self.defaults
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Current breaker state for a dependency key
    pub fn breaker_state(&self, dependency: &str) -> CircuitBreakerState {
        self.breakers.snapshot(dependency)
    }

    /// Calls `operation` with the sanitized `input` using default options
    pub async fn call<F, Fut, T>(&self, dependency: &str, input: &str, operation: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let options = self.defaults.clone();
        self.call_with(dependency, input, &options, operation).await
    }

    /// Calls `operation` with the sanitized `input`.
    ///
    /// `operation` is not invoked at all when validation fails or the
    /// dependency's circuit is open. After the last failed attempt the error
    /// is wrapped as `DependencyUnavailable`.
    #[instrument(skip(self, input, options, operation), fields(max_attempts = options.retry.max_attempts))]
    pub async fn call_with<F, Fut, T>(
        &self,
        dependency: &str,
        input: &str,
        options: &CallOptions,
        operation: F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let input = self.validator.validate(input)?;
        let max_attempts = options.retry.max_attempts.max(1);
        let mut last_error: Option<Error> = None;

        for attempt in 0..max_attempts {
            // An open circuit fails fast, even in the middle of a retry loop.
            let permit = self.breakers.try_acquire(dependency)?;
            increment_counter!("resilient_call_attempts_total", "dependency" => dependency.to_string());

            let started = Instant::now();
            let outcome = run_with_deadline(operation(input.clone()), options.timeout).await;
            histogram!(
                "resilient_call_duration_seconds",
                started.elapsed().as_secs_f64(),
                "dependency" => dependency.to_string()
            );

            let err = match outcome {
                Some(Ok(value)) => {
                    self.breakers.record_success(dependency, permit);
                    debug!(dependency = %dependency, attempt = attempt + 1, "call succeeded");
                    return Ok(value);
                }
                Some(Err(err)) if !err.is_retryable() => {
                    self.breakers.release(dependency, permit);
                    return Err(err);
                }
                Some(Err(err)) => err,
                None => Error::timeout(dependency, options.timeout),
            };

            self.breakers.record_failure(dependency, permit);
            increment_counter!(
                "resilient_call_failures_total",
                "dependency" => dependency.to_string(),
                "kind" => format!("{:?}", err.kind)
            );

            if attempt + 1 < max_attempts {
                let delay = options.retry.next_delay(attempt);
                warn!(
                    dependency = %dependency,
                    attempt = attempt + 1,
                    max_attempts = max_attempts,
                    error_kind = %err.kind,
                    delay_ms = %delay.as_millis(),
                    "call failed, retrying"
                );
                last_error = Some(err);
                tokio::time::sleep(delay).await;
            } else {
                last_error = Some(err);
            }
        }

        let last = last_error
            .unwrap_or_else(|| Error::internal("retry loop finished without an outcome"));
        warn!(
            dependency = %dependency,
            attempts = max_attempts,
            error_kind = %last.kind,
            "dependency unavailable after retries"
        );
        Err(Error::new(
            ErrorKind::DependencyUnavailable,
            format!(
                "{} unavailable after {} attempts: {}",
                dependency, max_attempts, last.message
            ),
        )
        .service(dependency)
        .context("attempts", max_attempts)
        .context("last_error_kind", last.kind)
        .cause(last))
    }
}

/// Aborts the attempt task when the waiting side goes away, whether the
/// deadline passed or the caller itself was cancelled.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs `fut` on its own task; `None` means the deadline passed and the task
/// was aborted.
async fn run_with_deadline<Fut, T>(fut: Fut, deadline: Duration) -> Option<Result<T>>
where
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut task = AbortOnDrop(tokio::spawn(fut));
    match tokio::time::timeout(deadline, &mut task.0).await {
        Ok(Ok(result)) => Some(result),
        Ok(Err(join_error)) => Some(Err(Error::internal(format!(
            "call task failed: {}",
            join_error
        ))
        .transient())),
        Err(_) => None,
    }
}

//! Retry and circuit breaking for outbound calls.
//!
//! Every call to the blob store, the metadata repository or the event bus
//! goes through a [`ResiliencePolicy`] owned by that dependency. The policy
//! bounds each attempt with a timeout, retries failures the callee reports as
//! safe to retry with exponential backoff and jitter, and feeds every outcome
//! into the dependency's [`CircuitBreaker`].

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{DependencyPolicyConfig, ResilienceConfig, RetryConfig};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Outbound dependency guarded by its own policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    BlobStore,
    Metadata,
    Events,
}

impl Dependency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::BlobStore => "blob_store",
            Dependency::Metadata => "metadata",
            Dependency::Events => "events",
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a failed call relates to the side effect it attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The request is known not to have been applied (refused connection,
    /// exhausted pool, throttling).
    Transient,
    /// The request may or may not have been applied (timeout, reset
    /// mid-flight).
    Ambiguous,
    /// Retrying cannot help (validation, not found, version conflict).
    Permanent,
}

/// Implemented by dependency errors so the policy can decide on retries
pub trait Classify {
    fn failure_class(&self) -> FailureClass;
}

/// Whether repeating a call that may already have landed is harmless
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// Content-addressed puts, reads, deletes of absent keys, at-least-once
    /// publishes.
    Idempotent,
    /// Creates and compare-and-swap writes: only retried when the previous
    /// attempt is known not to have landed.
    NonIdempotent,
}

/// Failure of a single attempt
#[derive(Debug, Error)]
pub enum AttemptError<E> {
    #[error(transparent)]
    Failed(E),

    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
}

impl<E> AttemptError<E> {
    /// The dependency's own error, if the attempt did not time out
    pub fn inner(&self) -> Option<&E> {
        match self {
            AttemptError::Failed(e) => Some(e),
            AttemptError::TimedOut(_) => None,
        }
    }
}

/// Outcome of a call the policy could not complete
#[derive(Debug, Error)]
pub enum PolicyError<E> {
    /// The breaker rejected the call without invoking the dependency.
    #[error("circuit open for {dependency}")]
    CircuitOpen { dependency: Dependency },

    /// The dependency answered with a permanent failure.
    #[error("{dependency} rejected {operation}: {source}")]
    Rejected {
        dependency: Dependency,
        operation: &'static str,
        #[source]
        source: E,
    },

    /// The retry budget ran out, or the last failure was not safe to retry.
    #[error("{dependency} {operation} failed after {attempts} attempt(s): {last}")]
    Exhausted {
        dependency: Dependency,
        operation: &'static str,
        attempts: u32,
        #[source]
        last: AttemptError<E>,
    },
}

impl<E> PolicyError<E> {
    /// The permanent error the dependency answered with, if any
    pub fn rejection(&self) -> Option<&E> {
        match self {
            PolicyError::Rejected { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, PolicyError::CircuitOpen { .. })
    }
}

/// Retry and circuit breaker wrapper for one dependency
#[derive(Debug)]
pub struct ResiliencePolicy {
    dependency: Dependency,
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl ResiliencePolicy {
    pub fn new(dependency: Dependency, config: &DependencyPolicyConfig) -> Self {
        Self {
            dependency,
            retry: config.retry.clone(),
            breaker: CircuitBreaker::new(dependency, config.circuit_breaker.clone()),
        }
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry.initial_backoff())
            .with_max_interval(self.retry.max_backoff())
            .with_multiplier(self.retry.multiplier)
            .with_randomization_factor(self.retry.jitter)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `call` under this policy.
    ///
    /// `call` is invoked once per attempt. Permanent failures are returned as
    /// [`PolicyError::Rejected`] and count as healthy answers for the
    /// breaker. Transient failures are retried; ambiguous ones only when the
    /// call is [`Idempotency::Idempotent`].
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: &'static str,
        idempotency: Idempotency,
        mut call: F,
    ) -> Result<T, PolicyError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let dependency = self.dependency.as_str();
        let mut backoff = self.backoff();
        let mut attempts = 0u32;

        loop {
            let Some(permit) = self.breaker.try_acquire() else {
                debug!(dependency, operation, "call rejected by open circuit");
                metrics::counter!("picture.circuit.rejected", "dependency" => dependency)
                    .increment(1);
                return Err(PolicyError::CircuitOpen {
                    dependency: self.dependency,
                });
            };

            attempts += 1;
            metrics::counter!("picture.retry.attempts", "dependency" => dependency).increment(1);

            let timeout = self.retry.attempt_timeout();
            let (class, failure) = match tokio::time::timeout(timeout, call()).await {
                Ok(Ok(value)) => {
                    permit.succeeded();
                    return Ok(value);
                }
                Ok(Err(e)) => match e.failure_class() {
                    FailureClass::Permanent => {
                        permit.succeeded();
                        return Err(PolicyError::Rejected {
                            dependency: self.dependency,
                            operation,
                            source: e,
                        });
                    }
                    class => (class, AttemptError::Failed(e)),
                },
                Err(_) => (FailureClass::Ambiguous, AttemptError::TimedOut(timeout)),
            };
            permit.failed();

            let retryable = match class {
                FailureClass::Transient => true,
                FailureClass::Ambiguous => idempotency == Idempotency::Idempotent,
                FailureClass::Permanent => false,
            };

            if !retryable || attempts >= self.retry.max_attempts {
                warn!(
                    dependency,
                    operation,
                    attempts,
                    retryable,
                    error = %failure,
                    "giving up on dependency call"
                );
                metrics::counter!(
                    "picture.retry.exhausted",
                    "dependency" => dependency,
                    "operation" => operation
                )
                .increment(1);
                return Err(PolicyError::Exhausted {
                    dependency: self.dependency,
                    operation,
                    attempts,
                    last: failure,
                });
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| self.retry.max_backoff());
            debug!(
                dependency,
                operation,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying dependency call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// One independent policy per dependency
#[derive(Debug, Clone)]
pub struct PolicySet {
    pub blob_store: Arc<ResiliencePolicy>,
    pub metadata: Arc<ResiliencePolicy>,
    pub events: Arc<ResiliencePolicy>,
}

impl PolicySet {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            blob_store: Arc::new(ResiliencePolicy::new(
                Dependency::BlobStore,
                &config.blob_store,
            )),
            metadata: Arc::new(ResiliencePolicy::new(Dependency::Metadata, &config.metadata)),
            events: Arc::new(ResiliencePolicy::new(Dependency::Events, &config.events)),
        }
    }
}

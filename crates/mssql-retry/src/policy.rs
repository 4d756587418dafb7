//! Retry execution.
//!
//! A [`RetryPolicy`] is built once per configuration and shared freely:
//! every call to [`RetryPolicy::execute`] or [`RetryPolicy::execute_blocking`]
//! starts its own interval generator, so concurrent executions never observe
//! each other's attempt counters.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::RetryOptions;
use crate::fault::{RetryError, RetryableFault};
use crate::interval::{IntervalGenerator, IntervalPolicy};
use crate::transient::TransientErrors;

/// Granularity of the blocking wait's cancellation checks.
const BLOCKING_WAIT_SLICE: Duration = Duration::from_millis(10);

/// Decides whether a fault is worth retrying.
pub type TransientClassifier = Arc<dyn Fn(&dyn RetryableFault) -> bool + Send + Sync>;

/// Decides whether an operation, described by its statement text, may be retried.
pub type EligibilityPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Observer invoked before every retry.
pub type RetryListener = Arc<dyn Fn(&RetryingEvent<'_>) + Send + Sync>;

/// Reported before each retry. Listeners cannot influence the outcome.
#[derive(Debug)]
pub struct RetryingEvent<'a> {
    /// Number of attempts made so far.
    pub attempt: u32,
    /// Wait before the next attempt.
    pub delay: Duration,
    /// The fault that triggered this retry.
    pub last_fault: &'a dyn RetryableFault,
}

/// Per-call options: what is being executed and how to cancel it.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    description: Option<String>,
    cancellation: CancellationToken,
}

impl RetryContext {
    /// A context with no description and a fresh cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context describing a statement, checked against the eligibility predicate.
    #[must_use]
    pub fn for_statement(sql: impl Into<String>) -> Self {
        Self {
            description: Some(sql.into()),
            cancellation: CancellationToken::new(),
        }
    }

    /// Observe `token` while waiting between attempts.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// The operation description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The cancellation token observed between attempts.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Attempt count, interval strategy and fault classification bundled together.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    interval: IntervalPolicy,
    classifier: TransientClassifier,
    eligibility: Option<EligibilityPredicate>,
    listeners: Vec<RetryListener>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("interval", &self.interval)
            .field("has_eligibility", &self.eligibility.is_some())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Create a policy classifying faults with the built-in transient table.
    ///
    /// `max_attempts` counts the first attempt; zero is treated as one.
    pub fn new(max_attempts: u32, interval: IntervalPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
            classifier: classifier_for(TransientErrors::default()),
            eligibility: None,
            listeners: Vec::new(),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, IntervalPolicy::none()).classifier(|_| false)
    }

    /// Built-in fixed-interval policy.
    #[must_use]
    pub fn fixed(options: &RetryOptions) -> Self {
        Self::from_options(IntervalPolicy::fixed(options.delta_time), options)
    }

    /// Built-in incremental-interval policy.
    #[must_use]
    pub fn incremental(options: &RetryOptions) -> Self {
        Self::from_options(IntervalPolicy::incremental(options.delta_time), options)
    }

    /// Built-in exponential-interval policy.
    #[must_use]
    pub fn exponential(options: &RetryOptions) -> Self {
        Self::from_options(IntervalPolicy::exponential(options.delta_time), options)
    }

    fn from_options(interval: IntervalPolicy, options: &RetryOptions) -> Self {
        let interval = interval
            .min_interval(options.min_time)
            .max_interval(options.max_time);
        let policy = Self::new(options.number_of_tries, interval)
            .transient_errors(options.transient_errors.clone());

        match options.authorized_sql.clone() {
            Some(condition) => policy.eligibility(move |sql| condition.is_match(sql)),
            None => policy,
        }
    }

    /// Classify faults with `errors` instead of the built-in table.
    #[must_use]
    pub fn transient_errors(self, errors: TransientErrors) -> Self {
        Self {
            classifier: classifier_for(errors),
            ..self
        }
    }

    /// Classify faults with a custom predicate.
    #[must_use]
    pub fn classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&dyn RetryableFault) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Only retry operations whose description satisfies `predicate`.
    #[must_use]
    pub fn eligibility<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.eligibility = Some(Arc::new(predicate));
        self
    }

    /// Register an observer for retry events.
    #[must_use]
    pub fn on_retrying<F>(mut self, listener: F) -> Self
    where
        F: Fn(&RetryingEvent<'_>) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Maximum number of attempts, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The interval strategy.
    #[must_use]
    pub fn interval(&self) -> &IntervalPolicy {
        &self.interval
    }

    /// Check if a fault should be retried.
    #[must_use]
    pub fn is_transient(&self, fault: &dyn RetryableFault) -> bool {
        (self.classifier)(fault)
    }

    /// Check if an operation may be retried.
    ///
    /// Operations without a description are always eligible.
    #[must_use]
    pub fn is_eligible(&self, description: Option<&str>) -> bool {
        match (&self.eligibility, description) {
            (Some(predicate), Some(description)) => predicate(description),
            _ => true,
        }
    }

    /// Run `operation`, waiting asynchronously between attempts.
    pub async fn execute<T, E, F, Fut>(
        &self,
        context: &RetryContext,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: RetryableFault,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut state = RetryState::new(self);
        loop {
            let fault = match operation().await {
                Ok(value) => return Ok(value),
                Err(fault) => fault,
            };

            let delay = state.on_fault(context, fault)?;
            tokio::select! {
                biased;
                _ = context.cancellation.cancelled() => return Err(state.cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run `operation`, blocking the current thread between attempts.
    ///
    /// The wait still observes the context's cancellation token.
    pub fn execute_blocking<T, E, F>(
        &self,
        context: &RetryContext,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: RetryableFault,
        F: FnMut() -> Result<T, E>,
    {
        let mut state = RetryState::new(self);
        loop {
            let fault = match operation() {
                Ok(value) => return Ok(value),
                Err(fault) => fault,
            };

            let delay = state.on_fault(context, fault)?;
            if !wait_blocking(delay, &context.cancellation) {
                return Err(state.cancelled());
            }
        }
    }
}

/// Run `operation` under `policy` with a default context.
pub async fn execute_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, RetryError<E>>
where
    E: RetryableFault,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    policy.execute(&RetryContext::default(), operation).await
}

fn classifier_for(errors: TransientErrors) -> TransientClassifier {
    Arc::new(move |fault| errors.is_transient(fault))
}

/// Returns `false` if cancelled before `delay` elapsed.
fn wait_blocking(delay: Duration, token: &CancellationToken) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(BLOCKING_WAIT_SLICE));
    }
}

/// Mutable state of a single execution.
struct RetryState<'p, E> {
    policy: &'p RetryPolicy,
    intervals: IntervalGenerator,
    faults: Vec<E>,
}

impl<'p, E: RetryableFault> RetryState<'p, E> {
    fn new(policy: &'p RetryPolicy) -> Self {
        Self {
            policy,
            intervals: policy.interval.generator(),
            faults: Vec::new(),
        }
    }

    /// Record a fault and return the wait before the next attempt.
    fn on_fault(&mut self, context: &RetryContext, fault: E) -> Result<Duration, RetryError<E>> {
        let policy = self.policy;
        if !policy.is_eligible(context.description()) || !policy.is_transient(&fault) {
            tracing::debug!(
                previous_faults = self.faults.len(),
                error = %fault,
                "fault is not retryable"
            );
            return Err(RetryError::Fault(fault));
        }

        self.faults.push(fault);
        let attempt = self.faults.len() as u32;
        if attempt >= policy.max_attempts {
            tracing::warn!(attempts = attempt, "retry limit exceeded");
            return Err(RetryError::Exhausted {
                faults: std::mem::take(&mut self.faults),
            });
        }

        let delay = self.intervals.next_interval();
        if let Some(last_fault) = self.faults.last() {
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last_fault,
                "retrying after transient fault"
            );
            let event = RetryingEvent {
                attempt,
                delay,
                last_fault,
            };
            for listener in &policy.listeners {
                listener(&event);
            }
        }
        Ok(delay)
    }

    fn cancelled(&mut self) -> RetryError<E> {
        tracing::debug!(attempts = self.faults.len(), "retry cancelled");
        RetryError::Cancelled {
            faults: std::mem::take(&mut self.faults),
        }
    }
}

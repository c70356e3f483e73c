//! Ordered (strategy, backoff policy) execution shared by index queries,
//! model fallback and safety-filter retries.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const MAX_SHIFT: u32 = 16;

pub type AttemptFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Bounded exponential backoff: `base_delay << attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Single attempt, no retries.
    pub const ONCE: Self = Self {
        max_retries: 0,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };

    #[must_use]
    pub fn exponential(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: base_delay.saturating_mul(1 << MAX_SHIFT.min(max_retries)),
        }
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1 << attempt.min(MAX_SHIFT))
            .min(self.max_delay)
    }
}

/// What the executor should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Retry the same strategy if its policy allows, otherwise move on.
    Retry,
    /// Skip remaining retries and move to the next strategy.
    NextStrategy,
    /// Stop immediately and surface the error.
    Abort,
}

pub struct Strategy<'a, T, E> {
    label: String,
    policy: BackoffPolicy,
    attempt: Box<dyn FnMut() -> AttemptFuture<'a, T, E> + Send + 'a>,
}

impl<T, E> std::fmt::Debug for Strategy<'_, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy")
            .field("label", &self.label)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<'a, T, E> Strategy<'a, T, E> {
    pub fn new<F, Fut>(label: impl Into<String>, policy: BackoffPolicy, mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
    {
        Self {
            label: label.into(),
            policy,
            attempt: Box::new(move || Box::pin(f())),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Debug)]
pub struct RetrySuccess<T> {
    pub value: T,
    /// Position of the strategy that produced `value`.
    pub strategy: usize,
    pub label: String,
    pub attempts: u32,
    pub retries: u32,
}

#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Last error observed; `None` only when no strategy was supplied.
    pub error: Option<E>,
    pub aborted: bool,
    pub attempts: u32,
    pub retries: u32,
}

impl<E> RetryFailure<E> {
    pub fn into_error(self, otherwise: impl FnOnce() -> E) -> E {
        self.error.unwrap_or_else(otherwise)
    }
}

/// Run `strategies` in order until one succeeds.
///
/// Each failed attempt is passed to `classify`. `Verdict::Retry` sleeps per the
/// strategy's policy and tries again while retries remain, then falls through to
/// the next strategy.
///
/// # Errors
///
/// Returns the last error with attempt counters once every strategy has failed,
/// or immediately when `classify` returns `Verdict::Abort`.
pub async fn execute<T, E, C>(
    strategies: Vec<Strategy<'_, T, E>>,
    classify: C,
) -> Result<RetrySuccess<T>, RetryFailure<E>>
where
    E: std::fmt::Display,
    C: Fn(&E) -> Verdict,
{
    let mut attempts = 0u32;
    let mut retries = 0u32;
    let mut last_error = None;

    for (index, mut strategy) in strategies.into_iter().enumerate() {
        let mut attempt = 0u32;
        loop {
            attempts += 1;
            match (strategy.attempt)().await {
                Ok(value) => {
                    return Ok(RetrySuccess {
                        value,
                        strategy: index,
                        label: strategy.label,
                        attempts,
                        retries,
                    });
                }
                Err(e) => {
                    let verdict = classify(&e);
                    match verdict {
                        Verdict::Abort => {
                            return Err(RetryFailure {
                                error: Some(e),
                                aborted: true,
                                attempts,
                                retries,
                            });
                        }
                        Verdict::Retry if attempt < strategy.policy.max_retries => {
                            let delay = strategy.policy.delay_for(attempt);
                            tracing::warn!(
                                strategy = %strategy.label,
                                attempt = attempt + 1,
                                max_retries = strategy.policy.max_retries,
                                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                error = %e,
                                "retrying"
                            );
                            last_error = Some(e);
                            attempt += 1;
                            retries += 1;
                            tokio::time::sleep(delay).await;
                        }
                        Verdict::Retry | Verdict::NextStrategy => {
                            tracing::warn!(strategy = %strategy.label, error = %e, "strategy failed, moving on");
                            last_error = Some(e);
                            break;
                        }
                    }
                }
            }
        }
    }

    Err(RetryFailure {
        error: last_error,
        aborted: false,
        attempts,
        retries,
    })
}

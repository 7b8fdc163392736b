use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::RetryPolicy;

/// Future returned by one attempt of a request's work.
pub type WorkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send + 'static>>;

/// Re-invocable unit of work. Every call starts a fresh attempt, so the work
/// must be idempotent.
pub type Work<E> = Box<dyn FnMut() -> WorkFuture<E> + Send>;

/// Decides whether the error from the latest attempt is worth retrying.
pub type RetryPredicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

/// Predicate that accepts every error.
pub fn always_retry<E>() -> RetryPredicate<E> {
    Box::new(|_| true)
}

/// A unit of work dispatched to the pool.
pub struct Request<E> {
    pub(crate) id: String,
    pub(crate) work: Work<E>,
    pub(crate) should_retry: RetryPredicate<E>,
    pub(crate) policy: RetryPolicy,
}

impl<E> Request<E> {
    /// Creates a request retried on any error under the default policy.
    pub fn new<F>(id: impl Into<String>, work: F) -> Self
    where
        F: FnMut() -> WorkFuture<E> + Send + 'static,
    {
        Self {
            id: id.into(),
            work: Box::new(work),
            should_retry: always_retry(),
            policy: RetryPolicy::default(),
        }
    }

    /// Replaces the retry predicate.
    pub fn with_retry_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Box::new(predicate);
        self
    }

    /// Replaces the attempt limit and backoff.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<E> fmt::Debug for Request<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Why the last attempt of a failed request did not succeed.
#[derive(Debug)]
pub enum AttemptError<E> {
    /// The work returned an error.
    Failed(E),
    /// The work panicked before returning.
    Panicked(String),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{e}"),
            Self::Panicked(msg) => write!(f, "attempt panicked: {msg}"),
        }
    }
}

/// A request that failed for good: the predicate or policy refused another
/// attempt, an attempt panicked, or the pool was torn down while it was
/// waiting to retry.
#[derive(Debug)]
pub struct RequestFailure<E> {
    pub id: String,
    pub attempts: u32,
    pub error: AttemptError<E>,
}

impl<E: fmt::Display> fmt::Display for RequestFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request {} failed after {} attempt(s): {}",
            self.id, self.attempts, self.error
        )
    }
}

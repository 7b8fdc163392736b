//! Fixed-size worker pool for upload requests.
//!
//! Requests flow in over a bounded [`tokio::sync::mpsc`] queue shared by all
//! workers; the queue depth is the backpressure that limits how far request
//! production runs ahead of completion. Each request carries its own
//! [`RetryPolicy`] and retry predicate. Terminal failures are published on an
//! error channel and the pool reports an aggregated [`PoolReport`] once every
//! worker has exited.

mod pool;
mod request;
mod retry;

pub use pool::{Balancer, PoolReport, request_queue};
pub use request::{
    AttemptError, Request, RequestFailure, RetryPredicate, Work, WorkFuture, always_retry,
};
pub use retry::RetryPolicy;

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{AttemptError, Request, RequestFailure};

/// Creates the request queue feeding a [`Balancer`].
///
/// A capacity of zero behaves like an unbuffered hand-off: the channel holds a
/// single slot, so producers block until a worker is ready.
pub fn request_queue<E>(capacity: usize) -> (mpsc::Sender<Request<E>>, mpsc::Receiver<Request<E>>) {
    mpsc::channel(capacity.max(1))
}

/// Summary sent once every worker has exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    /// Requests that eventually succeeded.
    pub completed: usize,
    /// Ids of requests that failed for good.
    pub failed: Vec<String>,
    /// Whether the pool stopped because of [`Balancer::tear_down_workers`].
    pub torn_down: bool,
    /// Workers that died outside a request attempt. Whatever request such a
    /// worker held is in neither `completed` nor `failed`.
    pub lost_workers: usize,
}

#[derive(Default)]
struct WorkerTally {
    completed: usize,
    failed: Vec<String>,
}

/// Fixed-size pool of workers draining a shared request queue.
///
/// Workers pull the next request as soon as they are idle, so completion
/// order is unrelated to submission order. A request is retried by its own
/// worker until it succeeds, its retry predicate rejects the error, or its
/// policy runs out of attempts.
#[derive(Debug)]
pub struct Balancer {
    parallelism: usize,
    cancel: CancellationToken,
}

impl Balancer {
    /// Creates a pool of `parallelism` workers (at least one).
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Stops all workers.
    ///
    /// Attempts already running finish; a request waiting out its backoff is
    /// reported as failed with its last error. Queued requests are discarded.
    pub fn tear_down_workers(&self) {
        if !self.cancel.is_cancelled() {
            info!(workers = self.parallelism, "tearing down workers");
        }
        self.cancel.cancel();
    }

    /// Starts the workers on `requests`.
    ///
    /// Returns the terminal-failure stream and a receiver for the final
    /// [`PoolReport`]. The failure stream closes when the last worker exits,
    /// which happens once the request queue is closed and drained, or after
    /// teardown. Must be called from within a tokio runtime.
    pub fn run<E>(
        &self,
        requests: mpsc::Receiver<Request<E>>,
    ) -> (
        mpsc::UnboundedReceiver<RequestFailure<E>>,
        oneshot::Receiver<PoolReport>,
    )
    where
        E: fmt::Display + Send + 'static,
    {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = oneshot::channel();
        let queue = Arc::new(Mutex::new(requests));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.parallelism {
            workers.spawn(worker(
                worker_id,
                Arc::clone(&queue),
                failure_tx.clone(),
                self.cancel.clone(),
            ));
        }
        drop(failure_tx);
        debug!(workers = self.parallelism, "worker pool started");

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut report = PoolReport::default();
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(tally) => {
                        report.completed += tally.completed;
                        report.failed.extend(tally.failed);
                    }
                    Err(e) => {
                        error!(error = %e, "worker task failed");
                        report.lost_workers += 1;
                    }
                }
            }
            report.torn_down = cancel.is_cancelled();
            debug!(
                completed = report.completed,
                failed = report.failed.len(),
                torn_down = report.torn_down,
                lost_workers = report.lost_workers,
                "worker pool finished"
            );
            let _ = report_tx.send(report);
        });

        (failure_rx, report_rx)
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

async fn worker<E>(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Request<E>>>>,
    failures: mpsc::UnboundedSender<RequestFailure<E>>,
    cancel: CancellationToken,
) -> WorkerTally
where
    E: fmt::Display + Send + 'static,
{
    let mut tally = WorkerTally::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            request = async { queue.lock().await.recv().await } => request,
        };
        let Some(request) = next else {
            break;
        };

        match execute(worker_id, request, &cancel).await {
            Ok(()) => tally.completed += 1,
            Err(failure) => {
                tally.failed.push(failure.id.clone());
                let _ = failures.send(failure);
            }
        }
    }
    debug!(worker = worker_id, completed = tally.completed, "worker exiting");
    tally
}

/// Runs one request to completion, retrying per its predicate and policy.
///
/// Each attempt runs on its own task so a panicking attempt fails its request
/// instead of killing the worker.
async fn execute<E>(
    worker_id: usize,
    mut request: Request<E>,
    cancel: &CancellationToken,
) -> Result<(), RequestFailure<E>>
where
    E: fmt::Display + Send + 'static,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match tokio::spawn((request.work)()).await {
            Ok(Ok(())) => {
                debug!(worker = worker_id, request = %request.id, attempt, "request completed");
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(joined) => {
                let message = panic_message(joined);
                error!(
                    worker = worker_id,
                    request = %request.id,
                    attempts = attempt,
                    panic = %message,
                    "request attempt panicked"
                );
                return Err(RequestFailure {
                    id: request.id,
                    attempts: attempt,
                    error: AttemptError::Panicked(message),
                });
            }
        };

        if !(request.should_retry)(&err) || !request.policy.allows_retry(attempt) {
            error!(
                worker = worker_id,
                request = %request.id,
                attempts = attempt,
                error = %err,
                "request failed permanently"
            );
            return Err(RequestFailure {
                id: request.id,
                attempts: attempt,
                error: AttemptError::Failed(err),
            });
        }

        let delay = request.policy.delay_for_attempt(attempt);
        warn!(
            worker = worker_id,
            request = %request.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "request failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(worker = worker_id, request = %request.id, "retry abandoned, pool torn down");
                return Err(RequestFailure {
                    id: request.id,
                    attempts: attempt,
                    error: AttemptError::Failed(err),
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::{RetryPolicy, WorkFuture};

    fn immediate(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    fn recording(id: &str, log: Arc<StdMutex<Vec<String>>>, pause: Duration) -> Request<String> {
        let name = id.to_string();
        Request::new(id, move || -> WorkFuture<String> {
            let log = Arc::clone(&log);
            let name = name.clone();
            Box::pin(async move {
                tokio::time::sleep(pause).await;
                log.lock().unwrap().push(name);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn single_worker_with_unbuffered_queue_runs_everything() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let balancer = Balancer::new(1);
        let (tx, rx) = request_queue(0);
        let (mut failures, report) = balancer.run(rx);

        for id in ["a", "b", "c"] {
            tx.send(recording(id, Arc::clone(&log), Duration::ZERO))
                .await
                .unwrap();
        }
        drop(tx);

        let report = report.await.unwrap();
        assert_eq!(report.completed, 3);
        assert!(report.failed.is_empty());
        assert!(!report.torn_down);
        assert!(failures.recv().await.is_none());
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn zero_parallelism_still_gets_a_worker() {
        assert_eq!(Balancer::new(0).parallelism(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let request = Request::new("flaky", move || -> WorkFuture<String> {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("timeout".to_string())
                } else {
                    Ok(())
                }
            })
        })
        .with_policy(immediate(Some(5)));

        let balancer = Balancer::new(2);
        let (tx, rx) = request_queue(4);
        let (mut failures, report) = balancer.run(rx);
        tx.send(request).await.unwrap();
        drop(tx);

        let report = report.await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(failures.recv().await.is_none());
    }

    #[tokio::test]
    async fn exhausted_attempts_report_terminal_failure() {
        let request = Request::new("broken", || -> WorkFuture<String> {
            Box::pin(async { Err("disk full".to_string()) })
        })
        .with_policy(immediate(Some(3)));

        let balancer = Balancer::new(1);
        let (tx, rx) = request_queue(1);
        let (mut failures, report) = balancer.run(rx);
        tx.send(request).await.unwrap();
        drop(tx);

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.id, "broken");
        assert_eq!(failure.attempts, 3);
        assert!(matches!(&failure.error, AttemptError::Failed(e) if e == "disk full"));

        let report = report.await.unwrap();
        assert_eq!(report.completed, 0);
        assert_eq!(report.failed, vec!["broken".to_string()]);
    }

    #[tokio::test]
    async fn predicate_can_refuse_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let request = Request::new("fatal", move || -> WorkFuture<String> {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err("forbidden".to_string()) })
        })
        .with_retry_predicate(|e: &String| e != "forbidden")
        .with_policy(immediate(None));

        let balancer = Balancer::new(1);
        let (tx, rx) = request_queue(1);
        let (mut failures, _report) = balancer.run(rx);
        tx.send(request).await.unwrap();
        drop(tx);

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.attempts, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_attempt_fails_its_request_and_worker_continues() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        fn explode() -> Result<(), String> {
            panic!("storage backend bug")
        }
        let request = Request::new("explodes", || -> WorkFuture<String> {
            Box::pin(async { explode() })
        })
        .with_policy(immediate(Some(5)));

        let balancer = Balancer::new(1);
        let (tx, rx) = request_queue(2);
        let (mut failures, report) = balancer.run(rx);
        tx.send(request).await.unwrap();
        tx.send(recording("after", Arc::clone(&log), Duration::ZERO))
            .await
            .unwrap();
        drop(tx);

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.id, "explodes");
        assert_eq!(failure.attempts, 1);
        assert!(matches!(
            &failure.error,
            AttemptError::Panicked(msg) if msg == "storage backend bug"
        ));

        let report = report.await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, vec!["explodes".to_string()]);
        assert_eq!(report.lost_workers, 0);
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn teardown_abandons_pending_retry() {
        let started = Arc::new(Notify::new());
        let signal = Arc::clone(&started);
        let request = Request::new("stuck", move || -> WorkFuture<String> {
            signal.notify_one();
            Box::pin(async { Err("unreachable host".to_string()) })
        })
        .with_policy(RetryPolicy {
            max_attempts: None,
            initial_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        });

        let balancer = Balancer::new(2);
        let (tx, rx) = request_queue(1);
        let (mut failures, report) = balancer.run(rx);
        tx.send(request).await.unwrap();

        started.notified().await;
        balancer.tear_down_workers();

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.id, "stuck");
        assert_eq!(failure.attempts, 1);

        let report = report.await.unwrap();
        assert!(report.torn_down);
        assert_eq!(report.failed, vec!["stuck".to_string()]);
        assert!(failures.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_order_follows_work_not_submission() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let balancer = Balancer::new(2);
        let (tx, rx) = request_queue(2);
        let (_failures, report) = balancer.run(rx);

        tx.send(recording("slow", Arc::clone(&log), Duration::from_millis(50)))
            .await
            .unwrap();
        tx.send(recording("fast", Arc::clone(&log), Duration::from_millis(1)))
            .await
            .unwrap();
        drop(tx);

        let report = report.await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(*log.lock().unwrap(), vec!["fast", "slow"]);
    }
}

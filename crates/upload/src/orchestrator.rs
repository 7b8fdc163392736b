//! Upload orchestrator.
//!
//! Wires one session together: reconcile the work list, stream chunks from the
//! source, dispatch one request per chunk to the worker pool, and aggregate
//! progress and failures into a [`SessionResult`].

use std::collections::HashMap;
use std::sync::Arc;

use pagesync_balancer::{Balancer, Request, RetryPolicy, WorkFuture, request_queue};
use pagesync_transfer::{
    ByteRange, Chunk, ImageSource, ProgressEstimator, ProgressReporter, RangeSet,
    ReconcileOptions, reconcile, stream_chunks,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{StorageError, UploadError};
use crate::storage::PageStorage;
use crate::types::{FailedRange, SessionOutcome, SessionResult, UploadEvent, UploadOptions};

const EVENT_QUEUE_DEPTH: usize = 256;

/// Inputs of one upload session.
pub struct UploadContext<S> {
    pub source: S,
    /// Ranges already present at the destination.
    pub skip: RangeSet,
    pub storage: Arc<dyn PageStorage>,
    /// Overrides [`UploadOptions::parallelism`] when set.
    pub parallelism: Option<usize>,
    /// Whether `skip` applies. A fresh upload sends every non-empty range.
    pub resume: bool,
}

/// Runs upload sessions and publishes [`UploadEvent`]s.
pub struct UploadOrchestrator {
    options: UploadOptions,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
}

impl Default for UploadOrchestrator {
    fn default() -> Self {
        Self::new(UploadOptions::default())
    }
}

impl UploadOrchestrator {
    pub fn new(options: UploadOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            options,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// Runs one session to completion.
    ///
    /// Returns `Ok` with `success == false` when some ranges failed for good;
    /// re-running recomputes the missing ranges from the destination. A source
    /// read failure tears the pool down and returns [`UploadError::SourceRead`].
    pub async fn upload<S: ImageSource>(
        &self,
        ctx: UploadContext<S>,
    ) -> Result<SessionResult, UploadError> {
        let UploadContext {
            mut source,
            skip,
            storage,
            parallelism,
            resume,
        } = ctx;
        let parallelism = parallelism.unwrap_or(self.options.parallelism).max(1);
        let skip = if resume {
            skip
        } else {
            if !skip.is_empty() {
                debug!(ranges = skip.len(), "fresh upload, ignoring skip set");
            }
            RangeSet::new()
        };

        // 1. Reconcile on a blocking thread; emptiness probing reads the source.
        let image_size = source.size();
        let reconcile_options = ReconcileOptions {
            page_size: storage.page_size(),
            ..self.options.reconcile
        };
        let (source, plan) = tokio::task::spawn_blocking(move || {
            let plan = reconcile(&mut source, image_size, &skip, &reconcile_options);
            (source, plan)
        })
        .await?;
        let plan = plan?;

        let effective = plan.effective_bytes();
        let already_processed = plan.already_processed();
        info!(
            image_size,
            effective,
            already_processed,
            ranges = plan.ranges().len(),
            parallelism,
            "starting upload"
        );
        self.emit(UploadEvent::Planned {
            image_size,
            effective_bytes: effective,
            ranges: plan.ranges().len(),
        });

        // 2. Progress: the denominator includes bytes that need no transfer.
        let (estimator, mut records) = ProgressEstimator::start(
            parallelism,
            already_processed,
            image_size,
            self.options.estimator,
        );
        let progress_tx = self.events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                let _ = progress_tx.try_send(UploadEvent::Progress(record));
            }
        });

        // 3. Worker pool and failure listener.
        let balancer = Balancer::new(parallelism);
        let (requests, queue) = request_queue::<StorageError>(self.options.queue_capacity);
        let (mut failures, pool_done) = balancer.run(queue);

        let by_id: HashMap<String, ByteRange> =
            plan.ranges().iter().map(|r| (r.id(), *r)).collect();
        let listener_tx = self.events_tx.clone();
        let listener = tokio::spawn(async move {
            let mut failed = Vec::new();
            while let Some(failure) = failures.recv().await {
                let Some(range) = by_id.get(&failure.id).copied() else {
                    warn!(request = %failure.id, "failure for unknown request");
                    continue;
                };
                let failed_range = FailedRange {
                    range,
                    attempts: failure.attempts,
                    error: failure.error.to_string(),
                };
                let _ = listener_tx.try_send(UploadEvent::RangeFailed(failed_range.clone()));
                failed.push(failed_range);
            }
            failed
        });

        // 4. Dispatch: one request per chunk, enqueued in range order.
        let mut stream = stream_chunks(source, plan.ranges().to_vec());
        let reporter = estimator.reporter();
        let mut dispatched = 0usize;
        let mut dispatch_cut_short = false;
        while let Some(chunk) = stream.chunks.recv().await {
            let request = build_request(chunk, &storage, &reporter, self.options.retry);
            if requests.send(request).await.is_err() {
                error!("worker pool stopped accepting requests");
                dispatch_cut_short = true;
                break;
            }
            dispatched += 1;
        }
        drop(stream.chunks);
        let source_error = stream.errors.await.ok();

        if let Some(e) = &source_error {
            error!(error = %e, "source read failed, aborting session");
            balancer.tear_down_workers();
        }
        drop(requests);

        // 5. Wait for the pool, then collect failures and the final snapshot.
        let report = pool_done.await.unwrap_or_else(|_| {
            error!("worker pool exited without a report");
            Default::default()
        });
        let failed = listener.await?;
        let progress = estimator.stop().await;
        let _ = forwarder.await;

        // Only acknowledged writes reach the estimator.
        let bytes_transferred = progress.bytes_processed.saturating_sub(already_processed);
        if let Some(e) = source_error {
            self.emit(UploadEvent::Finished {
                outcome: SessionOutcome::SourceFailed,
                bytes_transferred,
                percent_complete: progress.percent_complete,
            });
            return Err(UploadError::SourceRead(e));
        }

        // Requests held by a worker that died are neither completed nor failed.
        let unaccounted = dispatched.saturating_sub(report.completed + report.failed.len());
        if unaccounted > 0 {
            error!(unaccounted, "requests lost with their workers");
        }
        let success = failed.is_empty()
            && report.failed.is_empty()
            && unaccounted == 0
            && !dispatch_cut_short;
        let outcome = if success {
            info!(bytes = bytes_transferred, "upload completed");
            SessionOutcome::Completed
        } else {
            warn!(
                failed = failed.len(),
                unaccounted,
                bytes = bytes_transferred,
                "upload incomplete"
            );
            SessionOutcome::Incomplete {
                failed: failed.len().max(report.failed.len()) + unaccounted,
            }
        };
        self.emit(UploadEvent::Finished {
            outcome,
            bytes_transferred,
            percent_complete: progress.percent_complete,
        });

        Ok(SessionResult {
            success,
            failed,
            bytes_transferred,
            progress,
        })
    }

    fn emit(&self, event: UploadEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            debug!(error = %e, "upload event dropped");
        }
    }
}

/// Builds the request writing `chunk`. Progress is reported only after the
/// storage acknowledged the write.
fn build_request(
    chunk: Chunk,
    storage: &Arc<dyn PageStorage>,
    reporter: &ProgressReporter,
    policy: RetryPolicy,
) -> Request<StorageError> {
    let range = chunk.range;
    let data: Arc<[u8]> = chunk.data.into();
    let storage = Arc::clone(storage);
    let reporter = reporter.clone();

    Request::new(range.id(), move || -> WorkFuture<StorageError> {
        let storage = Arc::clone(&storage);
        let data = Arc::clone(&data);
        let reporter = reporter.clone();
        Box::pin(async move {
            storage.write_pages(range, &data).await?;
            reporter.report_bytes_processed(range.length());
            Ok(())
        })
    })
    .with_retry_predicate(StorageError::is_retryable)
    .with_policy(policy)
}

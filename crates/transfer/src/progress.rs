use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::buffer::RingBuffer;

/// Default record interval.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of samples in the moving-average window.
const DEFAULT_WINDOW: usize = 60;

/// Record stream depth; records are dropped rather than queued beyond this.
const RECORD_QUEUE_DEPTH: usize = 16;

/// Tick cadence and smoothing window of a [`ProgressEstimator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimatorConfig {
    pub interval: Duration,
    pub window: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            window: DEFAULT_WINDOW,
        }
    }
}

/// A point-in-time progress snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    /// Cumulative bytes confirmed, including bytes that needed no transfer.
    pub bytes_processed: u64,
    pub total_bytes: u64,
    /// `0.0..=100.0`.
    pub percent_complete: f64,
    /// Moving-average throughput in bytes per second.
    pub bytes_per_second: f64,
    /// `None` while throughput is zero or too low to give a finite estimate.
    pub remaining: Option<Duration>,
}

impl ProgressRecord {
    fn compute(bytes_processed: u64, total_bytes: u64, bytes_per_second: f64) -> Self {
        let percent_complete = if total_bytes == 0 {
            100.0
        } else {
            (bytes_processed as f64 / total_bytes as f64 * 100.0).min(100.0)
        };
        let left = total_bytes.saturating_sub(bytes_processed);
        let remaining = if left == 0 {
            Some(Duration::ZERO)
        } else if bytes_per_second > 0.0 {
            Duration::try_from_secs_f64(left as f64 / bytes_per_second).ok()
        } else {
            None
        };
        Self {
            bytes_processed,
            total_bytes,
            percent_complete,
            bytes_per_second,
            remaining,
        }
    }

    /// Throughput in megabits per second.
    pub fn megabits_per_second(&self) -> f64 {
        self.bytes_per_second * 8.0 / 1_000_000.0
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SpeedSample {
    cumulative: u64,
    timestamp: Instant,
}

/// Moving-average throughput over a fixed number of cumulative samples.
///
/// Timestamps come from the tokio clock, so a paused test clock drives it too.
#[derive(Debug, Clone)]
pub struct SpeedCalculator {
    samples: RingBuffer<SpeedSample>,
}

impl SpeedCalculator {
    /// Creates a calculator averaging over the last `window` samples.
    pub fn new(window: usize) -> Self {
        Self {
            samples: RingBuffer::new(window.max(2)),
        }
    }

    /// Records the cumulative byte count observed at `timestamp`.
    pub fn add_sample(&mut self, cumulative: u64, timestamp: Instant) {
        self.samples.push(SpeedSample {
            cumulative,
            timestamp,
        });
    }

    /// Average bytes/second between the oldest and newest sample.
    ///
    /// Returns 0.0 with fewer than two samples or no elapsed time.
    pub fn bytes_per_second(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let (Some(first), Some(last)) = (self.samples.first(), self.samples.last()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.saturating_duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        last.cumulative.saturating_sub(first.cumulative) as f64 / elapsed.as_secs_f64()
    }
}

// ---------------------------------------------------------------------------
// ProgressEstimator
// ---------------------------------------------------------------------------

/// Cloneable handle for reporting confirmed bytes to a running estimator.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<u64>,
}

impl ProgressReporter {
    /// Adds `bytes` to the processed total. Ignored once the estimator stopped.
    pub fn report_bytes_processed(&self, bytes: u64) {
        let _ = self.tx.send(bytes);
    }
}

/// Background ticker turning byte reports into [`ProgressRecord`]s.
///
/// Owns all its state inside one task; reporters and the record consumer talk
/// to it only through channels.
pub struct ProgressEstimator {
    reporter: ProgressReporter,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<ProgressRecord>,
}

impl ProgressEstimator {
    /// Starts ticking and returns the estimator with its record stream.
    ///
    /// `already_processed` seeds the cumulative count for resumed sessions and
    /// `total_bytes` is the denominator for the completion percentage. The
    /// smoothing window never drops below `parallelism` samples.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        parallelism: usize,
        already_processed: u64,
        total_bytes: u64,
        config: EstimatorConfig,
    ) -> (Self, mpsc::Receiver<ProgressRecord>) {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (record_tx, record_rx) = mpsc::channel(RECORD_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = oneshot::channel();

        let window = config.window.max(parallelism);
        let task = tokio::spawn(run_ticker(
            TickerState {
                processed: already_processed,
                total: total_bytes,
                speed: SpeedCalculator::new(window),
            },
            config.interval,
            report_rx,
            record_tx,
            stop_rx,
        ));

        let estimator = Self {
            reporter: ProgressReporter { tx: report_tx },
            stop: Some(stop_tx),
            task,
        };
        (estimator, record_rx)
    }

    /// Returns a reporter that can be moved into upload work.
    pub fn reporter(&self) -> ProgressReporter {
        self.reporter.clone()
    }

    pub fn report_bytes_processed(&self, bytes: u64) {
        self.reporter.report_bytes_processed(bytes);
    }

    /// Stops ticking, closes the record stream and returns a final snapshot.
    ///
    /// Reports already sent are folded in before the snapshot is taken. The
    /// final snapshot is returned here, not emitted on the stream.
    pub async fn stop(mut self) -> ProgressRecord {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match (&mut self.task).await {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, "progress ticker ended abnormally");
                ProgressRecord::compute(0, 0, 0.0)
            }
        }
    }
}

struct TickerState {
    processed: u64,
    total: u64,
    speed: SpeedCalculator,
}

impl TickerState {
    fn record(&self) -> ProgressRecord {
        ProgressRecord::compute(self.processed, self.total, self.speed.bytes_per_second())
    }
}

async fn run_ticker(
    mut state: TickerState,
    interval: Duration,
    mut reports: mpsc::UnboundedReceiver<u64>,
    records: mpsc::Sender<ProgressRecord>,
    mut stop: oneshot::Receiver<()>,
) -> ProgressRecord {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            Some(bytes) = reports.recv() => {
                state.processed = state.processed.saturating_add(bytes);
            }
            _ = ticker.tick() => {
                state.speed.add_sample(state.processed, Instant::now());
                // A slow or absent consumer loses records instead of stalling the ticker.
                let _ = records.try_send(state.record());
            }
        }
    }

    while let Ok(bytes) = reports.try_recv() {
        state.processed = state.processed.saturating_add(bytes);
    }
    state.record()
}

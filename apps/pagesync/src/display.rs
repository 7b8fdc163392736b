//! Terminal rendering of upload events.

use std::io::Write;
use std::time::Duration;

use pagesync_transfer::ProgressRecord;
use pagesync_upload::{SessionOutcome, UploadEvent};
use tokio::sync::mpsc;

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];
const MIB: f64 = 1024.0 * 1024.0;

/// Prints events until the channel closes.
pub async fn render(mut events: mpsc::Receiver<UploadEvent>) {
    let mut tick = 0usize;
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            UploadEvent::Planned {
                image_size,
                effective_bytes,
                ranges,
            } => {
                println!(
                    "Effective upload size: {:.2} MB in {ranges} range(s) (from {:.2} MB originally)",
                    effective_bytes as f64 / MIB,
                    image_size as f64 / MIB
                );
            }
            UploadEvent::Progress(record) => {
                let _ = write!(stdout, "\r{}", status_line(&record, SPINNER[tick % SPINNER.len()]));
                let _ = stdout.flush();
                tick += 1;
            }
            UploadEvent::RangeFailed(failed) => {
                println!(
                    "\nrange {} failed after {} attempt(s): {}",
                    failed.range, failed.attempts, failed.error
                );
            }
            UploadEvent::Finished {
                outcome,
                bytes_transferred,
                percent_complete,
            } => {
                println!("{}", finish_line(outcome, bytes_transferred, percent_complete));
            }
        }
    }
}

/// Closing line for a session that ended with `outcome`.
pub fn finish_line(outcome: SessionOutcome, bytes_transferred: u64, percent_complete: f64) -> String {
    let sent = bytes_transferred as f64 / MIB;
    match outcome {
        SessionOutcome::Completed => {
            format!("\rCompleted: 100% [{sent:.2} MB sent]{:40}", "")
        }
        SessionOutcome::Incomplete { failed } => format!(
            "\nUpload incomplete at {percent_complete:.0}% [{sent:.2} MB sent]: {failed} range(s) failed; \
             re-run the same command to send the remaining ranges."
        ),
        SessionOutcome::SourceFailed => format!(
            "\nUpload aborted at {percent_complete:.0}% [{sent:.2} MB sent]: the source image could not be read."
        ),
    }
}

/// One status line for `record`.
pub fn status_line(record: &ProgressRecord, spinner: char) -> String {
    format!(
        " Completed: {:3.0}% [{:10.2} MB] RemainingTime: {} Throughput: {:.0} Mb/sec {spinner} ",
        record.percent_complete,
        record.bytes_processed as f64 / MIB,
        format_remaining(record.remaining),
        record.megabits_per_second()
    )
}

/// `HH:MM:SS`, or `--:--:--` when unknown.
pub fn format_remaining(remaining: Option<Duration>) -> String {
    match remaining {
        Some(d) => {
            let secs = d.as_secs();
            format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
        }
        None => "--:--:--".into(),
    }
}

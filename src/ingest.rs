//! JSON-lines event source for the recorder.
//!
//! Each non-empty line is one [`ChatEvent`]. Every event is recorded on its
//! own task, so a slow dialog does not hold up the rest of the stream; the
//! per-dialog lock inside the recorder keeps same-dialog events consistent.
//! Malformed lines and failed events are logged and skipped.
//!
//! Finished tasks are counted while the stream is still open, and the
//! running totals are published on a `watch` channel. A shutdown signal
//! stops reading; events already spawned are always allowed to finish.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

use crate::recorder::{ChatEvent, RecordOutcome, Recorder};

/// Counters for one ingest run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub ignored: u64,
    pub malformed: u64,
    pub failed: u64,
}

impl IngestStats {
    fn tally(&mut self, joined: Result<Result<RecordOutcome>, JoinError>) {
        match joined {
            Ok(Ok(RecordOutcome::Stored(_))) => self.stored += 1,
            Ok(Ok(RecordOutcome::Duplicate)) => self.duplicates += 1,
            Ok(Ok(RecordOutcome::Ignored)) => self.ignored += 1,
            Ok(Err(e)) => {
                self.failed += 1;
                tracing::error!(error = %format!("{:#}", e), "failed to record event");
            }
            Err(e) => {
                self.failed += 1;
                tracing::error!(error = %e, "recorder task panicked");
            }
        }
    }
}

/// Record every event read from `reader` until EOF or until `shutdown`
/// turns true, publishing counters on `progress` as events complete.
pub async fn ingest_lines<R>(
    recorder: Arc<Recorder>,
    reader: R,
    mut shutdown: watch::Receiver<bool>,
    progress: &watch::Sender<IngestStats>,
) -> Result<IngestStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = IngestStats::default();
    let mut tasks = JoinSet::new();
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            biased;

            Ok(_) = shutdown.wait_for(|stop| *stop) => {
                tracing::info!(in_flight = tasks.len(), "ingest stopping");
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                stats.tally(joined);
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read event stream")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                stats.lines += 1;

                match serde_json::from_str::<ChatEvent>(line) {
                    Ok(event) => {
                        let recorder = recorder.clone();
                        tasks.spawn(async move { recorder.record(&event.peer, &event.message).await });
                    }
                    Err(e) => {
                        stats.malformed += 1;
                        tracing::warn!(line = stats.lines, error = %e, "skipping malformed event");
                    }
                }
            }
        }
        progress.send_replace(stats);
    }

    while let Some(joined) = tasks.join_next().await {
        stats.tally(joined);
        progress.send_replace(stats);
    }

    Ok(stats)
}

/// Ingest from `path`, or stdin when `path` is `None` or `-`.
pub async fn run_ingest(
    recorder: Arc<Recorder>,
    path: Option<&Path>,
    shutdown: watch::Receiver<bool>,
) -> Result<IngestStats> {
    let (progress, _) = watch::channel(IngestStats::default());
    let stats = match path {
        Some(p) if p != Path::new("-") => {
            let file = tokio::fs::File::open(p)
                .await
                .with_context(|| format!("Failed to open event file: {}", p.display()))?;
            ingest_lines(recorder, BufReader::new(file), shutdown, &progress).await?
        }
        _ => {
            ingest_lines(recorder, BufReader::new(tokio::io::stdin()), shutdown, &progress).await?
        }
    };

    println!("ingest");
    println!("  events: {}", stats.lines);
    println!("  stored: {}", stats.stored);
    println!("  duplicates: {}", stats.duplicates);
    println!("  ignored: {}", stats.ignored);
    println!("  malformed: {}", stats.malformed);
    println!("  failed: {}", stats.failed);
    Ok(stats)
}

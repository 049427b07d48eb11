//! Parallel batch runtime.
//!
//! Part numbers are fanned out to a small pool of named worker threads over a
//! bounded channel. Parts are independent, so a failure on one is recorded
//! and the run continues. An unreachable store stops the run. Cancellation is
//! checked between part numbers; results already committed stay valid.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;

use crate::config::MAX_WORKERS;
use crate::error::{ConsensusError, ConsensusResult};

use super::{ConsensusEngine, ProcessResult};

/// Cooperative cancellation flag shared between a caller and a batch run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that the run stop before the next part number.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A part number whose processing failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartFailure {
    pub part_number: String,
    pub error: String,
}

/// Aggregate result of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Part numbers selected for the run.
    pub candidates: usize,
    /// Part numbers attempted (processed, skipped or failed).
    pub total_parts_processed: usize,
    /// Consensus records written or confirmed.
    pub total_fitments_processed: usize,
    pub total_conflicts_identified: usize,
    /// Part numbers skipped for insufficient data.
    pub skipped: usize,
    /// Malformed observations excluded across all parts.
    pub skipped_observations: usize,
    pub failed: Vec<PartFailure>,
    pub cancelled: bool,
}

impl BatchSummary {
    /// Part numbers never attempted because the run was cancelled.
    #[must_use]
    pub fn not_started(&self) -> usize {
        self.candidates.saturating_sub(self.total_parts_processed)
    }

    fn record(&mut self, result: &ProcessResult) {
        self.total_parts_processed += 1;
        self.skipped_observations += result.skipped_observations;
        if result.processed {
            self.total_fitments_processed += 1;
            self.total_conflicts_identified += result.conflicts;
        } else {
            self.skipped += 1;
        }
    }
}

enum PartOutcome {
    Done(ProcessResult),
    Failed(PartFailure),
    Fatal(ConsensusError),
}

/// Runs part numbers through a `ConsensusEngine` on worker threads.
pub struct BatchRuntime {
    engine: Arc<ConsensusEngine>,
    workers: usize,
    queue_capacity: usize,
}

impl BatchRuntime {
    /// Create a runtime with `workers` threads, clamped to `1..=MAX_WORKERS`.
    #[must_use]
    pub fn new(engine: ConsensusEngine, workers: usize) -> Self {
        let workers = workers.clamp(1, MAX_WORKERS);
        Self {
            engine: Arc::new(engine),
            workers,
            queue_capacity: workers.saturating_mul(2),
        }
    }

    fn spawn_workers(
        &self,
        jobs: &Receiver<String>,
        results: &Sender<PartOutcome>,
        cancel: &CancelToken,
        abort: &CancelToken,
    ) -> ConsensusResult<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(self.workers);
        for idx in 0..self.workers {
            let jobs = jobs.clone();
            let results = results.clone();
            let engine = Arc::clone(&self.engine);
            let cancel = cancel.clone();
            let abort = abort.clone();
            let handle = thread::Builder::new()
                .name(format!("fitment-consensus-worker-{idx}"))
                .spawn(move || {
                    while let Ok(part_number) = jobs.recv() {
                        if cancel.is_cancelled() || abort.is_cancelled() {
                            break;
                        }
                        let outcome = match engine.process_part_number(&part_number) {
                            Ok(result) => PartOutcome::Done(result),
                            Err(err) if err.is_fatal() => {
                                abort.cancel();
                                PartOutcome::Fatal(err)
                            }
                            Err(err) => {
                                tracing::error!(
                                    part_number = %part_number,
                                    error = %err,
                                    "Failed to process part number."
                                );
                                PartOutcome::Failed(PartFailure {
                                    part_number,
                                    error: err.to_string(),
                                })
                            }
                        };
                        if results.send(outcome).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| {
                    ConsensusError::internal(format!("failed to spawn batch worker: {e}"))
                })?;
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Processes `parts`, returning partial counts when cancelled.
    ///
    /// # Errors
    /// `StoreUnavailable` when the store or sink cannot be reached; remaining
    /// work is abandoned.
    pub fn run(&self, parts: Vec<String>, cancel: &CancelToken) -> ConsensusResult<BatchSummary> {
        let candidates = parts.len();
        let (job_tx, job_rx) = bounded::<String>(self.queue_capacity);
        let (result_tx, result_rx) = bounded::<PartOutcome>(candidates.max(1));
        let abort = CancelToken::new();

        let handles = self.spawn_workers(&job_rx, &result_tx, cancel, &abort)?;
        drop(job_rx);
        drop(result_tx);

        for part_number in parts {
            if cancel.is_cancelled() || abort.is_cancelled() {
                break;
            }
            if job_tx.send(part_number).is_err() {
                break;
            }
        }
        drop(job_tx);

        let mut panicked = false;
        for handle in handles {
            panicked |= handle.join().is_err();
        }

        let mut summary = BatchSummary {
            candidates,
            ..BatchSummary::default()
        };
        let mut fatal = None;
        for outcome in result_rx.try_iter() {
            match outcome {
                PartOutcome::Done(result) => summary.record(&result),
                PartOutcome::Failed(failure) => {
                    summary.total_parts_processed += 1;
                    summary.failed.push(failure);
                }
                PartOutcome::Fatal(err) => {
                    if fatal.is_none() {
                        fatal = Some(err);
                    }
                }
            }
        }
        summary.failed.sort_by(|a, b| a.part_number.cmp(&b.part_number));

        if let Some(err) = fatal {
            tracing::error!(
                error = %err,
                attempted = summary.total_parts_processed,
                "Consensus batch aborted."
            );
            return Err(err);
        }
        if panicked {
            return Err(ConsensusError::internal("batch worker panicked"));
        }

        summary.cancelled = cancel.is_cancelled() && summary.not_started() > 0;
        tracing::info!(
            candidates = summary.candidates,
            parts = summary.total_parts_processed,
            fitments = summary.total_fitments_processed,
            conflicts = summary.total_conflicts_identified,
            skipped = summary.skipped,
            failed = summary.failed.len(),
            cancelled = summary.cancelled,
            "Consensus batch finished."
        );
        Ok(summary)
    }
}

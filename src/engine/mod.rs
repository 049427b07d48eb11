//! Consensus engine.
//!
//! `ConsensusEngine` ties grouping, resolution and classification to the
//! observation store and consensus sink. Each part number is processed
//! independently; its write-back is a single atomic commit.

mod plan;
mod write_path;

pub mod runtime;

use std::sync::Arc;

use serde::Serialize;

use crate::config::ConsensusConfig;
use crate::conflict::ConflictStatus;
use crate::consensus::FitmentStatus;
use crate::error::{ConsensusError, ConsensusResult};
use crate::storage::{ConsensusSink, ObservationStore, WriteEffect};
use crate::weight::{QualityModel, TieredQualityModel};

pub use plan::{
    CandidatePlan, ConflictEntry, ConflictSummary, GroupSummary, HistogramBucket,
    PartConflictCount, PartPlan,
};
pub use runtime::{BatchRuntime, BatchSummary, CancelToken, PartFailure};

/// Why a part number was not resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Fewer valid observations than the configured minimum.
    InsufficientData { observed: usize, required: usize },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientData { observed, required } => {
                write!(f, "insufficient_data ({observed} of {required} observations)")
            }
        }
    }
}

/// Result of processing one part number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessResult {
    pub part_number: String,
    /// A consensus record was written (or confirmed unchanged).
    pub processed: bool,
    /// Conflicts identified for the part.
    pub conflicts: usize,
    pub status: Option<FitmentStatus>,
    pub consensus_effect: Option<WriteEffect>,
    /// Malformed observations excluded from grouping.
    pub skipped_observations: usize,
    pub reason: Option<SkipReason>,
}

impl ProcessResult {
    pub(crate) fn skipped(
        part_number: &str,
        skipped_observations: usize,
        reason: SkipReason,
    ) -> Self {
        Self {
            part_number: part_number.to_string(),
            processed: false,
            conflicts: 0,
            status: None,
            consensus_effect: None,
            skipped_observations,
            reason: Some(reason),
        }
    }
}

/// Counts from an auto-resolution run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AutoResolveSummary {
    pub examined: usize,
    pub resolved: usize,
    pub dismissed: usize,
    pub manual: usize,
    /// Conflicts whose write-back failed; they stay PENDING.
    pub failed: usize,
}

/// Read-only aggregate counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub observations_total: usize,
    pub unique_part_numbers: usize,
    pub consensus_total: usize,
    pub high_confidence_count: usize,
    pub medium_confidence_count: usize,
    pub low_confidence_count: usize,
    pub needs_review_count: usize,
    pub pending_conflicts: usize,
    pub resolved_conflicts: usize,
    pub dismissed_conflicts: usize,
    pub high_confidence_percentage: f64,
    pub production_ready_percentage: f64,
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let pct = part as f64 / total as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

/// Fitment consensus engine.
#[derive(Clone)]
pub struct ConsensusEngine {
    observations: Arc<dyn ObservationStore>,
    sink: Arc<dyn ConsensusSink>,
    quality: Arc<dyn QualityModel>,
    config: ConsensusConfig,
    reopen_resolved: bool,
}

impl std::fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusEngine")
            .field("quality_model", &self.quality.name())
            .field("config", &self.config)
            .field("reopen_resolved", &self.reopen_resolved)
            .finish_non_exhaustive()
    }
}

impl ConsensusEngine {
    /// Create an engine weighting observations with the configured tiered
    /// quality model.
    #[must_use]
    pub fn new(
        observations: Arc<dyn ObservationStore>,
        sink: Arc<dyn ConsensusSink>,
        config: ConsensusConfig,
    ) -> Self {
        let quality = Arc::new(TieredQualityModel::new(config.weights.clone()));
        Self {
            observations,
            sink,
            quality,
            config,
            reopen_resolved: false,
        }
    }

    /// Create an engine with an explicit quality model.
    #[must_use]
    pub fn with_quality_model(
        observations: Arc<dyn ObservationStore>,
        sink: Arc<dyn ConsensusSink>,
        config: ConsensusConfig,
        quality: Arc<dyn QualityModel>,
    ) -> Self {
        Self {
            observations,
            sink,
            quality,
            config,
            reopen_resolved: false,
        }
    }

    /// Reopen RESOLVED/DISMISSED conflicts that reprocessing produces again.
    #[must_use]
    pub fn reopen_resolved(mut self, reopen: bool) -> Self {
        self.reopen_resolved = reopen;
        self
    }

    /// Returns a copy using a different minimum listing count.
    #[must_use]
    pub fn with_min_listings(&self, min_listings: usize) -> Self {
        let mut engine = self.clone();
        engine.config.min_listings = min_listings;
        engine
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn observation_store(&self) -> &Arc<dyn ObservationStore> {
        &self.observations
    }

    pub fn sink(&self) -> &Arc<dyn ConsensusSink> {
        &self.sink
    }

    pub fn quality_model(&self) -> &Arc<dyn QualityModel> {
        &self.quality
    }

    /// Processes every part number with at least `min_listings` observations.
    pub fn process_all(&self, min_listings: usize) -> ConsensusResult<BatchSummary> {
        self.process_candidates(min_listings, false, &CancelToken::new())
    }

    /// Processes part numbers whose newest observation is newer than their
    /// consensus, or which have no consensus yet.
    pub fn process_new_data_only(&self, min_listings: usize) -> ConsensusResult<BatchSummary> {
        self.process_candidates(min_listings, true, &CancelToken::new())
    }

    /// Batch run over the selected candidates, stopping between part numbers
    /// once `cancel` fires.
    pub fn process_candidates(
        &self,
        min_listings: usize,
        new_data_only: bool,
        cancel: &CancelToken,
    ) -> ConsensusResult<BatchSummary> {
        let engine = self.with_min_listings(min_listings);
        let parts: Vec<String> = engine
            .candidates(min_listings, new_data_only)?
            .into_iter()
            .map(|c| c.part_number)
            .collect();
        tracing::info!(
            candidates = parts.len(),
            min_listings,
            new_data_only,
            workers = engine.config.workers,
            "Starting consensus batch."
        );
        let workers = engine.config.workers;
        BatchRuntime::new(engine, workers).run(parts, cancel)
    }

    /// Aggregate counts for observability. Never writes.
    pub fn get_processing_stats(&self) -> ConsensusResult<ProcessingStats> {
        let observations_total = self
            .observations
            .count_observations()
            .map_err(ConsensusError::from_storage)?;
        let unique_part_numbers = self
            .observations
            .count_part_numbers()
            .map_err(ConsensusError::from_storage)?;
        let by_status = self
            .sink
            .consensus_status_counts()
            .map_err(ConsensusError::from_storage)?;
        let conflicts = self
            .sink
            .conflict_status_counts()
            .map_err(ConsensusError::from_storage)?;

        let count = |s| by_status.get(&s).copied().unwrap_or(0);
        let consensus_total: usize = by_status.values().sum();
        let high = count(FitmentStatus::HighConfidence);
        let conflict_count = |s| conflicts.get(&s).copied().unwrap_or(0);

        Ok(ProcessingStats {
            observations_total,
            unique_part_numbers,
            consensus_total,
            high_confidence_count: high,
            medium_confidence_count: count(FitmentStatus::MediumConfidence),
            low_confidence_count: count(FitmentStatus::LowConfidence),
            needs_review_count: count(FitmentStatus::NeedsReview),
            pending_conflicts: conflict_count(ConflictStatus::Pending),
            resolved_conflicts: conflict_count(ConflictStatus::Resolved),
            dismissed_conflicts: conflict_count(ConflictStatus::Dismissed),
            high_confidence_percentage: percentage(high, consensus_total),
            production_ready_percentage: percentage(high, consensus_total),
        })
    }
}

//! Abstract storage traits for the consensus engine.
//!
//! The engine reads observations through `ObservationStore` and writes
//! consensus records and conflicts through `ConsensusSink`. Both return
//! materialized collections; the engine never holds a cursor into a backend.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conflict::{
    ConflictDraft, ConflictId, ConflictReview, ConflictStatus, ConflictingFitment,
};
use crate::consensus::{ConsensusFitment, FitmentStatus};
use crate::observation::Observation;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend cannot be reached at all.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected a write.
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// Conflict not found.
    #[error("Conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// True when the backend is unreachable, as opposed to a single failed
    /// operation.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A part number eligible for processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartCandidate {
    pub part_number: String,
    pub observation_count: usize,
    pub latest_observation: DateTime<Utc>,
}

/// Read access to recorded observations.
pub trait ObservationStore: Send + Sync {
    /// All observations for a part number.
    fn list_observations(&self, part_number: &str) -> Result<Vec<Observation>, StorageError>;

    /// Part numbers with at least `min_listings` observations, ordered by
    /// part number.
    fn list_candidate_part_numbers(
        &self,
        min_listings: usize,
    ) -> Result<Vec<PartCandidate>, StorageError>;

    /// Total observations across all part numbers.
    fn count_observations(&self) -> Result<usize, StorageError>;

    /// Distinct part numbers with at least one observation.
    fn count_part_numbers(&self) -> Result<usize, StorageError>;
}

/// Selects stored conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFilter {
    /// `None` matches every status.
    pub status: Option<ConflictStatus>,
    pub part_number: Option<String>,
    /// Only conflicts created strictly before this instant.
    pub created_before: Option<DateTime<Utc>>,
}

impl Default for ConflictFilter {
    fn default() -> Self {
        Self::pending()
    }
}

impl ConflictFilter {
    /// PENDING conflicts of any part number.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: Some(ConflictStatus::Pending),
            part_number: None,
            created_before: None,
        }
    }

    /// Conflicts in any status.
    #[must_use]
    pub fn any() -> Self {
        Self {
            status: None,
            part_number: None,
            created_before: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: Option<ConflictStatus>) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn for_part(mut self, part_number: impl Into<String>) -> Self {
        self.part_number = Some(part_number.into());
        self
    }

    #[must_use]
    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    #[must_use]
    pub fn matches(&self, conflict: &ConflictingFitment) -> bool {
        self.status.map_or(true, |s| conflict.status == s)
            && self
                .part_number
                .as_deref()
                .map_or(true, |p| conflict.part_number == p)
            && self.created_before.map_or(true, |t| conflict.created_at < t)
    }
}

/// One part number's write-back, applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct PartCommit {
    pub consensus: ConsensusFitment,
    /// Conflicts the current evidence produces.
    pub conflicts: Vec<ConflictDraft>,
    /// Reopen RESOLVED/DISMISSED conflicts that the evidence produces again.
    pub reopen_resolved: bool,
    pub at: DateTime<Utc>,
}

/// What a write did to an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteEffect {
    Inserted,
    Replaced,
    Unchanged,
}

/// Effects of a `PartCommit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub consensus: WriteEffect,
    pub conflicts_opened: usize,
    pub conflicts_refreshed: usize,
    pub conflicts_reopened: usize,
    /// Terminal conflicts left untouched.
    pub conflicts_kept: usize,
    /// Stale PENDING conflicts dismissed because the evidence no longer
    /// produces them.
    pub conflicts_dismissed: usize,
}

impl CommitOutcome {
    #[must_use]
    pub fn unchanged() -> Self {
        Self {
            consensus: WriteEffect::Unchanged,
            conflicts_opened: 0,
            conflicts_refreshed: 0,
            conflicts_reopened: 0,
            conflicts_kept: 0,
            conflicts_dismissed: 0,
        }
    }
}

/// Durable store for consensus records and conflicts.
///
/// # Atomicity
/// `commit` must apply all of a part number's changes or none of them, so a
/// reader never observes a half-updated consensus.
pub trait ConsensusSink: Send + Sync {
    /// The live consensus for a part number.
    fn get_consensus(&self, part_number: &str) -> Result<Option<ConsensusFitment>, StorageError>;

    /// All consensus records, ordered by part number.
    fn list_consensus(&self) -> Result<Vec<ConsensusFitment>, StorageError>;

    /// Replaces a part number's consensus. A record with the same outcome is
    /// left untouched, including its timestamp.
    fn upsert_consensus(&self, fitment: ConsensusFitment) -> Result<WriteEffect, StorageError>;

    /// Applies one part number's consensus and conflicts atomically.
    ///
    /// Conflicts are keyed by id. New drafts open PENDING conflicts, existing
    /// PENDING ones are refreshed, terminal ones are kept unless
    /// `reopen_resolved` is set. PENDING conflicts of the part that are not in
    /// `conflicts` are dismissed.
    fn commit(&self, commit: PartCommit) -> Result<CommitOutcome, StorageError>;

    /// Get a conflict by id.
    fn get_conflict(&self, id: ConflictId) -> Result<Option<ConflictingFitment>, StorageError>;

    /// Conflicts matching `filter`, newest first, then by id.
    fn list_conflicts(&self, filter: &ConflictFilter)
        -> Result<Vec<ConflictingFitment>, StorageError>;

    /// Records a terminal review on a conflict.
    fn update_conflict_resolution(
        &self,
        id: ConflictId,
        review: &ConflictReview,
    ) -> Result<ConflictingFitment, StorageError>;

    /// Consensus records per status.
    fn consensus_status_counts(&self) -> Result<BTreeMap<FitmentStatus, usize>, StorageError>;

    /// Conflicts per status.
    fn conflict_status_counts(&self) -> Result<BTreeMap<ConflictStatus, usize>, StorageError>;
}

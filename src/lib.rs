//! # fitment-consensus - Weighted Reconciliation of Part Fitment Observations
//!
//! Marketplace listings each claim that a part number fits some vehicle. The
//! claims are noisy: sellers mistype years, list the wrong trim or copy another
//! listing's fitment. This crate reduces many such observations per part number
//! to one trusted consensus fitment with a confidence score, and records the
//! part numbers whose evidence does not converge as typed conflicts.
//!
//! ## Core Concepts
//!
//! - **Observation**: one listing's claim that a part fits a vehicle
//! - **FitmentSignature**: the normalized vehicle identity observations are grouped by
//! - **Quality weight**: credibility of one observation from seller and listing signals
//! - **ConsensusFitment**: the winning signature with a 0-100 confidence score
//! - **ConflictingFitment**: an escalated disagreement awaiting review
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use fitment_consensus::{
//!     ConsensusConfig, ConsensusEngine, InMemoryConsensusSink, InMemoryObservationStore,
//! };
//!
//! let store = Arc::new(InMemoryObservationStore::load_json(path)?);
//! let sink = Arc::new(InMemoryConsensusSink::new());
//! let engine = ConsensusEngine::new(store, sink, ConsensusConfig::default());
//!
//! let result = engine.process_part_number("1432255E")?;
//! let summary = engine.process_all(2)?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Domain types
pub mod error;
pub mod observation;
pub mod signature;

// Reconciliation pipeline
pub mod conflict;
pub mod consensus;
pub mod grouping;
pub mod review;
pub mod weight;

// Runtime
pub mod config;
pub mod engine;
pub mod storage;

pub use config::{ConsensusConfig, ReviewConfig};
pub use conflict::{
    classify, ConflictCategory, ConflictDraft, ConflictId, ConflictReview, ConflictStatus,
    ConflictingFitment,
};
pub use consensus::{resolve, ConsensusFitment, FitmentStatus, Resolution, ResolveOutcome};
pub use engine::{
    AutoResolveSummary, BatchRuntime, BatchSummary, CancelToken, CandidatePlan, ConflictSummary,
    ConsensusEngine, PartFailure, PartPlan, ProcessResult, ProcessingStats, SkipReason,
};
pub use error::{ConfigError, ConsensusError, ConsensusResult, ValidationError};
pub use grouping::{group_observations, Grouping, ObservationGroup};
pub use observation::{
    Observation, ObservationBuilder, ObservationId, ObservationRecord, QualitySignals,
};
pub use review::{Adjustment, AutoAction, AutoDecision, AutoResolver, ReviewRule};
pub use signature::FitmentSignature;
pub use storage::{
    ConflictFilter, ConsensusSink, InMemoryConsensusSink, InMemoryObservationStore,
    ObservationStore, StorageError,
};
pub use weight::{QualityModel, QualityWeights, TieredQualityModel};

//! Storage traits and backends for the consensus engine.
//!
//! The traits define the contract the engine depends on; `memory` provides
//! thread-safe in-memory implementations with JSON snapshots for tests,
//! embedded use and the batch binary.

mod memory;
mod traits;

pub use memory::{InMemoryConsensusSink, InMemoryObservationStore, SinkSnapshot, ENGINE_REVIEWER};
pub use traits::{
    CommitOutcome, ConflictFilter, ConsensusSink, ObservationStore, PartCandidate, PartCommit,
    StorageError, WriteEffect,
};

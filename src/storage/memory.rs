//! In-memory storage backend.
//!
//! Thread-safe implementations of the storage traits, intended for embedded
//! usage, tests and the batch binary. Both stores load and save JSON
//! snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::conflict::{ConflictId, ConflictReview, ConflictStatus, ConflictingFitment};
use crate::consensus::{ConsensusFitment, FitmentStatus};
use crate::observation::Observation;
use crate::storage::traits::{
    CommitOutcome, ConflictFilter, ConsensusSink, ObservationStore, PartCandidate, PartCommit,
    StorageError, WriteEffect,
};

/// Reviewer recorded when a commit dismisses a conflict the evidence no
/// longer produces.
pub const ENGINE_REVIEWER: &str = "consensus-engine";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StorageError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| StorageError::Unavailable(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| StorageError::Serialization(format!("{}: {e}", path.display())))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let raw = serde_json::to_string_pretty(value)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw)
        .map_err(|e| StorageError::WriteRejected(format!("{}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| StorageError::WriteRejected(format!("{}: {e}", path.display())))
}

#[derive(Debug, Default)]
struct ObservationState {
    by_part: BTreeMap<String, Vec<Observation>>,
    total: usize,
}

/// Thread-safe in-memory observation store.
#[derive(Debug, Default)]
pub struct InMemoryObservationStore {
    state: RwLock<ObservationState>,
}

impl InMemoryObservationStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `observations`.
    #[must_use]
    pub fn from_observations(observations: impl IntoIterator<Item = Observation>) -> Self {
        let mut state = ObservationState::default();
        for observation in observations {
            state.total += 1;
            state
                .by_part
                .entry(observation.part_number.clone())
                .or_default()
                .push(observation);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// Load a JSON array of observations.
    pub fn load_json(path: &Path) -> Result<Self, StorageError> {
        let observations: Vec<Observation> = read_json(path)?;
        Ok(Self::from_observations(observations))
    }

    /// Record a new observation.
    pub fn insert(&self, observation: Observation) -> Result<(), StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("observation.insert"))?;
        state.total += 1;
        state
            .by_part
            .entry(observation.part_number.clone())
            .or_default()
            .push(observation);
        Ok(())
    }
}

impl ObservationStore for InMemoryObservationStore {
    fn list_observations(&self, part_number: &str) -> Result<Vec<Observation>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("observation.list"))?;
        Ok(state.by_part.get(part_number).cloned().unwrap_or_default())
    }

    fn list_candidate_part_numbers(
        &self,
        min_listings: usize,
    ) -> Result<Vec<PartCandidate>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("observation.candidates"))?;
        Ok(state
            .by_part
            .iter()
            .filter(|(_, obs)| !obs.is_empty() && obs.len() >= min_listings)
            .filter_map(|(part_number, obs)| {
                let latest = obs.iter().map(|o| o.extracted_at).max()?;
                Some(PartCandidate {
                    part_number: part_number.clone(),
                    observation_count: obs.len(),
                    latest_observation: latest,
                })
            })
            .collect())
    }

    fn count_observations(&self) -> Result<usize, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("observation.count"))?;
        Ok(state.total)
    }

    fn count_part_numbers(&self) -> Result<usize, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("observation.count_parts"))?;
        Ok(state.by_part.len())
    }
}

/// Serialized form of an `InMemoryConsensusSink`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SinkSnapshot {
    #[serde(default)]
    pub consensus: Vec<ConsensusFitment>,
    #[serde(default)]
    pub conflicts: Vec<ConflictingFitment>,
}

#[derive(Debug, Default)]
struct SinkState {
    consensus: BTreeMap<String, ConsensusFitment>,
    conflicts: BTreeMap<ConflictId, ConflictingFitment>,
}

fn put_consensus(state: &mut SinkState, fitment: ConsensusFitment) -> WriteEffect {
    match state.consensus.get(&fitment.part_number) {
        Some(existing) if existing.same_outcome(&fitment) => WriteEffect::Unchanged,
        Some(_) => {
            state.consensus.insert(fitment.part_number.clone(), fitment);
            WriteEffect::Replaced
        }
        None => {
            state.consensus.insert(fitment.part_number.clone(), fitment);
            WriteEffect::Inserted
        }
    }
}

/// Thread-safe in-memory consensus sink.
#[derive(Debug, Default)]
pub struct InMemoryConsensusSink {
    state: RwLock<SinkState>,
}

impl InMemoryConsensusSink {
    /// Create a new empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a sink from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: SinkSnapshot) -> Self {
        let state = SinkState {
            consensus: snapshot
                .consensus
                .into_iter()
                .map(|c| (c.part_number.clone(), c))
                .collect(),
            conflicts: snapshot.conflicts.into_iter().map(|c| (c.id, c)).collect(),
        };
        Self {
            state: RwLock::new(state),
        }
    }

    /// Current contents, ordered by part number and conflict id.
    pub fn snapshot(&self) -> Result<SinkSnapshot, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("sink.snapshot"))?;
        Ok(SinkSnapshot {
            consensus: state.consensus.values().cloned().collect(),
            conflicts: state.conflicts.values().cloned().collect(),
        })
    }

    /// Load a snapshot file, or start empty when the file does not exist.
    pub fn load_json_or_default(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        Ok(Self::from_snapshot(read_json(path)?))
    }

    /// Write the current contents to `path`.
    pub fn save_json(&self, path: &Path) -> Result<(), StorageError> {
        write_json(path, &self.snapshot()?)
    }
}

impl ConsensusSink for InMemoryConsensusSink {
    fn get_consensus(&self, part_number: &str) -> Result<Option<ConsensusFitment>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("consensus.get"))?;
        Ok(state.consensus.get(part_number).cloned())
    }

    fn list_consensus(&self) -> Result<Vec<ConsensusFitment>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("consensus.list"))?;
        Ok(state.consensus.values().cloned().collect())
    }

    fn upsert_consensus(&self, fitment: ConsensusFitment) -> Result<WriteEffect, StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("consensus.upsert"))?;
        Ok(put_consensus(&mut state, fitment))
    }

    fn commit(&self, commit: PartCommit) -> Result<CommitOutcome, StorageError> {
        let part_number = commit.consensus.part_number.clone();
        if let Some(draft) = commit
            .conflicts
            .iter()
            .find(|d| d.part_number != part_number)
        {
            return Err(StorageError::WriteRejected(format!(
                "conflict for part {} in commit for part {part_number}",
                draft.part_number
            )));
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("sink.commit"))?;

        let mut outcome = CommitOutcome::unchanged();
        outcome.consensus = put_consensus(&mut state, commit.consensus);

        let mut produced = BTreeSet::new();
        for draft in &commit.conflicts {
            let id = draft.id();
            produced.insert(id);
            match state.conflicts.get_mut(&id) {
                None => {
                    state
                        .conflicts
                        .insert(id, ConflictingFitment::from_draft(draft, commit.at));
                    outcome.conflicts_opened += 1;
                }
                Some(existing) if existing.is_pending() => {
                    if existing.description != draft.description
                        || existing.listing_refs != draft.listing_refs
                    {
                        existing.refresh(draft);
                        outcome.conflicts_refreshed += 1;
                    }
                }
                Some(existing) if commit.reopen_resolved => {
                    existing.reopen(draft);
                    outcome.conflicts_reopened += 1;
                }
                Some(_) => outcome.conflicts_kept += 1,
            }
        }

        let dismissal = ConflictReview {
            status: ConflictStatus::Dismissed,
            resolved_by: ENGINE_REVIEWER.to_string(),
            notes: "Current evidence no longer produces this conflict".to_string(),
            at: commit.at,
            adjustment: None,
        };
        for conflict in state.conflicts.values_mut() {
            if conflict.part_number == part_number
                && conflict.is_pending()
                && !produced.contains(&conflict.id)
            {
                conflict.apply_review(&dismissal);
                outcome.conflicts_dismissed += 1;
            }
        }

        Ok(outcome)
    }

    fn get_conflict(&self, id: ConflictId) -> Result<Option<ConflictingFitment>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("conflict.get"))?;
        Ok(state.conflicts.get(&id).cloned())
    }

    fn list_conflicts(
        &self,
        filter: &ConflictFilter,
    ) -> Result<Vec<ConflictingFitment>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("conflict.list"))?;
        let mut out: Vec<ConflictingFitment> = state
            .conflicts
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    fn update_conflict_resolution(
        &self,
        id: ConflictId,
        review: &ConflictReview,
    ) -> Result<ConflictingFitment, StorageError> {
        if !review.status.is_terminal() {
            return Err(StorageError::WriteRejected(format!(
                "conflict {id} cannot be moved to {}",
                review.status
            )));
        }
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("conflict.update_resolution"))?;
        let conflict = state
            .conflicts
            .get_mut(&id)
            .ok_or(StorageError::ConflictNotFound(id))?;
        conflict.apply_review(review);
        Ok(conflict.clone())
    }

    fn consensus_status_counts(&self) -> Result<BTreeMap<FitmentStatus, usize>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("consensus.status_counts"))?;
        let mut counts: BTreeMap<FitmentStatus, usize> =
            FitmentStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for fitment in state.consensus.values() {
            *counts.entry(fitment.status).or_default() += 1;
        }
        Ok(counts)
    }

    fn conflict_status_counts(&self) -> Result<BTreeMap<ConflictStatus, usize>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("conflict.status_counts"))?;
        let mut counts: BTreeMap<ConflictStatus, usize> =
            ConflictStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for conflict in state.conflicts.values() {
            *counts.entry(conflict.status).or_default() += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::conflict::{ConflictCategory, ConflictDraft};
    use crate::signature::FitmentSignature;

    fn fitment(part: &str, trim: &str, digest: &str) -> ConsensusFitment {
        ConsensusFitment {
            part_number: part.to_string(),
            signature: FitmentSignature::new(2010, "Ford", "F-150", Some(trim), None),
            confidence_score: 80,
            status: FitmentStatus::HighConfidence,
            supporting_listings: 4,
            total_weight: 4.0,
            evidence_digest: digest.to_string(),
            last_updated: Utc::now(),
        }
    }

    fn draft(part: &str, category: ConflictCategory, description: &str) -> ConflictDraft {
        ConflictDraft {
            part_number: part.to_string(),
            category,
            description: description.to_string(),
            contenders: Vec::new(),
            listing_refs: Vec::new(),
        }
    }

    fn commit(part: &str, conflicts: Vec<ConflictDraft>) -> PartCommit {
        PartCommit {
            consensus: fitment(part, "XLT", "d1"),
            conflicts,
            reopen_resolved: false,
            at: Utc::now(),
        }
    }

    #[test]
    fn candidates_respect_min_listings_and_report_latest() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mk = |part: &str, at| {
            Observation::builder()
                .part_number(part)
                .vehicle(2010, "Ford", "F-150")
                .extracted_at(at)
                .build()
                .unwrap()
        };
        let store = InMemoryObservationStore::from_observations(vec![
            mk("A", t0),
            mk("A", t0 + Duration::days(2)),
            mk("B", t0),
        ]);
        store.insert(mk("C", t0)).unwrap();

        let all = store.list_candidate_part_numbers(1).unwrap();
        assert_eq!(all.len(), 3);
        let two = store.list_candidate_part_numbers(2).unwrap();
        assert_eq!(two.len(), 1);
        assert_eq!(two[0].part_number, "A");
        assert_eq!(two[0].observation_count, 2);
        assert_eq!(two[0].latest_observation, t0 + Duration::days(2));

        assert_eq!(store.count_observations().unwrap(), 4);
        assert_eq!(store.count_part_numbers().unwrap(), 3);
        assert!(store.list_observations("missing").unwrap().is_empty());
    }

    #[test]
    fn upsert_leaves_same_outcome_untouched() {
        let sink = InMemoryConsensusSink::new();
        let first = fitment("P", "XLT", "d1");
        let stamp = first.last_updated;
        assert_eq!(sink.upsert_consensus(first).unwrap(), WriteEffect::Inserted);

        let mut again = fitment("P", "XLT", "d1");
        again.last_updated = stamp + Duration::hours(1);
        assert_eq!(sink.upsert_consensus(again).unwrap(), WriteEffect::Unchanged);
        assert_eq!(sink.get_consensus("P").unwrap().unwrap().last_updated, stamp);

        assert_eq!(
            sink.upsert_consensus(fitment("P", "Lariat", "d2")).unwrap(),
            WriteEffect::Replaced
        );
        assert_eq!(sink.list_consensus().unwrap().len(), 1);
    }

    #[test]
    fn commit_opens_refreshes_and_dismisses_conflicts() {
        let sink = InMemoryConsensusSink::new();
        let out = sink
            .commit(commit("P", vec![draft("P", ConflictCategory::YearRange, "v1")]))
            .unwrap();
        assert_eq!(out.consensus, WriteEffect::Inserted);
        assert_eq!(out.conflicts_opened, 1);

        let out = sink
            .commit(commit("P", vec![draft("P", ConflictCategory::YearRange, "v1")]))
            .unwrap();
        assert_eq!(out, CommitOutcome::unchanged());

        let out = sink
            .commit(commit("P", vec![draft("P", ConflictCategory::YearRange, "v2")]))
            .unwrap();
        assert_eq!(out.conflicts_refreshed, 1);

        let out = sink.commit(commit("P", Vec::new())).unwrap();
        assert_eq!(out.conflicts_dismissed, 1);
        let id = ConflictId::for_part("P", ConflictCategory::YearRange);
        let stored = sink.get_conflict(id).unwrap().unwrap();
        assert_eq!(stored.status, ConflictStatus::Dismissed);
        assert_eq!(stored.resolved_by.as_deref(), Some(ENGINE_REVIEWER));
    }

    #[test]
    fn terminal_conflicts_are_kept_unless_reopened() {
        let sink = InMemoryConsensusSink::new();
        sink.commit(commit("P", vec![draft("P", ConflictCategory::YearRange, "v1")]))
            .unwrap();
        let id = ConflictId::for_part("P", ConflictCategory::YearRange);
        let review = ConflictReview::new(ConflictStatus::Resolved, "alice", "ok").unwrap();
        sink.update_conflict_resolution(id, &review).unwrap();

        let out = sink
            .commit(commit("P", vec![draft("P", ConflictCategory::YearRange, "v1")]))
            .unwrap();
        assert_eq!(out.conflicts_kept, 1);
        assert_eq!(sink.get_conflict(id).unwrap().unwrap().status, ConflictStatus::Resolved);

        let mut reopen = commit("P", vec![draft("P", ConflictCategory::YearRange, "v1")]);
        reopen.reopen_resolved = true;
        let out = sink.commit(reopen).unwrap();
        assert_eq!(out.conflicts_reopened, 1);
        assert!(sink.get_conflict(id).unwrap().unwrap().is_pending());
    }

    #[test]
    fn commit_rejects_foreign_conflicts_without_writing() {
        let sink = InMemoryConsensusSink::new();
        let err = sink
            .commit(commit("P", vec![draft("Q", ConflictCategory::YearRange, "v1")]))
            .unwrap_err();
        assert!(matches!(err, StorageError::WriteRejected(_)));
        assert!(sink.get_consensus("P").unwrap().is_none());
    }

    #[test]
    fn list_conflicts_filters_and_orders_newest_first() {
        let sink = InMemoryConsensusSink::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (i, part) in ["A", "B", "C"].iter().enumerate() {
            let mut c = commit(part, vec![draft(part, ConflictCategory::CrossManufacturer, "x")]);
            c.at = t0 + Duration::days(i64::try_from(i).unwrap());
            sink.commit(c).unwrap();
        }

        let pending = sink.list_conflicts(&ConflictFilter::pending()).unwrap();
        let parts: Vec<&str> = pending.iter().map(|c| c.part_number.as_str()).collect();
        assert_eq!(parts, vec!["C", "B", "A"]);

        let old = sink
            .list_conflicts(&ConflictFilter::pending().created_before(t0 + Duration::hours(12)))
            .unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].part_number, "A");

        let one = sink.list_conflicts(&ConflictFilter::any().for_part("B")).unwrap();
        assert_eq!(one.len(), 1);

        let counts = sink.conflict_status_counts().unwrap();
        assert_eq!(counts[&ConflictStatus::Pending], 3);
        assert_eq!(counts[&ConflictStatus::Resolved], 0);
    }

    #[test]
    fn update_resolution_errors() {
        let sink = InMemoryConsensusSink::new();
        let id = ConflictId::for_part("P", ConflictCategory::YearRange);
        let review = ConflictReview::new(ConflictStatus::Dismissed, "alice", "").unwrap();
        let err = sink.update_conflict_resolution(id, &review).unwrap_err();
        assert!(matches!(err, StorageError::ConflictNotFound(_)));

        let mut pending = review.clone();
        pending.status = ConflictStatus::Pending;
        let err = sink.update_conflict_resolution(id, &pending).unwrap_err();
        assert!(matches!(err, StorageError::WriteRejected(_)));
    }

    #[test]
    fn snapshot_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let empty = InMemoryConsensusSink::load_json_or_default(&path).unwrap();
        assert!(empty.list_consensus().unwrap().is_empty());

        let sink = InMemoryConsensusSink::new();
        sink.commit(commit("P", vec![draft("P", ConflictCategory::YearRange, "v1")]))
            .unwrap();
        sink.save_json(&path).unwrap();

        let restored = InMemoryConsensusSink::load_json_or_default(&path).unwrap();
        assert_eq!(restored.snapshot().unwrap(), sink.snapshot().unwrap());
    }

    #[test]
    fn observation_file_errors_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let err = InMemoryObservationStore::load_json(&missing).unwrap_err();
        assert!(err.is_unavailable());

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{not json").unwrap();
        let err = InMemoryObservationStore::load_json(&bad).unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};

use fitment_consensus::storage::{CommitOutcome, PartCandidate, PartCommit, WriteEffect};
use fitment_consensus::{
    CancelToken, ConflictFilter, ConflictId, ConflictReview, ConflictStatus, ConflictingFitment,
    ConsensusConfig, ConsensusEngine, ConsensusError, ConsensusFitment, ConsensusSink,
    FitmentStatus, InMemoryConsensusSink, InMemoryObservationStore, Observation, ObservationStore,
    StorageError,
};

fn parts(n: usize) -> Vec<Observation> {
    let mut obs = Vec::new();
    for p in 0..n {
        for _ in 0..3 {
            obs.push(
                Observation::builder()
                    .part_number(format!("PN{p:04}"))
                    .vehicle(2012, "Subaru", "Outback")
                    .trim("Limited")
                    .engine("2.5L H4")
                    .extracted_at(Utc::now() - Duration::hours(1))
                    .build()
                    .unwrap(),
            );
        }
    }
    obs
}

/// Sink that rejects commits for one part number.
struct RejectingSink {
    inner: InMemoryConsensusSink,
    reject: &'static str,
}

impl ConsensusSink for RejectingSink {
    fn get_consensus(&self, part_number: &str) -> Result<Option<ConsensusFitment>, StorageError> {
        self.inner.get_consensus(part_number)
    }

    fn list_consensus(&self) -> Result<Vec<ConsensusFitment>, StorageError> {
        self.inner.list_consensus()
    }

    fn upsert_consensus(&self, fitment: ConsensusFitment) -> Result<WriteEffect, StorageError> {
        self.inner.upsert_consensus(fitment)
    }

    fn commit(&self, commit: PartCommit) -> Result<CommitOutcome, StorageError> {
        if commit.consensus.part_number == self.reject {
            return Err(StorageError::WriteRejected(
                "check constraint violated".to_string(),
            ));
        }
        self.inner.commit(commit)
    }

    fn get_conflict(&self, id: ConflictId) -> Result<Option<ConflictingFitment>, StorageError> {
        self.inner.get_conflict(id)
    }

    fn list_conflicts(
        &self,
        filter: &ConflictFilter,
    ) -> Result<Vec<ConflictingFitment>, StorageError> {
        self.inner.list_conflicts(filter)
    }

    fn update_conflict_resolution(
        &self,
        id: ConflictId,
        review: &ConflictReview,
    ) -> Result<ConflictingFitment, StorageError> {
        self.inner.update_conflict_resolution(id, review)
    }

    fn consensus_status_counts(&self) -> Result<BTreeMap<FitmentStatus, usize>, StorageError> {
        self.inner.consensus_status_counts()
    }

    fn conflict_status_counts(&self) -> Result<BTreeMap<ConflictStatus, usize>, StorageError> {
        self.inner.conflict_status_counts()
    }
}

/// Store whose connection drops after a number of reads.
struct FlakyStore {
    inner: InMemoryObservationStore,
    reads_left: AtomicUsize,
}

impl ObservationStore for FlakyStore {
    fn list_observations(&self, part_number: &str) -> Result<Vec<Observation>, StorageError> {
        let left = self.reads_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(StorageError::Unavailable("connection reset".to_string()));
        }
        self.reads_left.store(left - 1, Ordering::SeqCst);
        self.inner.list_observations(part_number)
    }

    fn list_candidate_part_numbers(
        &self,
        min_listings: usize,
    ) -> Result<Vec<PartCandidate>, StorageError> {
        self.inner.list_candidate_part_numbers(min_listings)
    }

    fn count_observations(&self) -> Result<usize, StorageError> {
        self.inner.count_observations()
    }

    fn count_part_numbers(&self) -> Result<usize, StorageError> {
        self.inner.count_part_numbers()
    }
}

/// Store that cancels the run while reading its Nth part number.
struct CancellingStore {
    inner: InMemoryObservationStore,
    cancel: CancelToken,
    cancel_on_read: usize,
    reads: AtomicUsize,
}

impl ObservationStore for CancellingStore {
    fn list_observations(&self, part_number: &str) -> Result<Vec<Observation>, StorageError> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if read == self.cancel_on_read {
            self.cancel.cancel();
        }
        self.inner.list_observations(part_number)
    }

    fn list_candidate_part_numbers(
        &self,
        min_listings: usize,
    ) -> Result<Vec<PartCandidate>, StorageError> {
        self.inner.list_candidate_part_numbers(min_listings)
    }

    fn count_observations(&self) -> Result<usize, StorageError> {
        self.inner.count_observations()
    }

    fn count_part_numbers(&self) -> Result<usize, StorageError> {
        self.inner.count_part_numbers()
    }
}

#[test]
fn one_failing_part_does_not_stop_the_batch() {
    let sink = Arc::new(RejectingSink {
        inner: InMemoryConsensusSink::new(),
        reject: "PN0003",
    });
    let engine = ConsensusEngine::new(
        Arc::new(InMemoryObservationStore::from_observations(parts(8))),
        sink.clone(),
        ConsensusConfig::default().with_workers(3),
    );

    let summary = engine.process_all(2).unwrap();
    assert_eq!(summary.candidates, 8);
    assert_eq!(summary.total_parts_processed, 8);
    assert_eq!(summary.total_fitments_processed, 7);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].part_number, "PN0003");
    assert!(summary.failed[0].error.contains("check constraint"));

    assert!(sink.get_consensus("PN0003").unwrap().is_none());
    assert_eq!(sink.list_consensus().unwrap().len(), 7);
}

#[test]
fn unavailable_store_aborts_the_batch() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryObservationStore::from_observations(parts(6)),
        reads_left: AtomicUsize::new(2),
    });
    let engine = ConsensusEngine::new(
        store,
        Arc::new(InMemoryConsensusSink::new()),
        ConsensusConfig::default().with_workers(1),
    );

    let err = engine.process_all(2).unwrap_err();
    assert!(matches!(err, ConsensusError::StoreUnavailable { .. }));
    assert!(err.is_fatal());
}

#[test]
fn cancelled_run_commits_nothing_further() {
    let sink = Arc::new(InMemoryConsensusSink::new());
    let engine = ConsensusEngine::new(
        Arc::new(InMemoryObservationStore::from_observations(parts(10))),
        sink.clone(),
        ConsensusConfig::default(),
    );
    let cancel = CancelToken::new();
    cancel.cancel();

    let summary = engine.process_candidates(2, false, &cancel).unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.candidates, 10);
    assert_eq!(summary.not_started(), 10);
    assert!(sink.list_consensus().unwrap().is_empty());
}

#[test]
fn run_cancelled_midway_keeps_committed_parts() {
    let cancel = CancelToken::new();
    let store = Arc::new(CancellingStore {
        inner: InMemoryObservationStore::from_observations(parts(10)),
        cancel: cancel.clone(),
        cancel_on_read: 3,
        reads: AtomicUsize::new(0),
    });
    let sink = Arc::new(InMemoryConsensusSink::new());
    let engine = ConsensusEngine::new(
        store,
        sink.clone(),
        ConsensusConfig::default().with_workers(1),
    );

    let summary = engine.process_candidates(2, false, &cancel).unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.candidates, 10);
    assert!(summary.total_parts_processed > 0);
    assert!(summary.total_parts_processed < summary.candidates);
    // The part being read when the cancel arrived still finishes.
    assert_eq!(summary.total_parts_processed, 3);
    assert_eq!(summary.total_fitments_processed, 3);
    assert_eq!(summary.not_started(), 7);

    let committed: Vec<String> = sink
        .list_consensus()
        .unwrap()
        .into_iter()
        .map(|c| c.part_number)
        .collect();
    assert_eq!(committed, vec!["PN0000", "PN0001", "PN0002"]);
}

#[test]
fn new_data_only_selects_stale_part_numbers() {
    let store = Arc::new(InMemoryObservationStore::from_observations(parts(4)));
    let sink = Arc::new(InMemoryConsensusSink::new());
    let engine = ConsensusEngine::new(store.clone(), sink, ConsensusConfig::default());

    let first = engine.process_new_data_only(2).unwrap();
    assert_eq!(first.candidates, 4);

    let idle = engine.process_new_data_only(2).unwrap();
    assert_eq!(idle.candidates, 0);

    store
        .insert(
            Observation::builder()
                .part_number("PN0002")
                .vehicle(2012, "Subaru", "Outback")
                .trim("Limited")
                .engine("2.5L H4")
                .extracted_at(Utc::now() + Duration::minutes(5))
                .build()
                .unwrap(),
        )
        .unwrap();

    let plan = engine.plan_candidates(2, true).unwrap();
    assert_eq!(plan.candidates.len(), 1);
    assert_eq!(plan.candidates[0].part_number, "PN0002");

    let fresh = engine.process_new_data_only(2).unwrap();
    assert_eq!(fresh.candidates, 1);
    assert_eq!(fresh.total_fitments_processed, 1);
}

#[test]
fn state_survives_a_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let observations_path = dir.path().join("observations.json");
    let state_path = dir.path().join("state.json");

    let mut obs = parts(3);
    for _ in 0..2 {
        obs.push(
            Observation::builder()
                .part_number("SPLIT01")
                .vehicle(2007, "Honda", "Civic")
                .build()
                .unwrap(),
        );
        obs.push(
            Observation::builder()
                .part_number("SPLIT01")
                .vehicle(2007, "Toyota", "Corolla")
                .build()
                .unwrap(),
        );
    }
    std::fs::write(&observations_path, serde_json::to_vec_pretty(&obs).unwrap()).unwrap();

    let store = Arc::new(InMemoryObservationStore::load_json(&observations_path).unwrap());
    let sink = Arc::new(InMemoryConsensusSink::load_json_or_default(&state_path).unwrap());
    let engine = ConsensusEngine::new(store.clone(), sink.clone(), ConsensusConfig::default());
    let summary = engine.process_all(2).unwrap();
    assert_eq!(summary.total_fitments_processed, 4);
    assert_eq!(summary.total_conflicts_identified, 1);
    sink.save_json(&state_path).unwrap();

    let reloaded = Arc::new(InMemoryConsensusSink::load_json_or_default(&state_path).unwrap());
    assert_eq!(reloaded.snapshot().unwrap(), sink.snapshot().unwrap());

    let engine = ConsensusEngine::new(store, reloaded.clone(), ConsensusConfig::default());
    let result = engine.process_part_number("SPLIT01").unwrap();
    assert_eq!(result.consensus_effect, Some(WriteEffect::Unchanged));
    assert_eq!(
        reloaded
            .list_conflicts(&ConflictFilter::pending())
            .unwrap()
            .len(),
        1
    );
}

/// Observations written without ids, the way a scraper export arrives.
fn write_id_less(path: &std::path::Path, obs: &[Observation]) {
    let mut rows = serde_json::to_value(obs).unwrap();
    for row in rows.as_array_mut().unwrap() {
        row.as_object_mut().unwrap().remove("id");
    }
    std::fs::write(path, serde_json::to_vec_pretty(&rows).unwrap()).unwrap();
}

#[test]
fn id_less_rows_keep_their_identity_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let observations_path = dir.path().join("observations.json");
    let state_path = dir.path().join("state.json");

    let extracted = Utc::now() - Duration::hours(2);
    let mut obs = Vec::new();
    for (n, year) in [2008, 2008, 2008, 2009, 2009].into_iter().enumerate() {
        obs.push(
            Observation::builder()
                .part_number("AC45821")
                .vehicle(year, "Acura", "TL")
                .trim("Base")
                .engine("3.2L V6")
                .source_listing_id(format!("ebay-{n}"))
                .extracted_at(extracted)
                .build()
                .unwrap(),
        );
    }
    write_id_less(&observations_path, &obs);

    // First invocation: process and save.
    let store = Arc::new(InMemoryObservationStore::load_json(&observations_path).unwrap());
    let sink = Arc::new(InMemoryConsensusSink::load_json_or_default(&state_path).unwrap());
    let engine = ConsensusEngine::new(store, sink.clone(), ConsensusConfig::default());
    let first = engine.process_part_number("AC45821").unwrap();
    assert_eq!(first.consensus_effect, Some(WriteEffect::Inserted));
    let before = sink.get_consensus("AC45821").unwrap().unwrap();
    sink.save_json(&state_path).unwrap();

    // Second invocation reloads both files and finds nothing new.
    let store = Arc::new(InMemoryObservationStore::load_json(&observations_path).unwrap());
    let sink = Arc::new(InMemoryConsensusSink::load_json_or_default(&state_path).unwrap());
    let engine = ConsensusEngine::new(store, sink.clone(), ConsensusConfig::default());
    let second = engine.process_part_number("AC45821").unwrap();
    assert_eq!(second.consensus_effect, Some(WriteEffect::Unchanged));
    let after = sink.get_consensus("AC45821").unwrap().unwrap();
    assert_eq!(after.evidence_digest, before.evidence_digest);
    assert_eq!(after.last_updated, before.last_updated);
    sink.save_json(&state_path).unwrap();

    // Third invocation only auto-resolves; the stored refs still match.
    let store = Arc::new(InMemoryObservationStore::load_json(&observations_path).unwrap());
    let sink = Arc::new(InMemoryConsensusSink::load_json_or_default(&state_path).unwrap());
    let engine = ConsensusEngine::new(store, sink.clone(), ConsensusConfig::default());
    let summary = engine.auto_resolve(&ConflictFilter::pending()).unwrap();
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.dismissed, 1);
    assert_eq!(summary.manual, 0);
    assert!(sink
        .list_conflicts(&ConflictFilter::pending())
        .unwrap()
        .is_empty());
}

//! Read path: evaluating a part number without writing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::conflict::{classify, ConflictCategory, ConflictDraft, ConflictingFitment};
use crate::consensus::{evidence_digest, resolve, ConsensusFitment, Resolution, ResolveOutcome};
use crate::error::{ConsensusError, ConsensusResult};
use crate::grouping::{group_observations, Grouping};
use crate::review::{adjust, Adjustment};
use crate::signature::FitmentSignature;
use crate::storage::{ConflictFilter, PartCandidate};

use super::{ConsensusEngine, SkipReason};

const HISTOGRAM_BUCKET: usize = 5;
const TOP_PARTS: usize = 10;

/// One group as reported by a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub signature: FitmentSignature,
    pub member_count: usize,
    pub weight: f64,
}

/// What processing a part number would do.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartPlan {
    pub part_number: String,
    pub quality_model: String,
    pub observations_total: usize,
    pub skipped_observations: usize,
    pub groups: Vec<GroupSummary>,
    /// Resolution of the raw groups.
    pub outcome: ResolveOutcome,
    /// Resolution after a reviewed adjustment, when one applies.
    pub adjusted: Option<Resolution>,
    pub adjustment: Option<Adjustment>,
    pub conflict: Option<ConflictDraft>,
    pub evidence_digest: String,
}

impl PartPlan {
    /// The resolution that would be written.
    #[must_use]
    pub fn effective_resolution(&self) -> Option<&Resolution> {
        self.adjusted.as_ref().or_else(|| self.outcome.resolution())
    }

    #[must_use]
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self.outcome {
            ResolveOutcome::Resolved(_) => None,
            ResolveOutcome::InsufficientData { observed, required } => {
                Some(SkipReason::InsufficientData { observed, required })
            }
        }
    }

    /// The consensus record processing would write, stamped `now`.
    #[must_use]
    pub fn consensus(&self, now: DateTime<Utc>) -> Option<ConsensusFitment> {
        self.effective_resolution().map(|r| {
            ConsensusFitment::from_resolution(
                self.part_number.clone(),
                r,
                self.evidence_digest.clone(),
                now,
            )
        })
    }
}

/// Listing-count bucket of a candidate histogram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistogramBucket {
    /// Inclusive bounds, e.g. `5-9`.
    pub label: String,
    pub lower: usize,
    pub upper: usize,
    pub count: usize,
}

/// Batch dry-run: the part numbers a run would process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidatePlan {
    pub min_listings: usize,
    pub new_data_only: bool,
    pub candidates: Vec<PartCandidate>,
    pub histogram: Vec<HistogramBucket>,
}

fn histogram(candidates: &[PartCandidate]) -> Vec<HistogramBucket> {
    let mut buckets: std::collections::BTreeMap<usize, usize> = std::collections::BTreeMap::new();
    for candidate in candidates {
        *buckets
            .entry(candidate.observation_count / HISTOGRAM_BUCKET)
            .or_default() += 1;
    }
    buckets
        .into_iter()
        .map(|(idx, count)| {
            let lower = idx * HISTOGRAM_BUCKET;
            let upper = lower + HISTOGRAM_BUCKET - 1;
            HistogramBucket {
                label: format!("{lower}-{upper}"),
                lower,
                upper,
                count,
            }
        })
        .collect()
}

/// A stored conflict with its age at the time of the listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictEntry {
    #[serde(flatten)]
    pub conflict: ConflictingFitment,
    pub age_days: i64,
}

/// Part number and how many selected conflicts it has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartConflictCount {
    pub part_number: String,
    pub conflicts: usize,
}

/// Conflicts matching a filter, newest first, with per-category and per-part
/// counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictSummary {
    pub filter: ConflictFilter,
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub by_category: BTreeMap<ConflictCategory, usize>,
    /// At most ten part numbers, most conflicts first.
    pub top_parts: Vec<PartConflictCount>,
    pub average_age_days: f64,
    pub conflicts: Vec<ConflictEntry>,
}

impl ConflictSummary {
    fn build(
        filter: &ConflictFilter,
        conflicts: Vec<ConflictingFitment>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut by_category = BTreeMap::new();
        let mut by_part: BTreeMap<&str, usize> = BTreeMap::new();
        for conflict in &conflicts {
            *by_category.entry(conflict.category).or_insert(0) += 1;
            *by_part.entry(conflict.part_number.as_str()).or_insert(0) += 1;
        }

        let mut top_parts: Vec<PartConflictCount> = by_part
            .into_iter()
            .map(|(part_number, conflicts)| PartConflictCount {
                part_number: part_number.to_string(),
                conflicts,
            })
            .collect();
        // Stable sort keeps part-number order among equal counts.
        top_parts.sort_by(|a, b| b.conflicts.cmp(&a.conflicts));
        top_parts.truncate(TOP_PARTS);

        let conflicts: Vec<ConflictEntry> = conflicts
            .into_iter()
            .map(|conflict| ConflictEntry {
                age_days: (now - conflict.created_at).num_days().max(0),
                conflict,
            })
            .collect();

        let total = conflicts.len();
        #[allow(clippy::cast_precision_loss)]
        let average_age_days = if total == 0 {
            0.0
        } else {
            conflicts.iter().map(|c| c.age_days as f64).sum::<f64>() / total as f64
        };

        Self {
            filter: filter.clone(),
            generated_at: now,
            total,
            by_category,
            top_parts,
            average_age_days,
            conflicts,
        }
    }
}

impl ConsensusEngine {
    /// Lists stored conflicts matching `filter` with summary counts.
    pub fn conflict_summary(
        &self,
        filter: &ConflictFilter,
        now: DateTime<Utc>,
    ) -> ConsensusResult<ConflictSummary> {
        let conflicts = self
            .sink
            .list_conflicts(filter)
            .map_err(ConsensusError::from_storage)?;
        Ok(ConflictSummary::build(filter, conflicts, now))
    }

    /// Groups, weighs, resolves and classifies a part number without writing.
    ///
    /// A conflict previously resolved with an adjustment is honored, so the
    /// plan matches what processing would write.
    pub fn plan_part_number(&self, part_number: &str) -> ConsensusResult<PartPlan> {
        let observations = self
            .observations
            .list_observations(part_number)
            .map_err(ConsensusError::from_storage)?;
        let observations_total = observations.len();
        let grouping = group_observations(part_number, observations, self.quality.as_ref());
        let outcome = resolve(&grouping.groups, &self.config);

        let conflict = outcome
            .resolution()
            .and_then(|r| classify(part_number, &grouping.groups, r, &self.config));

        let mut adjusted = None;
        let mut adjustment = None;
        let mut effective: Option<Grouping> = None;
        if let Some(draft) = conflict.as_ref().filter(|_| !self.reopen_resolved) {
            let existing = self
                .sink
                .get_conflict(draft.id())
                .map_err(ConsensusError::from_storage)?;
            if let Some(adj) = existing.as_ref().and_then(|c| c.active_adjustment()) {
                let regrouped = adjust(&grouping, adj);
                if let ResolveOutcome::Resolved(r) = resolve(&regrouped.groups, &self.config) {
                    adjusted = Some(r);
                    adjustment = Some(adj.clone());
                    effective = Some(regrouped);
                }
            }
        }
        let evidence_digest = evidence_digest(effective.as_ref().unwrap_or(&grouping));

        Ok(PartPlan {
            part_number: part_number.to_string(),
            quality_model: self.quality.name().to_string(),
            observations_total,
            skipped_observations: grouping.skipped_count(),
            groups: grouping
                .groups
                .iter()
                .map(|g| GroupSummary {
                    signature: g.signature.clone(),
                    member_count: g.member_count(),
                    weight: g.weight,
                })
                .collect(),
            outcome,
            adjusted,
            adjustment,
            conflict,
            evidence_digest,
        })
    }

    /// Part numbers a batch run would select, plus a listing-count histogram.
    pub fn plan_candidates(
        &self,
        min_listings: usize,
        new_data_only: bool,
    ) -> ConsensusResult<CandidatePlan> {
        let candidates = self.candidates(min_listings, new_data_only)?;
        let histogram = histogram(&candidates);
        Ok(CandidatePlan {
            min_listings,
            new_data_only,
            candidates,
            histogram,
        })
    }

    pub(crate) fn candidates(
        &self,
        min_listings: usize,
        new_data_only: bool,
    ) -> ConsensusResult<Vec<PartCandidate>> {
        let candidates = self
            .observations
            .list_candidate_part_numbers(min_listings)
            .map_err(ConsensusError::from_storage)?;
        if !new_data_only {
            return Ok(candidates);
        }

        let mut fresh = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let consensus = self
                .sink
                .get_consensus(&candidate.part_number)
                .map_err(ConsensusError::from_storage)?;
            let stale = consensus.map_or(true, |c| candidate.latest_observation > c.last_updated);
            if stale {
                fresh.push(candidate);
            }
        }
        Ok(fresh)
    }
}

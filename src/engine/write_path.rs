//! Engine write path: per-part commits, auto-resolution and reviews.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::conflict::{ConflictId, ConflictReview, ConflictStatus, ConflictingFitment};
use crate::consensus::{evidence_digest, resolve, ConsensusFitment, FitmentStatus, ResolveOutcome};
use crate::error::{ConsensusError, ConsensusResult};
use crate::grouping::{group_observations, Grouping};
use crate::review::{
    adjust, referenced_listings, AutoAction, AutoDecision, AutoResolver, AUTO_RESOLVER,
};
use crate::storage::{ConflictFilter, PartCommit};

use super::{AutoResolveSummary, ConsensusEngine, ProcessResult};

struct PendingReview {
    conflict: ConflictingFitment,
    grouping: Grouping,
    decision: AutoDecision,
}

impl ConsensusEngine {
    /// Resolves one part number and commits its consensus and conflicts.
    ///
    /// Too few observations is reported as a skip reason, not an error.
    pub fn process_part_number(&self, part_number: &str) -> ConsensusResult<ProcessResult> {
        let plan = self.plan_part_number(part_number)?;
        let now = Utc::now();

        let Some(consensus) = plan.consensus(now) else {
            let reason = plan.skip_reason().unwrap_or(super::SkipReason::InsufficientData {
                observed: 0,
                required: self.config.min_listings,
            });
            tracing::info!(
                part_number = %part_number,
                reason = %reason,
                "Part number skipped."
            );
            return Ok(ProcessResult::skipped(
                part_number,
                plan.skipped_observations,
                reason,
            ));
        };

        let status = consensus.status;
        let conflicts: Vec<_> = plan.conflict.into_iter().collect();
        let conflict_count = conflicts.len();
        let outcome = self
            .sink
            .commit(PartCommit {
                consensus,
                conflicts,
                reopen_resolved: self.reopen_resolved,
                at: now,
            })
            .map_err(ConsensusError::from_storage)?;

        tracing::info!(
            part_number = %part_number,
            status = %status,
            conflicts = conflict_count,
            skipped_observations = plan.skipped_observations,
            consensus = ?outcome.consensus,
            conflicts_opened = outcome.conflicts_opened,
            conflicts_dismissed = outcome.conflicts_dismissed,
            "Part number processed."
        );

        Ok(ProcessResult {
            part_number: part_number.to_string(),
            processed: true,
            conflicts: conflict_count,
            status: Some(status),
            consensus_effect: Some(outcome.consensus),
            skipped_observations: plan.skipped_observations,
            reason: None,
        })
    }

    fn review_pending(&self, filter: &ConflictFilter) -> ConsensusResult<Vec<PendingReview>> {
        let resolver = AutoResolver::new(self.config.review.clone());
        let conflicts = self
            .sink
            .list_conflicts(filter)
            .map_err(ConsensusError::from_storage)?;

        let mut groupings: BTreeMap<String, Grouping> = BTreeMap::new();
        let mut reviews = Vec::new();
        for conflict in conflicts.into_iter().filter(ConflictingFitment::is_pending) {
            let grouping = match groupings.get(&conflict.part_number) {
                Some(grouping) => grouping.clone(),
                None => {
                    let observations = self
                        .observations
                        .list_observations(&conflict.part_number)
                        .map_err(ConsensusError::from_storage)?;
                    let grouping = group_observations(
                        &conflict.part_number,
                        observations,
                        self.quality.as_ref(),
                    );
                    groupings.insert(conflict.part_number.clone(), grouping.clone());
                    grouping
                }
            };
            let listings = referenced_listings(&grouping, &conflict);
            let decision = resolver.evaluate(&conflict, &listings);
            reviews.push(PendingReview {
                conflict,
                grouping,
                decision,
            });
        }
        Ok(reviews)
    }

    /// Evaluates the auto-resolution rules over matching PENDING conflicts
    /// without writing.
    pub fn preview_auto_resolve(
        &self,
        filter: &ConflictFilter,
    ) -> ConsensusResult<Vec<(ConflictingFitment, AutoDecision)>> {
        Ok(self
            .review_pending(filter)?
            .into_iter()
            .map(|r| (r.conflict, r.decision))
            .collect())
    }

    /// Runs the auto-resolution rules over matching PENDING conflicts.
    ///
    /// A failed write leaves that conflict PENDING and is counted; an
    /// unreachable store aborts the run.
    pub fn auto_resolve(&self, filter: &ConflictFilter) -> ConsensusResult<AutoResolveSummary> {
        let mut summary = AutoResolveSummary::default();

        for review in self.review_pending(filter)? {
            summary.examined += 1;
            let PendingReview {
                conflict,
                grouping,
                decision,
            } = review;
            if decision.is_manual() {
                summary.manual += 1;
                continue;
            }

            match self.apply_decision(&conflict, &grouping, &decision) {
                Ok(()) => match decision.action {
                    AutoAction::Resolve => summary.resolved += 1,
                    AutoAction::Dismiss => summary.dismissed += 1,
                    AutoAction::Manual => summary.manual += 1,
                },
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::error!(
                        conflict_id = %conflict.id,
                        part_number = %conflict.part_number,
                        error = %err,
                        "Auto-resolution write failed."
                    );
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            examined = summary.examined,
            resolved = summary.resolved,
            dismissed = summary.dismissed,
            manual = summary.manual,
            failed = summary.failed,
            "Auto-resolution finished."
        );
        Ok(summary)
    }

    fn apply_decision(
        &self,
        conflict: &ConflictingFitment,
        grouping: &Grouping,
        decision: &AutoDecision,
    ) -> ConsensusResult<()> {
        let status = match decision.action {
            AutoAction::Resolve => ConflictStatus::Resolved,
            AutoAction::Dismiss => ConflictStatus::Dismissed,
            AutoAction::Manual => return Ok(()),
        };
        let review = ConflictReview::new(status, AUTO_RESOLVER, decision.notes.clone())?
            .with_adjustment(decision.adjustment.clone());

        if let Some(adjustment) = &decision.adjustment {
            let current = self
                .sink
                .get_consensus(&conflict.part_number)
                .map_err(ConsensusError::from_storage)?;
            let protected = current
                .as_ref()
                .is_some_and(|c| c.status == FitmentStatus::HighConfidence);
            if !protected {
                let regrouped = adjust(grouping, adjustment);
                if let ResolveOutcome::Resolved(r) = resolve(&regrouped.groups, &self.config) {
                    let fitment = ConsensusFitment::from_resolution(
                        conflict.part_number.clone(),
                        &r,
                        evidence_digest(&regrouped),
                        review.at,
                    );
                    self.sink
                        .upsert_consensus(fitment)
                        .map_err(ConsensusError::from_storage)?;
                }
            }
        }

        self.sink
            .update_conflict_resolution(conflict.id, &review)
            .map_err(ConsensusError::from_storage)?;
        tracing::info!(
            conflict_id = %conflict.id,
            part_number = %conflict.part_number,
            action = %decision.action,
            rule = decision.rule.map_or("none", |r| r.name()),
            "Conflict auto-resolved."
        );
        Ok(())
    }

    /// Records a human reviewer's decision. Conflicts cannot be moved back to
    /// PENDING.
    pub fn record_review(
        &self,
        id: ConflictId,
        status: ConflictStatus,
        reviewer: &str,
        notes: &str,
    ) -> ConsensusResult<ConflictingFitment> {
        let review = ConflictReview::new(status, reviewer, notes)?;
        let updated = self
            .sink
            .update_conflict_resolution(id, &review)
            .map_err(ConsensusError::from_storage)?;
        tracing::info!(
            conflict_id = %id,
            status = %status,
            reviewer = %reviewer,
            "Conflict review recorded."
        );
        Ok(updated)
    }
}

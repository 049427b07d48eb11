use crate::config::ReviewConfig;
use crate::conflict::ConflictingFitment;
use crate::grouping::Grouping;

use super::{Adjustment, AutoDecision, ReviewRule};

/// Applies the review rules in order to PENDING conflicts.
#[derive(Debug, Clone, Default)]
pub struct AutoResolver {
    config: ReviewConfig,
}

impl AutoResolver {
    #[must_use]
    pub fn new(config: ReviewConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    /// Decides what to do with a conflict given the grouped listings it
    /// references.
    ///
    /// Terminal conflicts and conflicts whose listings are gone are left to a
    /// human reviewer.
    #[must_use]
    pub fn evaluate(&self, conflict: &ConflictingFitment, listings: &Grouping) -> AutoDecision {
        if !conflict.is_pending() {
            return AutoDecision::manual(format!("Conflict is already {}", conflict.status));
        }
        if listings.groups.len() < 2 {
            return AutoDecision::manual("Referenced listings no longer disagree; needs review");
        }

        for rule in ReviewRule::ORDERED {
            if let Some(decision) = rule.evaluate(conflict, listings, &self.config) {
                tracing::debug!(
                    conflict_id = %conflict.id,
                    part_number = %conflict.part_number,
                    rule = rule.name(),
                    action = %decision.action,
                    "Auto-resolution rule matched."
                );
                return decision;
            }
        }

        AutoDecision::manual(format!(
            "No auto-resolution rule matched {}; needs manual review",
            conflict.category
        ))
    }
}

/// Restricts a grouping to the listings a conflict references.
#[must_use]
pub(crate) fn referenced_listings(grouping: &Grouping, conflict: &ConflictingFitment) -> Grouping {
    grouping.retain(|id| conflict.listing_refs.contains(&id))
}

/// Regroups according to a resolve decision's adjustment.
#[must_use]
pub(crate) fn adjust(grouping: &Grouping, adjustment: &Adjustment) -> Grouping {
    match adjustment {
        Adjustment::GeneralizeTrim => grouping.generalize_trim(),
        Adjustment::DiscardGroup { signature } => grouping.without(signature),
    }
}

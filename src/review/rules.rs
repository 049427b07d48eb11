use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ReviewConfig;
use crate::conflict::{ConflictCategory, ConflictingFitment};
use crate::consensus::rank_groups;
use crate::grouping::Grouping;

use super::{Adjustment, AutoAction, AutoDecision};

/// Auto-resolution rules, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewRule {
    /// Two adjacent model years are catalogue noise.
    AdjacentYears,
    /// Trim variants of one vehicle collapse to a model-level fitment.
    TrimVariation,
    /// A listing far below the mean weight marks its group as an outlier.
    LowWeightOutlier,
}

impl ReviewRule {
    /// All rules, first match wins.
    pub const ORDERED: [Self; 3] = [
        Self::AdjacentYears,
        Self::TrimVariation,
        Self::LowWeightOutlier,
    ];

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AdjacentYears => "adjacent_years",
            Self::TrimVariation => "trim_variation",
            Self::LowWeightOutlier => "low_weight_outlier",
        }
    }

    /// Evaluates this rule against a conflict and the grouped listings it
    /// references. Returns `None` when the rule does not apply.
    #[must_use]
    pub fn evaluate(
        &self,
        conflict: &ConflictingFitment,
        listings: &Grouping,
        config: &ReviewConfig,
    ) -> Option<AutoDecision> {
        match self {
            Self::AdjacentYears => adjacent_years(conflict, listings, config),
            Self::TrimVariation => trim_variation(listings),
            Self::LowWeightOutlier => low_weight_outlier(listings, config),
        }
    }

    fn decide(
        self,
        action: AutoAction,
        notes: String,
        adjustment: Option<Adjustment>,
    ) -> AutoDecision {
        AutoDecision {
            rule: Some(self),
            action,
            notes,
            adjustment,
        }
    }
}

impl fmt::Display for ReviewRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn adjacent_years(
    conflict: &ConflictingFitment,
    listings: &Grouping,
    config: &ReviewConfig,
) -> Option<AutoDecision> {
    if conflict.category != ConflictCategory::YearRange {
        return None;
    }
    let years: BTreeSet<i32> = listings.groups.iter().map(|g| g.signature.year).collect();
    if years.len() != 2 {
        return None;
    }
    let lo = *years.first()?;
    let hi = *years.last()?;
    if hi - lo > config.adjacent_year_span {
        return None;
    }
    Some(ReviewRule::AdjacentYears.decide(
        AutoAction::Dismiss,
        format!("Adjacent model years {lo} and {hi} treated as catalogue noise"),
        None,
    ))
}

fn trim_variation(listings: &Grouping) -> Option<AutoDecision> {
    let first = &listings.groups.first()?.signature;
    let same_vehicle = listings.groups.iter().all(|g| {
        g.signature.year == first.year
            && g.signature.make == first.make
            && g.signature.model == first.model
            && g.signature.engine == first.engine
    });
    if !same_vehicle {
        return None;
    }
    // Listings without a trim say nothing about trim variation.
    let trims: BTreeSet<&str> = listings
        .groups
        .iter()
        .filter(|g| g.signature.has_trim())
        .map(|g| g.signature.trim.as_str())
        .collect();
    if trims.len() < 2 {
        return None;
    }
    let trims = trims.into_iter().collect::<Vec<_>>().join(", ");
    Some(ReviewRule::TrimVariation.decide(
        AutoAction::Resolve,
        format!(
            "Trim variation ({trims}) on {}; fitment recorded at model level",
            first.without_trim()
        ),
        Some(Adjustment::GeneralizeTrim),
    ))
}

fn low_weight_outlier(listings: &Grouping, config: &ReviewConfig) -> Option<AutoDecision> {
    let weights: Vec<f64> = listings
        .groups
        .iter()
        .flat_map(|g| g.members.iter().map(|m| m.weight))
        .collect();
    if weights.len() < config.outlier_min_listings || listings.groups.len() < 2 {
        return None;
    }

    #[allow(clippy::cast_precision_loss)]
    let mean = weights.iter().sum::<f64>() / weights.len() as f64;
    let min = weights.iter().copied().fold(f64::INFINITY, f64::min);
    if min >= config.outlier_ratio * mean {
        return None;
    }

    let ranked = rank_groups(&listings.groups);
    let outlier = ranked.last()?;
    Some(ReviewRule::LowWeightOutlier.decide(
        AutoAction::Resolve,
        format!(
            "Lowest weight {min:.2} is below {:.2} x mean {mean:.2}; discarding {} as an outlier",
            config.outlier_ratio, outlier.signature
        ),
        Some(Adjustment::DiscardGroup {
            signature: outlier.signature.clone(),
        }),
    ))
}

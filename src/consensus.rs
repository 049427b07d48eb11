//! Consensus resolution.
//!
//! Aggregates group weights for one part number, picks the dominant
//! signature and scores how strongly the evidence converges on it.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConsensusConfig;
use crate::grouping::{Grouping, ObservationGroup};
use crate::signature::FitmentSignature;

/// Confidence classification of a consensus fitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FitmentStatus {
    HighConfidence,
    MediumConfidence,
    LowConfidence,
    NeedsReview,
}

impl FitmentStatus {
    /// All statuses, in reporting order.
    pub const ALL: [Self; 4] = [
        Self::HighConfidence,
        Self::MediumConfidence,
        Self::LowConfidence,
        Self::NeedsReview,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HighConfidence => "HIGH_CONFIDENCE",
            Self::MediumConfidence => "MEDIUM_CONFIDENCE",
            Self::LowConfidence => "LOW_CONFIDENCE",
            Self::NeedsReview => "NEEDS_REVIEW",
        }
    }
}

impl fmt::Display for FitmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving one part number's groups.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    /// The winning signature.
    pub signature: FitmentSignature,
    /// 0-100.
    pub confidence_score: u8,
    pub status: FitmentStatus,
    /// Dominant weight divided by total weight.
    pub dominant_share: f64,
    /// Members of the dominant group.
    pub listing_count: usize,
    /// Valid observations across all groups.
    pub total_listings: usize,
    pub dominant_weight: f64,
    pub total_weight: f64,
    /// Second-ranked signature, if any.
    pub runner_up: Option<FitmentSignature>,
    /// Runner-up weight divided by dominant weight.
    pub runner_up_ratio: Option<f64>,
    /// Runner-up is within the tie tolerance of the dominant group.
    pub near_tie: bool,
}

impl Resolution {
    /// True when the result must be escalated to the conflict classifier:
    /// a near tie, or a dominant share that does not clear the threshold.
    ///
    /// A share exactly at the threshold counts as contested.
    #[must_use]
    pub fn is_contested(&self, dominance_threshold: f64) -> bool {
        self.runner_up.is_some() && (self.near_tie || self.dominant_share <= dominance_threshold)
    }
}

/// Result of `resolve`: either a resolution or a structured skip.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolveOutcome {
    Resolved(Resolution),
    InsufficientData {
        observed: usize,
        required: usize,
    },
}

impl ResolveOutcome {
    #[must_use]
    pub fn resolution(&self) -> Option<&Resolution> {
        match self {
            Self::Resolved(r) => Some(r),
            Self::InsufficientData { .. } => None,
        }
    }
}

// Weights are compared at 1e-9 resolution so that sums differing only by
// float rounding still tie and fall through to signature order.
fn weight_key(w: f64) -> f64 {
    (w * 1e9).round()
}

/// Orders groups by weight (descending), breaking ties by signature (ascending).
#[must_use]
pub fn rank_groups(groups: &[ObservationGroup]) -> Vec<&ObservationGroup> {
    let mut ranked: Vec<&ObservationGroup> = groups.iter().collect();
    ranked.sort_by(|a, b| compare_groups(a, b));
    ranked
}

fn compare_groups(a: &ObservationGroup, b: &ObservationGroup) -> Ordering {
    weight_key(b.weight)
        .total_cmp(&weight_key(a.weight))
        .then_with(|| a.signature.cmp(&b.signature))
}

/// Resolves the dominant signature for a set of groups.
///
/// Returns `InsufficientData` when fewer than `config.min_listings` valid
/// observations are present.
#[must_use]
pub fn resolve(groups: &[ObservationGroup], config: &ConsensusConfig) -> ResolveOutcome {
    let total_listings: usize = groups.iter().map(ObservationGroup::member_count).sum();
    if total_listings == 0 || total_listings < config.min_listings {
        return ResolveOutcome::InsufficientData {
            observed: total_listings,
            required: config.min_listings,
        };
    }

    let ranked = rank_groups(groups);
    let dominant = ranked[0];
    let runner = ranked.get(1).copied();

    let total_weight: f64 = groups.iter().map(|g| g.weight).sum();

    // Degenerate all-zero weights fall back to member counts.
    #[allow(clippy::cast_precision_loss)]
    let (dominant_share, runner_up_ratio) = if total_weight > 0.0 && dominant.weight > 0.0 {
        (
            dominant.weight / total_weight,
            runner.map(|r| r.weight / dominant.weight),
        )
    } else {
        (
            dominant.member_count() as f64 / total_listings as f64,
            runner.map(|r| r.member_count() as f64 / dominant.member_count() as f64),
        )
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mut confidence_score = (dominant_share * 100.0).round().clamp(0.0, 100.0) as u8;
    if dominant.member_count() == 1 && runner.is_some() {
        confidence_score = confidence_score.min(config.single_observation_cap);
    }

    let near_tie = runner_up_ratio.is_some_and(|ratio| ratio >= config.tie_tolerance);

    let status = if near_tie {
        FitmentStatus::NeedsReview
    } else if confidence_score >= config.high_confidence_score {
        if dominant.member_count() >= config.high_confidence_min_members {
            FitmentStatus::HighConfidence
        } else {
            FitmentStatus::MediumConfidence
        }
    } else if confidence_score >= config.medium_confidence_score {
        FitmentStatus::MediumConfidence
    } else {
        FitmentStatus::LowConfidence
    };

    ResolveOutcome::Resolved(Resolution {
        signature: dominant.signature.clone(),
        confidence_score,
        status,
        dominant_share,
        listing_count: dominant.member_count(),
        total_listings,
        dominant_weight: dominant.weight,
        total_weight,
        runner_up: runner.map(|r| r.signature.clone()),
        runner_up_ratio,
        near_tie,
    })
}

/// BLAKE3 digest over the part number, group membership, member weights and
/// skipped observations. Unchanged evidence yields an unchanged digest.
#[must_use]
pub fn evidence_digest(grouping: &Grouping) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(grouping.part_number.as_bytes());
    for group in &grouping.groups {
        hasher.update(b"\x1fgroup\x1f");
        hasher.update(group.signature.key().as_bytes());
        for member in &group.members {
            hasher.update(member.observation.id.as_uuid().as_bytes());
            hasher.update(&member.weight.to_bits().to_le_bytes());
        }
    }
    hasher.update(b"\x1fskipped\x1f");
    for skipped in &grouping.skipped {
        hasher.update(skipped.id.as_uuid().as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// The trusted fitment record for a part number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusFitment {
    pub part_number: String,
    pub signature: FitmentSignature,
    pub confidence_score: u8,
    pub status: FitmentStatus,
    /// Members of the winning group.
    pub supporting_listings: usize,
    /// Aggregate weight of the winning group.
    pub total_weight: f64,
    pub evidence_digest: String,
    pub last_updated: DateTime<Utc>,
}

impl ConsensusFitment {
    #[must_use]
    pub fn from_resolution(
        part_number: impl Into<String>,
        resolution: &Resolution,
        evidence_digest: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            part_number: part_number.into(),
            signature: resolution.signature.clone(),
            confidence_score: resolution.confidence_score,
            status: resolution.status,
            supporting_listings: resolution.listing_count,
            total_weight: resolution.dominant_weight,
            evidence_digest,
            last_updated: now,
        }
    }

    /// True when both records describe the same outcome from the same evidence,
    /// ignoring `last_updated`.
    #[must_use]
    pub fn same_outcome(&self, other: &Self) -> bool {
        self.part_number == other.part_number
            && self.signature == other.signature
            && self.confidence_score == other.confidence_score
            && self.status == other.status
            && self.supporting_listings == other.supporting_listings
            && self.evidence_digest == other.evidence_digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::group_observations;
    use crate::observation::Observation;
    use crate::weight::TieredQualityModel;

    fn grouping(rows: &[(usize, i32, &str, &str, &str)]) -> Grouping {
        let mut obs = Vec::new();
        for &(count, year, make, model, trim) in rows {
            for _ in 0..count {
                obs.push(
                    Observation::builder()
                        .part_number("P")
                        .vehicle(year, make, model)
                        .trim(trim)
                        .build()
                        .unwrap(),
                );
            }
        }
        group_observations("P", obs, &TieredQualityModel::default())
    }

    fn resolved(g: &Grouping) -> Resolution {
        match resolve(&g.groups, &ConsensusConfig::default()) {
            ResolveOutcome::Resolved(r) => r,
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[test]
    fn unanimous_is_high_confidence() {
        let r = resolved(&grouping(&[(6, 2005, "Chevrolet", "Malibu", "LS")]));
        assert_eq!(r.confidence_score, 100);
        assert_eq!(r.status, FitmentStatus::HighConfidence);
        assert!((r.dominant_share - 1.0).abs() < 1e-12);
        assert!(!r.is_contested(0.6));
    }

    #[test]
    fn unanimous_pair_is_medium() {
        let r = resolved(&grouping(&[(2, 2005, "Chevrolet", "Malibu", "LS")]));
        assert_eq!(r.confidence_score, 100);
        assert_eq!(r.status, FitmentStatus::MediumConfidence);
    }

    #[test]
    fn insufficient_data_below_minimum() {
        let g = grouping(&[(1, 2005, "Chevrolet", "Malibu", "LS")]);
        let outcome = resolve(&g.groups, &ConsensusConfig::default());
        assert_eq!(
            outcome,
            ResolveOutcome::InsufficientData {
                observed: 1,
                required: 2
            }
        );
        assert!(resolve(&[], &ConsensusConfig::default()).resolution().is_none());
    }

    #[test]
    fn equal_weight_tie_breaks_lexicographically() {
        let r = resolved(&grouping(&[
            (2, 2007, "Toyota", "Corolla", "S"),
            (2, 2007, "Honda", "Civic", "LX"),
        ]));
        assert_eq!(r.signature.make, "honda");
        assert!(r.near_tie);
        assert_eq!(r.status, FitmentStatus::NeedsReview);
        assert_eq!(r.confidence_score, 50);
    }

    #[test]
    fn near_tie_overrides_high_arithmetic() {
        let mut cfg = ConsensusConfig::default();
        cfg.high_confidence_score = 50;
        let g = grouping(&[(4, 2010, "Ford", "F-150", "XLT"), (3, 2010, "Ford", "F-150", "STX")]);
        let ResolveOutcome::Resolved(r) = resolve(&g.groups, &cfg) else {
            panic!("expected resolution");
        };
        assert!(r.confidence_score >= 50);
        assert_eq!(r.status, FitmentStatus::NeedsReview);
    }

    #[test]
    fn single_member_winner_is_capped() {
        let strong = Observation::builder()
            .part_number("P")
            .vehicle(2010, "Ford", "F-150")
            .seller_feedback_count(10_000)
            .seller_is_business(true)
            .seller_is_verified(true)
            .has_oem_reference(true)
            .has_detailed_description(true)
            .build()
            .unwrap();
        let weak = Observation::builder()
            .part_number("P")
            .vehicle(2011, "Ford", "F-150")
            .build()
            .unwrap();
        let g = group_observations("P", vec![strong, weak], &TieredQualityModel::default());
        let r = resolved(&g);
        // 5.5 / 6.5 would score 85 without the cap.
        assert_eq!(r.confidence_score, 60);
        assert_eq!(r.listing_count, 1);
        assert_eq!(r.status, FitmentStatus::MediumConfidence);
    }

    #[test]
    fn low_share_is_low_confidence() {
        let r = resolved(&grouping(&[
            (2, 2010, "Ford", "F-150", "A"),
            (2, 2010, "Ford", "F-150", "B"),
            (2, 2010, "Ford", "F-150", "C"),
            (1, 2010, "Ford", "F-150", "D"),
        ]));
        // Three-way tie at 2/7 is also a near tie.
        assert_eq!(r.status, FitmentStatus::NeedsReview);
        assert!(r.confidence_score < 50);

        let r = resolved(&grouping(&[
            (3, 2010, "Ford", "F-150", "A"),
            (2, 2010, "Ford", "F-150", "B"),
            (2, 2010, "Ford", "F-150", "C"),
        ]));
        assert!(!r.near_tie);
        assert_eq!(r.confidence_score, 43);
        assert_eq!(r.status, FitmentStatus::LowConfidence);
    }

    #[test]
    fn score_always_within_bounds() {
        let cases: [&[(usize, i32, &str, &str, &str)]; 4] = [
            &[(1, 2000, "A", "B", "C"), (1, 2001, "A", "B", "C")],
            &[(10, 2000, "A", "B", "C")],
            &[(5, 2000, "A", "B", "C"), (1, 2001, "A", "B", "C"), (1, 2002, "A", "B", "C")],
            &[(3, 2000, "A", "B", "C"), (3, 2000, "X", "Y", "Z")],
        ];
        for rows in cases {
            let r = resolved(&grouping(rows));
            assert!(r.confidence_score <= 100);
            assert!(r.dominant_share > 0.0 && r.dominant_share <= 1.0);
        }
    }

    #[test]
    fn digest_is_stable_and_sensitive() {
        let g = grouping(&[(3, 2008, "Acura", "TL", "Base")]);
        assert_eq!(evidence_digest(&g), evidence_digest(&g.clone()));

        let other = grouping(&[(3, 2008, "Acura", "TL", "Base")]);
        // Fresh observation ids change the evidence.
        assert_ne!(evidence_digest(&g), evidence_digest(&other));
    }

    #[test]
    fn same_outcome_ignores_timestamp() {
        let g = grouping(&[(3, 2008, "Acura", "TL", "Base")]);
        let r = resolved(&g);
        let digest = evidence_digest(&g);
        let a = ConsensusFitment::from_resolution("P", &r, digest.clone(), Utc::now());
        let b = ConsensusFitment::from_resolution(
            "P",
            &r,
            digest,
            Utc::now() + chrono::Duration::hours(1),
        );
        assert!(a.same_outcome(&b));
        assert_ne!(a, b);
    }
}

//! Conflict types and classification.
//!
//! Conflicts are explicit records, not hidden errors. When a part number's
//! observations do not converge on one signature, the classifier produces a
//! typed conflict that names the contending values so a reviewer (or the
//! auto-resolver) can act without re-querying.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConsensusConfig;
use crate::consensus::{rank_groups, Resolution};
use crate::error::ValidationError;
use crate::grouping::ObservationGroup;
use crate::observation::ObservationId;
use crate::review::Adjustment;
use crate::signature::FitmentSignature;

const CONFLICT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a7e_93b4_4d0e_8a51_c2d7_0e3f_9b18);

/// Unique identifier for a conflict.
///
/// Ids are derived from `(part_number, category)` so reprocessing the same
/// part number addresses the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Deterministic id for a part number's conflict of a given category.
    #[must_use]
    pub fn for_part(part_number: &str, category: ConflictCategory) -> Self {
        let name = format!("{part_number}|{}", category.as_str());
        Self(Uuid::new_v5(&CONFLICT_NAMESPACE, name.as_bytes()))
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the contending groups disagree about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCategory {
    /// Different makes.
    CrossManufacturer,
    /// Same make, different models.
    MultipleModels,
    /// Same make and model, different years.
    YearRange,
    /// Only trim or engine differ.
    TrimEngineVariation,
}

impl ConflictCategory {
    /// Stable identifier used in ids and storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CrossManufacturer => "cross_manufacturer",
            Self::MultipleModels => "multiple_models",
            Self::YearRange => "year_range",
            Self::TrimEngineVariation => "trim_engine_variation",
        }
    }

    /// Human-readable label used in descriptions.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::CrossManufacturer => "cross-manufacturer conflict",
            Self::MultipleModels => "multiple-models conflict",
            Self::YearRange => "year-range conflict",
            Self::TrimEngineVariation => "trim/engine variation conflict",
        }
    }

    /// Category of disagreement between two signatures.
    #[must_use]
    pub fn between(a: &FitmentSignature, b: &FitmentSignature) -> Self {
        if a.make != b.make {
            Self::CrossManufacturer
        } else if a.model != b.model {
            Self::MultipleModels
        } else if a.year != b.year {
            Self::YearRange
        } else {
            Self::TrimEngineVariation
        }
    }
}

impl fmt::Display for ConflictCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Review status of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    #[default]
    Pending,
    Resolved,
    Dismissed,
}

impl ConflictStatus {
    pub const ALL: [Self; 3] = [Self::Pending, Self::Resolved, Self::Dismissed];

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Dismissed)
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Resolved => write!(f, "RESOLVED"),
            Self::Dismissed => write!(f, "DISMISSED"),
        }
    }
}

/// A conflict produced by classification, before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictDraft {
    pub part_number: String,
    pub category: ConflictCategory,
    pub description: String,
    /// Contending signatures, dominant first.
    pub contenders: Vec<FitmentSignature>,
    /// Observations involved in the disagreement, sorted.
    pub listing_refs: Vec<ObservationId>,
}

impl ConflictDraft {
    #[must_use]
    pub fn id(&self) -> ConflictId {
        ConflictId::for_part(&self.part_number, self.category)
    }
}

/// A terminal decision on a conflict, by a reviewer or the auto-resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReview {
    pub status: ConflictStatus,
    pub resolved_by: String,
    pub notes: String,
    pub at: DateTime<Utc>,
    /// Recompute the consensus this way while the conflict stays resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<Adjustment>,
}

impl ConflictReview {
    /// Creates a review timestamped now.
    pub fn new(
        status: ConflictStatus,
        resolved_by: impl Into<String>,
        notes: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        if !status.is_terminal() {
            return Err(ValidationError::InvalidReviewStatus {
                status: status.to_string(),
            });
        }
        let resolved_by = resolved_by.into();
        if resolved_by.trim().is_empty() {
            return Err(ValidationError::EmptyReviewer);
        }
        Ok(Self {
            status,
            resolved_by,
            notes: notes.into(),
            at: Utc::now(),
            adjustment: None,
        })
    }

    #[must_use]
    pub fn with_adjustment(mut self, adjustment: Option<Adjustment>) -> Self {
        self.adjustment = adjustment;
        self
    }

    #[must_use]
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

/// A stored conflict awaiting or past review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictingFitment {
    pub id: ConflictId,
    pub part_number: String,
    pub category: ConflictCategory,
    pub description: String,
    pub listing_refs: Vec<ObservationId>,
    pub status: ConflictStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<Adjustment>,
}

impl ConflictingFitment {
    /// Creates a PENDING conflict from a draft.
    #[must_use]
    pub fn from_draft(draft: &ConflictDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: draft.id(),
            part_number: draft.part_number.clone(),
            category: draft.category,
            description: draft.description.clone(),
            listing_refs: draft.listing_refs.clone(),
            status: ConflictStatus::Pending,
            created_at: now,
            resolved_by: None,
            resolved_at: None,
            resolution_notes: None,
            adjustment: None,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }

    /// Refreshes evidence from a newer draft, keeping id and creation time.
    pub fn refresh(&mut self, draft: &ConflictDraft) {
        self.description = draft.description.clone();
        self.listing_refs = draft.listing_refs.clone();
    }

    /// Returns the conflict to PENDING with fresh evidence.
    pub fn reopen(&mut self, draft: &ConflictDraft) {
        self.refresh(draft);
        self.status = ConflictStatus::Pending;
        self.resolved_by = None;
        self.resolved_at = None;
        self.resolution_notes = None;
        self.adjustment = None;
    }

    /// Applies a terminal review.
    pub fn apply_review(&mut self, review: &ConflictReview) {
        self.status = review.status;
        self.resolved_by = Some(review.resolved_by.clone());
        self.resolved_at = Some(review.at);
        self.resolution_notes = Some(review.notes.clone());
        self.adjustment = if review.status == ConflictStatus::Resolved {
            review.adjustment.clone()
        } else {
            None
        };
    }

    /// Adjustment to apply when recomputing this part's consensus, if the
    /// conflict was resolved with one.
    #[must_use]
    pub fn active_adjustment(&self) -> Option<&Adjustment> {
        match self.status {
            ConflictStatus::Resolved => self.adjustment.as_ref(),
            _ => None,
        }
    }
}

fn distinct<T: Ord + Clone>(values: impl Iterator<Item = T>) -> Vec<T> {
    values.collect::<BTreeSet<T>>().into_iter().collect()
}

fn join<T: fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe(
    category: ConflictCategory,
    ranked: &[&ObservationGroup],
    resolution: &Resolution,
) -> String {
    let dominant = &ranked[0].signature;
    let detail = match category {
        ConflictCategory::CrossManufacturer => {
            format!("makes {}", join(&distinct(ranked.iter().map(|g| g.signature.make.clone()))))
        }
        ConflictCategory::MultipleModels => format!(
            "models {} ({})",
            join(&distinct(ranked.iter().map(|g| g.signature.model.clone()))),
            dominant.make
        ),
        ConflictCategory::YearRange => {
            let years = distinct(ranked.iter().map(|g| g.signature.year));
            let span = years.last().copied().unwrap_or(dominant.year)
                - years.first().copied().unwrap_or(dominant.year);
            format!(
                "years {} ({} {}, span {span})",
                join(&years),
                dominant.make,
                dominant.model
            )
        }
        ConflictCategory::TrimEngineVariation => format!(
            "trims {}; engines {} ({} {} {})",
            join(&distinct(ranked.iter().map(|g| g.signature.trim.clone()))),
            join(&distinct(ranked.iter().map(|g| g.signature.engine.clone()))),
            dominant.year,
            dominant.make,
            dominant.model
        ),
    };
    let contenders = ranked
        .iter()
        .map(|g| format!("{} [{} listings, weight {:.2}]", g.signature, g.member_count(), g.weight))
        .collect::<Vec<_>>()
        .join(" vs ");

    #[allow(clippy::cast_possible_truncation)]
    let share = (resolution.dominant_share * 100.0).round() as i64;
    format!("{category}: {detail}; contenders {contenders}; dominant share {share}%")
}

/// Decides whether a resolution must be escalated and characterizes the
/// disagreement.
///
/// Returns `None` for an unambiguous result: a single group, or a dominant
/// group that clears the dominance threshold without a near tie.
#[must_use]
pub fn classify(
    part_number: &str,
    groups: &[ObservationGroup],
    resolution: &Resolution,
    config: &ConsensusConfig,
) -> Option<ConflictDraft> {
    if groups.len() < 2 || !resolution.is_contested(config.dominance_threshold) {
        return None;
    }

    let ranked = rank_groups(groups);
    let category = ConflictCategory::between(&ranked[0].signature, &ranked[1].signature);
    let description = describe(category, &ranked, resolution);

    let mut listing_refs: Vec<ObservationId> =
        ranked.iter().flat_map(|g| g.observation_ids()).collect();
    listing_refs.sort();

    Some(ConflictDraft {
        part_number: part_number.to_string(),
        category,
        description,
        contenders: ranked.iter().map(|g| g.signature.clone()).collect(),
        listing_refs,
    })
}

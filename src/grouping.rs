//! Partitioning a part number's observations by fitment signature.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::observation::{MissingField, Observation, ObservationId};
use crate::signature::FitmentSignature;
use crate::weight::QualityModel;

/// An observation paired with its quality weight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightedObservation {
    pub observation: Observation,
    pub weight: f64,
}

/// Observations sharing one signature.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationGroup {
    pub signature: FitmentSignature,
    /// Members ordered by extraction time, then id.
    pub members: Vec<WeightedObservation>,
    /// Sum of member weights.
    pub weight: f64,
}

impl ObservationGroup {
    fn from_members(signature: FitmentSignature, mut members: Vec<WeightedObservation>) -> Self {
        members.sort_by(|a, b| {
            a.observation
                .extracted_at
                .cmp(&b.observation.extracted_at)
                .then_with(|| a.observation.id.cmp(&b.observation.id))
        });
        let weight = members.iter().map(|m| m.weight).sum();
        Self {
            signature,
            members,
            weight,
        }
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn observation_ids(&self) -> impl Iterator<Item = ObservationId> + '_ {
        self.members.iter().map(|m| m.observation.id)
    }
}

/// An observation excluded from grouping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedObservation {
    pub id: ObservationId,
    pub missing: MissingField,
}

/// Result of grouping one part number's observations.
///
/// Groups partition the valid observations: every valid observation belongs
/// to exactly one group. Groups are ordered by signature.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Grouping {
    pub part_number: String,
    pub groups: Vec<ObservationGroup>,
    pub skipped: Vec<SkippedObservation>,
}

impl Grouping {
    /// Number of observations placed in a group.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.groups.iter().map(ObservationGroup::member_count).sum()
    }

    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.groups.iter().map(|g| g.weight).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Regroups with trim generalized to `unspecified`, merging groups that
    /// differ only in trim.
    #[must_use]
    pub fn generalize_trim(&self) -> Self {
        self.regroup(|sig| Some(sig.without_trim()))
    }

    /// Drops the group with the given signature.
    #[must_use]
    pub fn without(&self, signature: &FitmentSignature) -> Self {
        self.regroup(|sig| (sig != signature).then(|| sig.clone()))
    }

    /// Keeps only observations whose id satisfies `keep`, dropping groups
    /// left empty.
    #[must_use]
    pub fn retain<F>(&self, mut keep: F) -> Self
    where
        F: FnMut(ObservationId) -> bool,
    {
        let groups = self
            .groups
            .iter()
            .filter_map(|group| {
                let members: Vec<WeightedObservation> = group
                    .members
                    .iter()
                    .filter(|m| keep(m.observation.id))
                    .cloned()
                    .collect();
                (!members.is_empty())
                    .then(|| ObservationGroup::from_members(group.signature.clone(), members))
            })
            .collect();
        Self {
            part_number: self.part_number.clone(),
            groups,
            skipped: self.skipped.clone(),
        }
    }

    fn regroup<F>(&self, mut key: F) -> Self
    where
        F: FnMut(&FitmentSignature) -> Option<FitmentSignature>,
    {
        let mut buckets: BTreeMap<FitmentSignature, Vec<WeightedObservation>> = BTreeMap::new();
        for group in &self.groups {
            if let Some(sig) = key(&group.signature) {
                buckets
                    .entry(sig)
                    .or_default()
                    .extend(group.members.iter().cloned());
            }
        }
        Self {
            part_number: self.part_number.clone(),
            groups: buckets
                .into_iter()
                .map(|(sig, members)| ObservationGroup::from_members(sig, members))
                .collect(),
            skipped: self.skipped.clone(),
        }
    }
}

/// Groups observations by normalized signature, weighting each with `model`.
///
/// Observations missing year, make or model are excluded and reported in
/// `Grouping::skipped`. This never fails.
pub fn group_observations(
    part_number: &str,
    observations: Vec<Observation>,
    model: &dyn QualityModel,
) -> Grouping {
    let mut buckets: BTreeMap<FitmentSignature, Vec<WeightedObservation>> = BTreeMap::new();
    let mut skipped = Vec::new();

    for observation in observations {
        match FitmentSignature::from_observation(&observation) {
            Ok(signature) => {
                let weight = model.weight(&observation);
                buckets.entry(signature).or_default().push(WeightedObservation {
                    observation,
                    weight,
                });
            }
            Err(missing) => {
                tracing::warn!(
                    part_number = %part_number,
                    observation_id = %observation.id,
                    missing = %missing,
                    "Malformed observation excluded from grouping."
                );
                skipped.push(SkippedObservation {
                    id: observation.id,
                    missing,
                });
            }
        }
    }

    Grouping {
        part_number: part_number.to_string(),
        groups: buckets
            .into_iter()
            .map(|(sig, members)| ObservationGroup::from_members(sig, members))
            .collect(),
        skipped,
    }
}

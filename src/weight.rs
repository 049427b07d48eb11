//! Observation quality weighting.
//!
//! A quality weight is a non-negative credibility score for one observation,
//! computed from seller and listing signals. Weighting is modeled separately
//! from consensus confidence: weights scale votes, they never change what an
//! observation claims.
//!
//! Every model must be monotonic non-decreasing in each signal: improving one
//! signal while holding the others fixed never lowers the weight.

use serde::{Deserialize, Serialize};

use crate::observation::{Observation, QualitySignals};

/// One feedback tier: sellers with at least `min_feedback` earn `bonus`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedbackTier {
    pub min_feedback: u32,
    pub bonus: f64,
}

/// Coefficients for `TieredQualityModel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    /// Weight every observation starts from.
    pub base: f64,
    /// Feedback tiers, ascending by `min_feedback`. The highest matched tier applies.
    pub feedback_tiers: Vec<FeedbackTier>,
    pub business_bonus: f64,
    pub verified_bonus: f64,
    pub oem_reference_bonus: f64,
    pub detailed_description_bonus: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            base: 1.0,
            feedback_tiers: vec![
                FeedbackTier {
                    min_feedback: 100,
                    bonus: 0.5,
                },
                FeedbackTier {
                    min_feedback: 1000,
                    bonus: 1.0,
                },
                FeedbackTier {
                    min_feedback: 5000,
                    bonus: 1.5,
                },
            ],
            business_bonus: 1.0,
            verified_bonus: 0.5,
            oem_reference_bonus: 1.0,
            detailed_description_bonus: 0.5,
        }
    }
}

impl QualityWeights {
    /// Checks the coefficients preserve monotonicity.
    ///
    /// Returns a description of the first problem found.
    pub fn check(&self) -> Result<(), String> {
        let scalars = [
            ("weights.base", self.base),
            ("weights.business_bonus", self.business_bonus),
            ("weights.verified_bonus", self.verified_bonus),
            ("weights.oem_reference_bonus", self.oem_reference_bonus),
            ("weights.detailed_description_bonus", self.detailed_description_bonus),
        ];
        for (name, value) in scalars {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{name} must be a finite number >= 0"));
            }
        }

        let mut prev: Option<&FeedbackTier> = None;
        for tier in &self.feedback_tiers {
            if !tier.bonus.is_finite() || tier.bonus < 0.0 {
                return Err("weights.feedback_tiers bonus must be a finite number >= 0".to_string());
            }
            if let Some(p) = prev {
                if tier.min_feedback <= p.min_feedback {
                    return Err(
                        "weights.feedback_tiers must be strictly ascending by min_feedback"
                            .to_string(),
                    );
                }
                if tier.bonus < p.bonus {
                    return Err(
                        "weights.feedback_tiers bonus must not decrease as feedback grows"
                            .to_string(),
                    );
                }
            }
            prev = Some(tier);
        }
        Ok(())
    }

    fn feedback_bonus(&self, feedback: u32) -> f64 {
        self.feedback_tiers
            .iter()
            .rev()
            .find(|t| feedback >= t.min_feedback)
            .map_or(0.0, |t| t.bonus)
    }
}

/// Quality weighting interface.
pub trait QualityModel: Send + Sync {
    /// Name of the model (for logs and dry-run output).
    fn name(&self) -> &str;

    /// Weight for a set of quality signals. Must be finite and `>= 0`.
    fn weigh(&self, signals: &QualitySignals) -> f64;

    /// Weight for an observation.
    fn weight(&self, observation: &Observation) -> f64 {
        self.weigh(&observation.quality)
    }
}

/// Additive tiered model: a base weight plus one bonus per satisfied signal.
#[derive(Debug, Clone, Default)]
pub struct TieredQualityModel {
    weights: QualityWeights,
}

impl TieredQualityModel {
    #[must_use]
    pub fn new(weights: QualityWeights) -> Self {
        Self { weights }
    }

    #[must_use]
    pub fn weights(&self) -> &QualityWeights {
        &self.weights
    }
}

impl QualityModel for TieredQualityModel {
    fn name(&self) -> &str {
        "tiered_quality"
    }

    fn weigh(&self, signals: &QualitySignals) -> f64 {
        let w = &self.weights;
        let mut weight = w.base + w.feedback_bonus(signals.seller_feedback_count);
        if signals.seller_is_business {
            weight += w.business_bonus;
        }
        if signals.seller_is_verified {
            weight += w.verified_bonus;
        }
        if signals.has_oem_reference {
            weight += w.oem_reference_bonus;
        }
        if signals.has_detailed_description {
            weight += w.detailed_description_bonus;
        }
        weight.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_signal_combinations() -> Vec<QualitySignals> {
        let feedbacks = [0, 99, 100, 999, 1000, 4999, 5000, 100_000];
        let mut out = Vec::new();
        for &fb in &feedbacks {
            for bits in 0..16u8 {
                out.push(QualitySignals {
                    seller_feedback_count: fb,
                    seller_is_business: bits & 1 != 0,
                    seller_is_verified: bits & 2 != 0,
                    has_oem_reference: bits & 4 != 0,
                    has_detailed_description: bits & 8 != 0,
                });
            }
        }
        out
    }

    #[test]
    fn base_weight_for_bare_listing() {
        let model = TieredQualityModel::default();
        assert_eq!(model.weigh(&QualitySignals::default()), 1.0);
    }

    #[test]
    fn max_weight_with_every_signal() {
        let model = TieredQualityModel::default();
        let best = QualitySignals {
            seller_feedback_count: 10_000,
            seller_is_business: true,
            seller_is_verified: true,
            has_oem_reference: true,
            has_detailed_description: true,
        };
        assert!((model.weigh(&best) - 5.5).abs() < 1e-9);
    }

    #[test]
    fn feedback_tiers_pick_highest_match() {
        let model = TieredQualityModel::default();
        let at = |fb| {
            model.weigh(&QualitySignals {
                seller_feedback_count: fb,
                ..QualitySignals::default()
            })
        };
        assert_eq!(at(99), 1.0);
        assert_eq!(at(100), 1.5);
        assert_eq!(at(1000), 2.0);
        assert_eq!(at(5000), 2.5);
    }

    #[test]
    fn monotonic_in_every_signal() {
        let model = TieredQualityModel::default();
        for s in all_signal_combinations() {
            let w = model.weigh(&s);
            assert!(w >= 0.0);

            let more_feedback = QualitySignals {
                seller_feedback_count: s.seller_feedback_count.saturating_add(1000),
                ..s
            };
            assert!(model.weigh(&more_feedback) >= w);

            for better in [
                QualitySignals { seller_is_business: true, ..s },
                QualitySignals { seller_is_verified: true, ..s },
                QualitySignals { has_oem_reference: true, ..s },
                QualitySignals { has_detailed_description: true, ..s },
            ] {
                assert!(model.weigh(&better) >= w, "{better:?} weighed below {s:?}");
            }
        }
    }

    #[test]
    fn check_rejects_non_monotonic_coefficients() {
        let mut weights = QualityWeights::default();
        weights.verified_bonus = -0.5;
        assert!(weights.check().is_err());

        let mut weights = QualityWeights::default();
        weights.feedback_tiers[2].bonus = 0.1;
        assert!(weights.check().is_err());

        let mut weights = QualityWeights::default();
        weights.feedback_tiers[1].min_feedback = 100;
        assert!(weights.check().is_err());

        assert!(QualityWeights::default().check().is_ok());
    }
}

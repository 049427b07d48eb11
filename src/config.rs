//! Engine configuration.
//!
//! Thresholds, minimum listing count and weight coefficients are passed to the
//! engine explicitly. Every field has a default, so an empty TOML file is a
//! valid configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::weight::QualityWeights;

/// Upper bound on batch worker threads.
pub const MAX_WORKERS: usize = 256;

/// Configuration for grouping, resolution, classification and batch runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Minimum valid observations a part number needs to be resolved.
    pub min_listings: usize,

    /// Minimum weight share the dominant group must exceed to avoid escalation.
    pub dominance_threshold: f64,

    /// A runner-up holding at least this fraction of the dominant weight is a near tie.
    pub tie_tolerance: f64,

    /// Score at or above which a well-supported winner is HIGH_CONFIDENCE.
    pub high_confidence_score: u8,

    /// Score at or above which a winner is at least MEDIUM_CONFIDENCE.
    pub medium_confidence_score: u8,

    /// Members the dominant group needs for HIGH_CONFIDENCE.
    pub high_confidence_min_members: usize,

    /// Score cap when the dominant group has a single member and rivals exist.
    pub single_observation_cap: u8,

    /// Worker threads for batch runs.
    pub workers: usize,

    pub weights: QualityWeights,

    pub review: ReviewConfig,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_listings: 2,
            dominance_threshold: 0.6,
            tie_tolerance: 0.7,
            high_confidence_score: 80,
            medium_confidence_score: 50,
            high_confidence_min_members: 3,
            single_observation_cap: 60,
            workers: 1,
            weights: QualityWeights::default(),
            review: ReviewConfig::default(),
        }
    }
}

/// Auto-resolution rule parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Largest year gap treated as adjacent-model-year noise.
    pub adjacent_year_span: i32,

    /// A listing weighing less than this fraction of the mean is an outlier.
    pub outlier_ratio: f64,

    /// Minimum listings before the outlier rule applies.
    pub outlier_min_listings: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            adjacent_year_span: 1,
            outlier_ratio: 0.5,
            outlier_min_listings: 3,
        }
    }
}

impl ConsensusConfig {
    /// Returns a copy with a different minimum listing count.
    #[must_use]
    pub fn with_min_listings(mut self, min_listings: usize) -> Self {
        self.min_listings = min_listings;
        self
    }

    /// Returns a copy with a different worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Validates thresholds and coefficients.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_listings == 0 {
            return Err(ConfigError::invalid("min_listings must be greater than zero"));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(ConfigError::invalid(format!(
                "workers must be in the range 1..={MAX_WORKERS}"
            )));
        }
        if !self.dominance_threshold.is_finite()
            || self.dominance_threshold <= 0.0
            || self.dominance_threshold > 1.0
        {
            return Err(ConfigError::invalid(
                "dominance_threshold must be in the range (0.0, 1.0]",
            ));
        }
        if !self.tie_tolerance.is_finite()
            || self.tie_tolerance <= 0.0
            || self.tie_tolerance > 1.0
        {
            return Err(ConfigError::invalid(
                "tie_tolerance must be in the range (0.0, 1.0]",
            ));
        }
        if self.high_confidence_score > 100 || self.single_observation_cap > 100 {
            return Err(ConfigError::invalid(
                "confidence scores must be in the range 0-100",
            ));
        }
        if self.medium_confidence_score > self.high_confidence_score {
            return Err(ConfigError::invalid(
                "medium_confidence_score must not exceed high_confidence_score",
            ));
        }
        if self.review.adjacent_year_span < 0 {
            return Err(ConfigError::invalid(
                "review.adjacent_year_span must be zero or greater",
            ));
        }
        if !self.review.outlier_ratio.is_finite()
            || !(0.0..=1.0).contains(&self.review.outlier_ratio)
        {
            return Err(ConfigError::invalid(
                "review.outlier_ratio must be in the range 0.0-1.0",
            ));
        }
        self.weights.check().map_err(ConfigError::invalid)
    }
}

/// Loads and validates a TOML configuration file.
pub fn load(path: &Path) -> Result<ConsensusConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: ConsensusConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

//! Normalized vehicle fitment signatures.
//!
//! A signature is the grouping key for observations: two observations claim
//! the same fitment iff their signatures are equal. Fields are trimmed,
//! internal whitespace is collapsed and text is lowercased. Missing trim or
//! engine becomes an explicit `unspecified` sentinel so that listings lacking
//! them still group together.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::observation::{MissingField, Observation};

/// Sentinel used for a missing trim or engine.
pub const UNSPECIFIED: &str = "unspecified";

/// Normalized (year, make, model, trim, engine) tuple.
///
/// Field order matters: the derived `Ord` is the lexicographic tuple order used
/// to break weight ties deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FitmentSignature {
    pub year: i32,
    pub make: String,
    pub model: String,
    pub trim: String,
    pub engine: String,
}

impl FitmentSignature {
    /// Builds a signature from raw field values.
    #[must_use]
    pub fn new(
        year: i32,
        make: &str,
        model: &str,
        trim: Option<&str>,
        engine: Option<&str>,
    ) -> Self {
        Self {
            year,
            make: normalize(make),
            model: normalize(model),
            trim: normalize_optional(trim),
            engine: normalize_optional(engine),
        }
    }

    /// Derives the signature of an observation.
    ///
    /// # Errors
    ///
    /// Returns the first missing vehicle field when the observation is malformed.
    pub fn from_observation(obs: &Observation) -> Result<Self, MissingField> {
        if let Some(missing) = obs.missing_field() {
            return Err(missing);
        }
        let (Some(year), Some(make), Some(model)) =
            (obs.year, obs.make.as_deref(), obs.model.as_deref())
        else {
            return Err(MissingField::Year);
        };
        Ok(Self::new(year, make, model, obs.trim.as_deref(), obs.engine.as_deref()))
    }

    /// Returns the same signature with trim generalized to `unspecified`.
    #[must_use]
    pub fn without_trim(&self) -> Self {
        Self {
            trim: UNSPECIFIED.to_string(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn has_trim(&self) -> bool {
        self.trim != UNSPECIFIED
    }

    #[must_use]
    pub fn has_engine(&self) -> bool {
        self.engine != UNSPECIFIED
    }

    /// Pipe-delimited key, e.g. `2010|ford|f-150|xlt|4.6l v8`.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.year, self.make, self.model, self.trim, self.engine
        )
    }
}

impl fmt::Display for FitmentSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.year, self.make, self.model)?;
        if self.has_trim() {
            write!(f, " {}", self.trim)?;
        }
        if self.has_engine() {
            write!(f, " {}", self.engine)?;
        }
        Ok(())
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn normalize_optional(s: Option<&str>) -> String {
    match s.map(normalize) {
        Some(v) if !v.is_empty() => v,
        _ => UNSPECIFIED.to_string(),
    }
}

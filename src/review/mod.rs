//! Conflict auto-resolution.
//!
//! An ordered list of named rules closes conflicts that are not genuine
//! ambiguities. The first matching rule decides; when none match the conflict
//! stays PENDING for a human reviewer.
//!
//! Rules are pure: evaluating the same conflict against the same listings
//! always yields the same decision.

mod resolver;
mod rules;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::signature::FitmentSignature;

pub use resolver::AutoResolver;
pub(crate) use resolver::{adjust, referenced_listings};
pub use rules::ReviewRule;

/// Reviewer name recorded on auto-resolved conflicts.
pub const AUTO_RESOLVER: &str = "auto-resolver";

/// What to do with a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoAction {
    Resolve,
    Dismiss,
    Manual,
}

impl fmt::Display for AutoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve => write!(f, "resolve"),
            Self::Dismiss => write!(f, "dismiss"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// How the consensus should be recomputed after a resolve decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Adjustment {
    /// Record the consensus at model level with trim unspecified.
    GeneralizeTrim,
    /// Recompute without the given low-credibility group.
    DiscardGroup { signature: FitmentSignature },
}

/// A tagged decision from one rule (or the manual fallback).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoDecision {
    /// Rule that matched; `None` for the manual fallback.
    pub rule: Option<ReviewRule>,
    pub action: AutoAction,
    pub notes: String,
    pub adjustment: Option<Adjustment>,
}

impl AutoDecision {
    pub(crate) fn manual(notes: impl Into<String>) -> Self {
        Self {
            rule: None,
            action: AutoAction::Manual,
            notes: notes.into(),
            adjustment: None,
        }
    }

    #[must_use]
    pub fn is_manual(&self) -> bool {
        self.action == AutoAction::Manual
    }
}

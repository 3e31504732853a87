use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Why an artifact was created. Governs retention eligibility.
#[derive(Hash, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Requested by a user. Never pruned by retention.
    Manual,

    /// Created by the scheduler. Counts toward and is pruned by retention.
    Scheduled,
}

impl ArtifactKind {
    /// The persisted representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }

    /// If artifacts of this kind are subject to the retention policy.
    pub fn is_retained_by_policy(&self) -> bool {
        matches!(self, Self::Scheduled)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" | "Manual" => Ok(Self::Manual),
            "scheduled" | "Scheduled" => Ok(Self::Scheduled),
            _ => Err(format!("invalid artifact kind '{s}'")),
        }
    }
}

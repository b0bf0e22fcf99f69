//! Evolution workflow records: contributions, rankings, votes, synthesis.

use crate::{AiId, ContributionId, NoteId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An idea submitted to an evolution. `avg_score`/`rank_count` are caches
/// recomputed whenever a ranking lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub id: ContributionId,
    pub evolution_id: NoteId,
    pub author: AiId,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approach: Option<String>,
    pub created: Timestamp,
    pub avg_score: f64,
    pub rank_count: i64,
}

/// One AI's score (0-10) for one contribution; upserted, last write wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub contribution_id: ContributionId,
    pub ranked_by: AiId,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created: Timestamp,
}

/// Ranked-preference vote. `change_count` tracks how many times the voter
/// has revised it (capped).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub evolution_id: NoteId,
    pub voter: AiId,
    pub preferred: Vec<ContributionId>,
    pub change_count: i64,
    pub updated: Timestamp,
}

/// Contribution selection strategy for synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStrategy {
    /// Score >= min_score, best five.
    Top,
    /// Everything, regardless of score.
    All,
    /// Score >= 9.0 only.
    Consensus,
}

impl SynthesisStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisStrategy::Top => "top",
            SynthesisStrategy::All => "all",
            SynthesisStrategy::Consensus => "consensus",
        }
    }
}

impl FromStr for SynthesisStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "top" => Ok(SynthesisStrategy::Top),
            "all" => Ok(SynthesisStrategy::All),
            "consensus" => Ok(SynthesisStrategy::Consensus),
            other => Err(format!("invalid synthesis strategy: {}", other)),
        }
    }
}

impl fmt::Display for SynthesisStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// History row recorded for each synthesis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRecord {
    pub id: i64,
    pub evolution_id: NoteId,
    pub strategy: SynthesisStrategy,
    pub output_path: String,
    pub contribution_count: i64,
    pub author: AiId,
    pub created: Timestamp,
    pub teambook: String,
}

/// A detected pairwise disagreement between contributions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionConflict {
    pub evolution_id: NoteId,
    pub contribution_a: ContributionId,
    pub contribution_b: ContributionId,
    /// The opposing keyword pair that triggered detection, e.g. "jwt/oauth".
    pub topic: String,
    pub detected: Timestamp,
}

/// Opposing keyword pairs checked by conflict detection.
pub const CONFLICT_KEYWORD_PAIRS: &[(&str, &str)] = &[
    ("async", "sync"),
    ("jwt", "oauth"),
    ("sql", "nosql"),
    ("monolith", "microservice"),
    ("rest", "graphql"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_roundtrip() {
        for s in [
            SynthesisStrategy::Top,
            SynthesisStrategy::All,
            SynthesisStrategy::Consensus,
        ] {
            assert_eq!(s.as_str().parse::<SynthesisStrategy>().unwrap(), s);
        }
        assert!("best".parse::<SynthesisStrategy>().is_err());
    }
}

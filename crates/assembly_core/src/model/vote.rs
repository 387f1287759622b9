//! Votes, options and weighted ballots.
//!
//! # Invariants
//! - Options keep their declared order (`position`).
//! - At most one ballot per (vote, unit); its weight is the unit coefficient
//!   at cast time and never re-derived.

use crate::model::holder::RightsHolder;
use crate::model::{AssemblyId, BallotId, OptionId, UnitId, VoteId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteStatus {
    Open,
    Closed,
}

impl VoteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteOption {
    pub uuid: OptionId,
    pub vote: VoteId,
    pub position: u32,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub uuid: VoteId,
    pub assembly: AssemblyId,
    pub title: String,
    pub status: VoteStatus,
    /// Sorted by `position`.
    pub options: Vec<VoteOption>,
    pub created_at: i64,
}

impl Vote {
    /// Creates an open vote with options in the given order.
    pub fn new(
        assembly: AssemblyId,
        title: impl Into<String>,
        labels: &[String],
        created_at: i64,
    ) -> Self {
        let uuid = Uuid::new_v4();
        let options = labels
            .iter()
            .enumerate()
            .map(|(position, label)| VoteOption {
                uuid: Uuid::new_v4(),
                vote: uuid,
                position: position as u32,
                label: label.trim().to_string(),
            })
            .collect();
        Self {
            uuid,
            assembly,
            title: title.into().trim().to_string(),
            status: VoteStatus::Open,
            options,
            created_at,
        }
    }

    pub fn option(&self, option: OptionId) -> Option<&VoteOption> {
        self.options.iter().find(|candidate| candidate.uuid == option)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub uuid: BallotId,
    pub vote: VoteId,
    pub option: OptionId,
    pub unit: UnitId,
    pub weight: f64,
    /// Holder of the unit's rights when the ballot was cast.
    pub cast_by: RightsHolder,
    pub cast_at: i64,
}

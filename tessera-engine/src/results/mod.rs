// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-attempt results and their aggregation upwards through the item graph.
//!
//! Scores and validation are recorded at leaf items through graded answers. Every parent item
//! result is a pure function of the best linked results of its children and is kept up to date
//! by the propagation loop in `propagation`.
pub mod aggregation;
pub mod grading;
pub mod propagation;
mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessera_store::{DecodeError, Timestamp};

use crate::groups::GroupId;
use crate::items::ItemId;

pub use store::ResultStore;

pub type AttemptId = i64;

pub type AnswerId = i64;

/// Manual correction of a computed score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScoreEditRule {
    /// Replace the computed score with the edit value.
    Set,

    /// Add the edit value to the computed score.
    Diff,
}

impl ScoreEditRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreEditRule::Set => "set",
            ScoreEditRule::Diff => "diff",
        }
    }
}

impl FromStr for ScoreEditRule {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(ScoreEditRule::Set),
            "diff" => Ok(ScoreEditRule::Diff),
            _ => Err(DecodeError::FromStr),
        }
    }
}

/// Where a result stands in the propagation loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropagationState {
    #[default]
    Done,

    /// Changed, parents need to be marked for recomputation.
    ToBePropagated,

    /// Needs to be recomputed from its children (or its answers for leaves).
    ToBeRecomputed,
}

impl PropagationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropagationState::Done => "done",
            PropagationState::ToBePropagated => "to_be_propagated",
            PropagationState::ToBeRecomputed => "to_be_recomputed",
        }
    }

    pub fn is_pending(&self) -> bool {
        *self != PropagationState::Done
    }
}

impl fmt::Display for PropagationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PropagationState {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "done" => Ok(PropagationState::Done),
            "to_be_propagated" => Ok(PropagationState::ToBePropagated),
            "to_be_recomputed" => Ok(PropagationState::ToBeRecomputed),
            _ => Err(DecodeError::FromStr),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub participant: GroupId,
    pub id: AttemptId,

    /// Item the attempt was started for, `None` for the participant's default attempt.
    pub root_item: Option<ItemId>,
    pub parent_attempt: Option<AttemptId>,
    pub created_at: Timestamp,
}

/// Score and validation state of a participant's attempt on an item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub participant: GroupId,
    pub attempt: AttemptId,
    pub item: ItemId,
    pub score_computed: f64,
    pub score_obtained_at: Option<Timestamp>,
    pub validated_at: Option<Timestamp>,
    pub score_edit_rule: Option<ScoreEditRule>,
    pub score_edit_value: Option<f64>,
    pub tasks_tried: i64,
    pub latest_activity_at: Timestamp,
    pub propagation_state: PropagationState,
}

impl ItemResult {
    pub fn is_validated(&self) -> bool {
        self.validated_at.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub id: AnswerId,
    pub participant: GroupId,
    pub attempt: AttemptId,
    pub item: ItemId,
    pub author: GroupId,
    pub answer: String,
    pub submitted_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Grading {
    pub answer: AnswerId,
    pub score: f64,
    pub graded_at: Timestamp,
}

/// A score for a participant's work on an item as reported by a grader.
///
/// Without an answer id an empty answer authored by the participant is recorded first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradingEvent {
    pub participant: GroupId,
    pub attempt: AttemptId,
    pub item: ItemId,
    pub answer: Option<AnswerId>,
    pub score: f64,
    pub graded_at: Timestamp,
}

impl GradingEvent {
    pub fn new(participant: GroupId, attempt: AttemptId, item: ItemId, score: f64) -> Self {
        Self {
            participant,
            attempt,
            item,
            answer: None,
            score,
            graded_at: Timestamp::default(),
        }
    }

    pub fn answer(mut self, answer: AnswerId) -> Self {
        self.answer = Some(answer);
        self
    }

    pub fn graded_at(mut self, graded_at: Timestamp) -> Self {
        self.graded_at = graded_at;
        self
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scores of leaf items derived from graded answers.
use tessera_store::Timestamp;

use crate::results::aggregation::{Aggregate, MAX_SCORE};
use crate::results::{Answer, Grading};

/// Outcome of recording a grading event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GradeStatus {
    Recorded,

    /// The answer was graded before, the event was ignored.
    Replayed,
}

/// Aggregates the answers of a leaf result into its base values.
///
/// The score is the best grading, obtained at the earliest submission which achieved it. The
/// result is validated at the earliest submission with a full score. Since gradings are never
/// replaced, a new grading can only raise the score.
pub fn aggregate_answers(
    answers: &[(Answer, Option<Grading>)],
    previous_activity: Timestamp,
) -> Aggregate {
    let graded: Vec<(&Answer, &Grading)> = answers
        .iter()
        .filter_map(|(answer, grading)| grading.as_ref().map(|grading| (answer, grading)))
        .collect();

    let score = graded
        .iter()
        .map(|(_, grading)| grading.score)
        .fold(0.0, f64::max);

    let score_obtained_at = graded
        .iter()
        .filter(|(_, grading)| grading.score == score)
        .map(|(answer, _)| answer.submitted_at)
        .min();

    let validated_at = graded
        .iter()
        .filter(|(_, grading)| grading.score >= MAX_SCORE)
        .map(|(answer, _)| answer.submitted_at)
        .min();

    let latest_activity_at = answers
        .iter()
        .map(|(answer, _)| answer.submitted_at)
        .fold(previous_activity, Timestamp::max);

    Aggregate {
        score,
        score_obtained_at,
        validated_at,
        tasks_tried: i64::from(!answers.is_empty()),
        latest_activity_at,
    }
}

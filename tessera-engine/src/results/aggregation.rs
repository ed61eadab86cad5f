// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pure aggregation of child results into the result of their parent item.
use std::cmp::Ordering;

use tessera_store::Timestamp;

use crate::items::{Category, ValidationType};
use crate::results::{ItemResult, ScoreEditRule};

pub const MAX_SCORE: f64 = 100.0;

/// Computed values of a result.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregate {
    pub score: f64,
    pub score_obtained_at: Option<Timestamp>,
    pub validated_at: Option<Timestamp>,
    pub tasks_tried: i64,
    pub latest_activity_at: Timestamp,
}

impl Aggregate {
    pub fn of(result: &ItemResult) -> Self {
        Self {
            score: result.score_computed,
            score_obtained_at: result.score_obtained_at,
            validated_at: result.validated_at,
            tasks_tried: result.tasks_tried,
            latest_activity_at: result.latest_activity_at,
        }
    }
}

/// A child item of the aggregated parent together with its best linked result.
#[derive(Clone, Debug)]
pub struct ChildInput {
    pub category: Category,
    pub no_score: bool,
    pub score_weight: i64,
    pub best: Option<ItemResult>,
}

/// Orders results from best to worst: higher score, then validated, then the score obtained
/// earlier, then the lower attempt id.
pub fn compare_results(a: &ItemResult, b: &ItemResult) -> Ordering {
    b.score_computed
        .total_cmp(&a.score_computed)
        .then_with(|| b.is_validated().cmp(&a.is_validated()))
        .then_with(|| match (a.score_obtained_at, b.score_obtained_at) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.attempt.cmp(&b.attempt))
}

pub fn best_result(results: impl IntoIterator<Item = ItemResult>) -> Option<ItemResult> {
    results.into_iter().min_by(compare_results)
}

/// Applies a score edit rule to a base score, clamping the outcome to `[0, 100]`.
pub fn apply_edit_rule(base: f64, rule: Option<ScoreEditRule>, value: Option<f64>) -> f64 {
    let score = match (rule, value) {
        (Some(ScoreEditRule::Set), Some(value)) => value,
        (Some(ScoreEditRule::Diff), Some(value)) => base + value,
        _ => base,
    };
    score.clamp(0.0, MAX_SCORE)
}

/// Aggregates the children of a parent item into its base values.
///
/// The score is the weighted average over all scored children where children without a result
/// count as 0. Validation follows the parent's validation type. `previous_activity` is the
/// parent's own latest activity which is never moved backwards.
pub fn aggregate_children(
    validation_type: ValidationType,
    children: &[ChildInput],
    previous_activity: Timestamp,
) -> Aggregate {
    let scored: Vec<&ChildInput> = children.iter().filter(|child| !child.no_score).collect();

    let total_weight: i64 = scored.iter().map(|child| child.score_weight).sum();
    let weighted_sum: f64 = scored
        .iter()
        .filter_map(|child| {
            child
                .best
                .as_ref()
                .map(|best| best.score_computed * child.score_weight as f64)
        })
        .sum();
    let score = if total_weight > 0 {
        weighted_sum / total_weight as f64
    } else {
        0.0
    };

    let chosen = scored.iter().filter_map(|child| child.best.as_ref());
    let score_obtained_at = chosen.clone().filter_map(|best| best.score_obtained_at).max();
    let tasks_tried = chosen.clone().map(|best| best.tasks_tried).sum();
    let latest_activity_at = chosen
        .map(|best| best.latest_activity_at)
        .fold(previous_activity, Timestamp::max);

    let validated_at = match validation_type {
        ValidationType::Default => scored
            .iter()
            .filter_map(|child| child.best.as_ref().and_then(|best| best.validated_at))
            .max(),
        ValidationType::Categories => {
            let required: Vec<Option<Timestamp>> = scored
                .iter()
                .filter(|child| child.category == Category::Validation)
                .map(|child| child.best.as_ref().and_then(|best| best.validated_at))
                .collect();
            if required.is_empty() || required.iter().any(Option::is_none) {
                None
            } else {
                required.into_iter().flatten().max()
            }
        }
    };

    Aggregate {
        score,
        score_obtained_at,
        validated_at,
        tasks_tried,
        latest_activity_at,
    }
}

#[cfg(test)]
mod tests {
    use tessera_store::Timestamp;

    use super::{ChildInput, aggregate_children, apply_edit_rule, best_result};
    use crate::items::{Category, ValidationType};
    use crate::results::{ItemResult, PropagationState, ScoreEditRule};

    fn at(millis: i64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn result(attempt: i64, score: f64) -> ItemResult {
        ItemResult {
            participant: 1,
            attempt,
            item: 10,
            score_computed: score,
            score_obtained_at: None,
            validated_at: None,
            score_edit_rule: None,
            score_edit_value: None,
            tasks_tried: 1,
            latest_activity_at: at(0),
            propagation_state: PropagationState::Done,
        }
    }

    fn child(category: Category, best: Option<ItemResult>) -> ChildInput {
        ChildInput {
            category,
            no_score: false,
            score_weight: 1,
            best,
        }
    }

    #[test]
    fn best_result_ordering() {
        let low = result(0, 40.0);
        let high = result(1, 80.0);
        assert_eq!(best_result([low.clone(), high.clone()]).unwrap().attempt, 1);

        let mut validated = result(2, 80.0);
        validated.validated_at = Some(at(50));
        assert_eq!(
            best_result([high.clone(), validated.clone()]).unwrap().attempt,
            2
        );

        let mut early = result(3, 80.0);
        early.score_obtained_at = Some(at(10));
        let mut late = result(4, 80.0);
        late.score_obtained_at = Some(at(20));
        assert_eq!(best_result([late, early]).unwrap().attempt, 3);

        // Everything equal, lowest attempt wins.
        assert_eq!(best_result([result(7, 5.0), result(6, 5.0)]).unwrap().attempt, 6);
        assert!(best_result([]).is_none());
    }

    #[test]
    fn edit_rules() {
        assert_eq!(apply_edit_rule(40.0, None, None), 40.0);
        assert_eq!(apply_edit_rule(40.0, Some(ScoreEditRule::Set), Some(70.0)), 70.0);
        assert_eq!(apply_edit_rule(40.0, Some(ScoreEditRule::Diff), Some(-50.0)), 0.0);
        assert_eq!(apply_edit_rule(90.0, Some(ScoreEditRule::Diff), Some(20.0)), 100.0);
    }

    #[test]
    fn weighted_average_counts_missing_results_as_zero() {
        let mut heavy = child(Category::Normal, Some(result(0, 60.0)));
        heavy.score_weight = 2;
        let missing = child(Category::Normal, None);
        let mut ignored = child(Category::Normal, Some(result(0, 100.0)));
        ignored.no_score = true;

        let aggregate =
            aggregate_children(ValidationType::Default, &[heavy, missing, ignored], at(0));
        assert_eq!(aggregate.score, 40.0);
    }

    #[test]
    fn default_validation_takes_latest_date() {
        let mut first = result(0, 100.0);
        first.validated_at = Some(at(10));
        let mut second = result(0, 100.0);
        second.validated_at = Some(at(30));

        let aggregate = aggregate_children(
            ValidationType::Default,
            &[
                child(Category::Normal, Some(first)),
                child(Category::Normal, Some(second)),
                child(Category::Normal, None),
            ],
            at(0),
        );
        assert_eq!(aggregate.validated_at, Some(at(30)));
    }

    #[test]
    fn categories_validation_needs_every_validation_child() {
        let mut c1 = result(0, 100.0);
        c1.validated_at = Some(at(10));
        let mut c2 = result(0, 100.0);
        c2.validated_at = Some(at(20));
        let unvalidated = result(0, 30.0);

        let both = [
            child(Category::Validation, Some(c1.clone())),
            child(Category::Validation, Some(c2)),
            child(Category::Normal, Some(unvalidated.clone())),
        ];
        assert_eq!(
            aggregate_children(ValidationType::Categories, &both, at(0)).validated_at,
            Some(at(20))
        );

        let one_missing = [
            child(Category::Validation, Some(c1)),
            child(Category::Validation, Some(unvalidated)),
        ];
        assert_eq!(
            aggregate_children(ValidationType::Categories, &one_missing, at(0)).validated_at,
            None
        );

        let none_qualifying = [child(Category::Normal, Some(result(0, 100.0)))];
        assert_eq!(
            aggregate_children(ValidationType::Categories, &none_qualifying, at(0)).validated_at,
            None
        );
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bottom-up propagation of results through the item graph.
//!
//! Results flagged `to_be_propagated` mark the linked results of their parent items
//! `to_be_recomputed` and settle. Missing parent results are created inside the subtree the
//! attempt was started for, when the participant can see the parent or one of its ancestors. A
//! result flagged `to_be_recomputed` is recomputed once none of its linked children is pending
//! anymore and is flagged `to_be_propagated` again if its values changed. The loop ends when every
//! result is `done`.
use std::collections::VecDeque;

use tessera_store::Timestamp;
use tracing::{debug, trace};

use crate::error::EngineError;
use crate::groups::GroupId;
use crate::items::{ItemId, ItemStore};
use crate::permissions::PermissionStore;
use crate::results::aggregation::{
    Aggregate, ChildInput, aggregate_children, apply_edit_rule, best_result,
};
use crate::results::grading::aggregate_answers;
use crate::results::{AttemptId, ItemResult, PropagationState, ResultStore};

type ResultKey = (GroupId, AttemptId, ItemId);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultPropagation {
    pub propagated: usize,
    pub recomputed: usize,

    /// Parent results created on the way.
    pub created: usize,
}

/// Runs the propagation loop until no result is pending anymore.
pub async fn propagate_results<S>(
    store: &S,
    now: Timestamp,
) -> Result<ResultPropagation, EngineError>
where
    S: ResultStore + ItemStore + PermissionStore,
{
    let mut outcome = ResultPropagation::default();

    loop {
        let propagating = store
            .results_in_state(PropagationState::ToBePropagated)
            .await?;
        let mut queue: VecDeque<ResultKey> = propagating
            .iter()
            .map(|result| (result.participant, result.attempt, result.item))
            .collect();
        while let Some(key) = queue.pop_front() {
            outcome.propagated += 1;
            propagate(store, key, now, &mut queue, &mut outcome).await?;
        }

        let recomputing = store
            .results_in_state(PropagationState::ToBeRecomputed)
            .await?;
        if propagating.is_empty() && recomputing.is_empty() {
            break;
        }

        let pending = recomputing.len();
        let mut progressed = !propagating.is_empty();
        for result in recomputing {
            if has_pending_children(store, &result).await? {
                continue;
            }
            recompute(store, &result).await?;
            outcome.recomputed += 1;
            progressed = true;
        }

        if !progressed {
            return Err(EngineError::PropagationStalled { pending });
        }
    }

    debug!(
        propagated = outcome.propagated,
        recomputed = outcome.recomputed,
        created = outcome.created,
        "result propagation finished"
    );

    Ok(outcome)
}

/// Settles a result and marks the linked results of its parent items.
async fn propagate<S>(
    store: &S,
    (participant, attempt, item): ResultKey,
    now: Timestamp,
    queue: &mut VecDeque<ResultKey>,
    outcome: &mut ResultPropagation,
) -> Result<(), EngineError>
where
    S: ResultStore + ItemStore + PermissionStore,
{
    let Some(result) = store.result(participant, attempt, item).await? else {
        return Ok(());
    };
    // Results queued from below keep waiting for their recomputation.
    if result.propagation_state == PropagationState::ToBePropagated {
        store
            .set_propagation_state(participant, attempt, item, PropagationState::Done)
            .await?;
    }

    // Results of an attempt started for this item feed the parent attempt.
    let target = match store.attempt(participant, attempt).await? {
        Some(started) if started.root_item == Some(item) => started.parent_attempt,
        _ => Some(attempt),
    };
    let Some(target) = target else {
        return Ok(());
    };
    let scope = match store.attempt(participant, target).await? {
        Some(started) => started.root_item,
        None => None,
    };

    for (_, parent) in store.parent_edges(item).await? {
        match store.result(participant, target, parent.id).await? {
            Some(existing) => {
                if existing.propagation_state == PropagationState::ToBePropagated {
                    // Pass its own change on before it gets recomputed.
                    queue.push_back((participant, target, parent.id));
                }
                store
                    .set_propagation_state(
                        participant,
                        target,
                        parent.id,
                        PropagationState::ToBeRecomputed,
                    )
                    .await?;
            }
            None => {
                if parent.requires_explicit_entry {
                    continue;
                }
                if let Some(root) = scope {
                    if !store.is_within(root, parent.id).await? {
                        continue;
                    }
                }
                if !store
                    .visible_in_item_ancestry(participant, parent.id, now)
                    .await?
                {
                    continue;
                }
                trace!(participant, attempt = target, item = parent.id, "creating parent result");
                store
                    .insert_result(
                        participant,
                        target,
                        parent.id,
                        PropagationState::ToBeRecomputed,
                        now,
                    )
                    .await?;
                outcome.created += 1;
            }
        }
    }

    Ok(())
}

async fn has_pending_children<S>(store: &S, result: &ItemResult) -> Result<bool, EngineError>
where
    S: ResultStore + ItemStore,
{
    for (_, child) in store.child_edges(result.item).await? {
        let linked = store
            .linked_child_results(result.participant, result.attempt, child.id)
            .await?;
        if linked
            .iter()
            .any(|linked| linked.propagation_state.is_pending())
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Recomputes a result from its children, or from its answers if the item has no children.
async fn recompute<S>(store: &S, result: &ItemResult) -> Result<(), EngineError>
where
    S: ResultStore + ItemStore,
{
    let (participant, attempt, item) = (result.participant, result.attempt, result.item);

    let base = match store.item(item).await? {
        Some(parent) => {
            let children = store.child_edges(item).await?;
            if children.is_empty() {
                let answers = store.graded_answers(participant, attempt, item).await?;
                aggregate_answers(&answers, result.latest_activity_at)
            } else {
                let mut inputs = Vec::with_capacity(children.len());
                for (edge, child) in children {
                    let linked = store
                        .linked_child_results(participant, attempt, child.id)
                        .await?;
                    inputs.push(ChildInput {
                        category: edge.category,
                        no_score: child.no_score,
                        score_weight: edge.score_weight,
                        best: best_result(linked),
                    });
                }
                aggregate_children(parent.validation_type, &inputs, result.latest_activity_at)
            }
        }
        None => Aggregate::of(result),
    };

    let aggregate = Aggregate {
        score: apply_edit_rule(base.score, result.score_edit_rule, result.score_edit_value),
        ..base
    };
    let changed = aggregate != Aggregate::of(result);
    let state = if changed {
        PropagationState::ToBePropagated
    } else {
        PropagationState::Done
    };

    trace!(participant, attempt, item, changed, score = aggregate.score, "recomputed result");
    store
        .write_aggregate(participant, attempt, item, &aggregate, state)
        .await?;

    Ok(())
}

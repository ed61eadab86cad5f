// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixpoint computation of generated permissions.
//!
//! Dirty (group, item) pairs are recomputed from their sources in a "self" phase. Pairs whose
//! tiers changed mark the same group on every child item in a "children" phase, both phases
//! alternate until nothing is marked anymore.
use std::collections::BTreeSet;

use tessera_store::{StoreError, Timestamp};
use tracing::{debug, trace};

use crate::groups::closure::ClosureChange;
use crate::groups::{GroupId, GroupStore};
use crate::items::{ItemId, ItemStore};
use crate::permissions::{CanView, PermissionLevels, PermissionStore, Tiers};
use crate::worklist::{PropagationMarker, Worklist};

pub type PermissionPair = (GroupId, ItemId);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropagationOutcome {
    /// Number of pair recomputations, a pair can be recomputed more than once.
    pub recomputed: usize,

    /// Pairs whose tiers were rewritten or deleted.
    pub changed: BTreeSet<PermissionPair>,

    /// Pairs whose cached view level went from `none` to `info` or higher.
    pub newly_visible: BTreeSet<PermissionPair>,
}

impl PropagationOutcome {
    pub fn merge(&mut self, other: PropagationOutcome) {
        self.recomputed += other.recomputed;
        self.changed.extend(other.changed);
        self.newly_visible.extend(other.newly_visible);
    }
}

/// Drains the worklist, recomputing every marked pair until a fixpoint is reached.
pub async fn propagate_permissions<S>(
    store: &S,
    mut worklist: Worklist<PermissionPair>,
    now: Timestamp,
) -> Result<PropagationOutcome, StoreError>
where
    S: PermissionStore + ItemStore,
{
    let mut outcome = PropagationOutcome::default();
    let mut passes = 0;

    while !worklist.is_empty() {
        passes += 1;

        for (group, item) in worklist.take(PropagationMarker::SelfOnly) {
            outcome.recomputed += 1;
            if recompute_pair(store, group, item, now, &mut outcome).await? {
                worklist.mark((group, item), PropagationMarker::Children);
            }
        }

        for (group, item) in worklist.take(PropagationMarker::Children) {
            let Some(parent) = store.item(item).await? else {
                continue;
            };
            if parent.custom_chapter {
                continue;
            }
            for (_, child) in store.child_edges(item).await? {
                worklist.mark((group, child.id), PropagationMarker::SelfOnly);
            }
        }
    }

    debug!(
        passes,
        recomputed = outcome.recomputed,
        changed = outcome.changed.len(),
        "permission propagation finished"
    );

    Ok(outcome)
}

/// Recomputes the tiers of a single pair, returning `true` if they changed.
async fn recompute_pair<S>(
    store: &S,
    group: GroupId,
    item: ItemId,
    now: Timestamp,
    outcome: &mut PropagationOutcome,
) -> Result<bool, StoreError>
where
    S: PermissionStore + ItemStore,
{
    let mut tiers = Tiers::new();

    for grant in store.effective_grants(group, item, now).await? {
        tiers.add_grant(&grant);
    }

    for (edge, parent) in store.parent_edges(item).await? {
        if parent.custom_chapter {
            continue;
        }
        let inherited = store
            .generated_tiers(group, parent.id)
            .await?
            .inherit(edge.partial_access_propagation);
        tiers.merge(inherited);
    }

    let tiers = tiers.normalize();
    let previous = store.generated(group, item).await?;
    let was_visible = previous
        .as_ref()
        .is_some_and(|generated| generated.levels.can_view >= CanView::Info);
    let is_visible = PermissionLevels::at(&tiers, now).can_view >= CanView::Info;
    if is_visible && !was_visible {
        outcome.newly_visible.insert((group, item));
    }

    let stored = store.generated_tiers(group, item).await?;
    if previous.is_some() && stored == tiers {
        // Cached levels might still lag behind tier activations or revocations.
        store.refresh_cached(group, item, now).await?;
        return Ok(false);
    }
    if previous.is_none() && tiers.is_empty() {
        return Ok(false);
    }

    trace!(group, item, "generated permission changed");
    store.write_generated(group, item, &tiers, now).await?;
    outcome.changed.insert((group, item));

    Ok(true)
}

/// Pairs affected by a grant of `item` to `group`: the item at the group and all its
/// descendants.
pub async fn pairs_for_grant<S: GroupStore>(
    store: &S,
    group: GroupId,
    item: ItemId,
) -> Result<Vec<PermissionPair>, StoreError> {
    Ok(store
        .descendants(group)
        .await?
        .into_iter()
        .map(|entry| (entry.child, item))
        .collect())
}

/// Pairs affected by a change of the closure: every generated pair of a changed group and every
/// item granted to one of its ancestors.
pub async fn pairs_for_closure_change<S: PermissionStore>(
    store: &S,
    change: &ClosureChange,
    now: Timestamp,
) -> Result<BTreeSet<PermissionPair>, StoreError> {
    if change.is_empty() {
        return Ok(BTreeSet::new());
    }

    let groups: Vec<GroupId> = change.changed_groups.iter().copied().collect();
    let mut pairs: BTreeSet<PermissionPair> =
        store.generated_pairs(&groups).await?.into_iter().collect();

    for group in groups {
        for item in store.granted_items(group, now).await? {
            pairs.insert((group, item));
        }
    }

    Ok(pairs)
}

/// Pairs affected by adding or removing the item edge `parent -> child`: the child at every
/// group which has a generated permission on either end.
pub async fn pairs_for_item_edge<S: PermissionStore>(
    store: &S,
    parent: ItemId,
    child: ItemId,
) -> Result<BTreeSet<PermissionPair>, StoreError> {
    Ok(store
        .groups_with_generated(&[parent, child])
        .await?
        .into_iter()
        .map(|group| (group, child))
        .collect())
}

/// Brings generated permissions up to date with the passage of time.
///
/// Pairs with a tier which became active in the meantime only get their cached levels raised.
/// Pairs of groups which lost an ancestor through expiry are fully recomputed.
pub async fn sweep_permissions<S>(
    store: &S,
    now: Timestamp,
) -> Result<PropagationOutcome, StoreError>
where
    S: PermissionStore + ItemStore,
{
    // Collected first as refreshing moves `computed_at` forward.
    let expired = store.pairs_with_expired_ancestry(now).await?;
    let activated = store.pairs_with_pending_activation(now).await?;

    let mut outcome = PropagationOutcome::default();

    for (group, item) in &activated {
        let before = store.generated(*group, *item).await?;
        store.refresh_cached(*group, *item, now).await?;
        let after = store.generated(*group, *item).await?;

        let was_visible = before.is_some_and(|generated| generated.levels.can_view >= CanView::Info);
        let is_visible = after.is_some_and(|generated| generated.levels.can_view >= CanView::Info);
        if is_visible && !was_visible {
            outcome.newly_visible.insert((*group, *item));
        }
    }

    debug!(
        activated = activated.len(),
        expired = expired.len(),
        "sweeping generated permissions"
    );

    let mut worklist = Worklist::new();
    worklist.extend(expired, PropagationMarker::SelfOnly);
    outcome.merge(propagate_permissions(store, worklist, now).await?);

    Ok(outcome)
}

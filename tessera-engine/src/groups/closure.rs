// SPDX-License-Identifier: MIT OR Apache-2.0

//! Maintains the materialized transitive closure of active group edges.
use std::collections::{BTreeMap, BTreeSet};

use petgraph::graphmap::DiGraphMap;
use tessera_store::{StoreError, Timestamp};
use tracing::{debug, info, trace};

use crate::error::EngineError;
use crate::graph::reachable_with_expiry;
use crate::groups::{AncestorEntry, EdgeAttributes, GroupId, GroupStore, RelationType};

/// Outcome of a closure recomputation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClosureChange {
    /// Groups whose set of ancestor rows (or their expiry) changed.
    pub changed_groups: BTreeSet<GroupId>,
    pub upserted: usize,
    pub deleted: usize,
}

impl ClosureChange {
    pub fn is_empty(&self) -> bool {
        self.changed_groups.is_empty()
    }

    pub fn merge(&mut self, other: ClosureChange) {
        self.changed_groups.extend(other.changed_groups);
        self.upserted += other.upserted;
        self.deleted += other.deleted;
    }
}

/// Rebuilds the ancestor rows from the current set of active edges.
///
/// A row `(a, d)` exists iff a path of `active` edges leads from `a` to `d`. Its expiry is the
/// latest expiry across all such paths where a path expires with its earliest-expiring edge.
/// Expired edges are still walked so that expired memberships keep blocking cycles. Only the
/// difference to the stored rows is written.
pub async fn recompute_closure<S: GroupStore>(store: &S) -> Result<ClosureChange, StoreError> {
    let groups = store.group_ids().await?;
    let edges = store.active_edges().await?;

    let mut graph: DiGraphMap<GroupId, Option<Timestamp>> = DiGraphMap::new();
    for group in &groups {
        graph.add_node(*group);
    }
    for (parent, child, expires_at) in edges {
        graph.add_edge(parent, child, expires_at);
    }

    let mut desired: BTreeMap<(GroupId, GroupId), Option<Timestamp>> = BTreeMap::new();
    for group in &groups {
        for (descendant, expires_at) in reachable_with_expiry(&graph, *group) {
            desired.insert((*group, descendant), expires_at);
        }
    }

    let stored: BTreeMap<(GroupId, GroupId), AncestorEntry> = store
        .ancestor_entries()
        .await?
        .into_iter()
        .map(|entry| ((entry.ancestor, entry.child), entry))
        .collect();

    let mut change = ClosureChange::default();

    let mut upserts = Vec::new();
    for ((ancestor, child), expires_at) in &desired {
        let entry = AncestorEntry {
            ancestor: *ancestor,
            child: *child,
            is_self: ancestor == child,
            expires_at: *expires_at,
        };
        if stored.get(&(*ancestor, *child)) != Some(&entry) {
            trace!(ancestor, child, ?expires_at, "closure row changed");
            change.changed_groups.insert(*child);
            upserts.push(entry);
        }
    }

    let deletes: Vec<(GroupId, GroupId)> = stored
        .keys()
        .filter(|key| !desired.contains_key(key))
        .copied()
        .collect();
    for (ancestor, child) in &deletes {
        trace!(ancestor, child, "closure row removed");
        change.changed_groups.insert(*child);
    }

    store.upsert_ancestors(&upserts).await?;
    store.delete_ancestors(&deletes).await?;

    change.upserted = upserts.len();
    change.deleted = deletes.len();

    debug!(
        upserted = change.upserted,
        deleted = change.deleted,
        changed_groups = change.changed_groups.len(),
        "recomputed group closure"
    );

    Ok(change)
}

/// Fails with `RelationCycle` if adding `parent -> child` would close a cycle.
///
/// Expired closure rows count as well.
pub async fn ensure_no_cycle<S: GroupStore>(
    store: &S,
    parent: GroupId,
    child: GroupId,
) -> Result<(), EngineError> {
    if parent == child || store.is_ancestor(child, parent).await? {
        return Err(EngineError::RelationCycle { parent, child });
    }
    Ok(())
}

/// Creates (or re-activates) the edge `parent -> child` and recomputes the closure.
pub async fn create_relation<S: GroupStore>(
    store: &S,
    parent: GroupId,
    child: GroupId,
    attributes: &EdgeAttributes,
    now: Timestamp,
) -> Result<ClosureChange, EngineError> {
    ensure_no_cycle(store, parent, child).await?;

    // A re-created relation starts over, it doesn't inherit a past expiry.
    store.delete_edge(parent, child).await?;
    store
        .upsert_edge(parent, child, RelationType::Active, false, attributes, now)
        .await?;

    Ok(recompute_closure(store).await?)
}

/// Creates active edges without cycle checks, recomputing the closure once at the end.
///
/// Only meant for freshly created groups which can't be part of any cycle yet.
pub async fn create_relations_without_checking<S: GroupStore>(
    store: &S,
    pairs: &[(GroupId, GroupId)],
    now: Timestamp,
) -> Result<ClosureChange, EngineError> {
    let attributes = EdgeAttributes::default();
    for (parent, child) in pairs {
        store
            .upsert_edge(*parent, *child, RelationType::Active, false, &attributes, now)
            .await?;
    }

    Ok(recompute_closure(store).await?)
}

/// Outcome of removing an edge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelationDeletion {
    pub removed: bool,
    pub deleted_groups: Vec<GroupId>,
    pub closure: ClosureChange,
}

/// Removes the edge `parent -> child`.
///
/// If `child` has no other active parent it becomes an orphan. Without `allow_orphan_deletion`
/// this fails with `GroupBecomesOrphan`, otherwise `child` and every descendant whose remaining
/// ancestors all lie inside the detached subtree are deleted as well. User-self and admin-root
/// groups are never deleted this way.
pub async fn delete_relation<S: GroupStore>(
    store: &S,
    parent: GroupId,
    child: GroupId,
    allow_orphan_deletion: bool,
) -> Result<RelationDeletion, EngineError> {
    let Some(edge) = store.edge(parent, child).await? else {
        return Ok(RelationDeletion::default());
    };

    let other_parents = store
        .active_parents(child)
        .await?
        .into_iter()
        .filter(|other| *other != parent)
        .count();
    let becomes_orphan = edge.is_active() && other_parents == 0;

    if becomes_orphan && !allow_orphan_deletion {
        return Err(EngineError::GroupBecomesOrphan(child));
    }

    store.delete_edge(parent, child).await?;
    let mut closure = recompute_closure(store).await?;

    let mut deleted_groups = Vec::new();
    if becomes_orphan {
        deleted_groups = orphaned_subtree(store, child).await?;
        if !deleted_groups.is_empty() {
            info!(
                root = child,
                count = deleted_groups.len(),
                "deleting orphaned groups"
            );
            store.delete_groups(&deleted_groups).await?;
            closure.merge(recompute_closure(store).await?);
        }
    }

    // Deleted groups don't need any further processing.
    for group in &deleted_groups {
        closure.changed_groups.remove(group);
    }

    Ok(RelationDeletion {
        removed: true,
        deleted_groups,
        closure,
    })
}

/// Descendants of `root` (including itself) which only have ancestors inside the subtree.
async fn orphaned_subtree<S: GroupStore>(
    store: &S,
    root: GroupId,
) -> Result<Vec<GroupId>, StoreError> {
    let mut candidates = BTreeSet::new();
    for entry in store.descendants(root).await? {
        let Some(group) = store.group(entry.child).await? else {
            continue;
        };
        if !group.group_type.is_cascade_protected() {
            candidates.insert(group.id);
        }
    }

    let mut orphans = Vec::new();
    for candidate in &candidates {
        let ancestors = store.ancestors(*candidate).await?;
        if ancestors
            .iter()
            .all(|entry| candidates.contains(&entry.ancestor))
        {
            orphans.push(*candidate);
        }
    }

    Ok(orphans)
}

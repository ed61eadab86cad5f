// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entry point for all mutations and lookups.
//!
//! Every mutating call holds the advisory lock of the subsystem it changes, runs in a single
//! transaction and drives all triggered propagation to completion before committing: a closure
//! change re-marks generated permissions, newly visible items re-mark results. Nothing is
//! committed if any step fails.
use std::sync::Arc;

use tessera_store::{
    IdGenerator, RandomIds, SqliteStore, Timestamp, retry_on_duplicate_key,
};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, GROUPS_GROUPS_LOCK, PERMISSIONS_LOCK, RESULTS_LOCK};
use crate::error::EngineError;
use crate::groups::closure::{self, ClosureChange, RelationDeletion};
use crate::groups::membership::{RelationRequest, TransitionOutcome, apply_transition};
use crate::groups::{AncestorEntry, EdgeAttributes, Group, GroupEdge, GroupId, GroupStore};
use crate::items::{Item, ItemEdge, ItemId, ItemStore, ensure_no_item_cycle};
use crate::permissions::propagation::{
    PropagationOutcome, pairs_for_closure_change, pairs_for_grant, pairs_for_item_edge,
    propagate_permissions, sweep_permissions,
};
use crate::permissions::{
    GeneratedPermission, PermissionGrant, PermissionLevels, PermissionRegistry, PermissionStore,
    Tiers,
};
use crate::results::aggregation::best_result;
use crate::results::grading::GradeStatus;
use crate::results::propagation::{ResultPropagation, propagate_results};
use crate::results::{
    Answer, AnswerId, Attempt, AttemptId, Grading, GradingEvent, ItemResult, PropagationState,
    ResultStore, ScoreEditRule,
};
use crate::worklist::{PropagationMarker, Worklist};

#[derive(Clone, Debug)]
pub struct Engine {
    store: SqliteStore,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    registry: &'static PermissionRegistry,
}

impl Engine {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIds),
            registry: PermissionRegistry::shared(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn registry(&self) -> &'static PermissionRegistry {
        self.registry
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Runs `f` holding the advisory lock `lock` inside a single transaction.
    async fn write<F, R>(&self, lock: &str, f: F) -> Result<R, EngineError>
    where
        F: AsyncFnOnce(Timestamp) -> Result<R, EngineError>,
    {
        let now = self.clock.now();
        self.store
            .with_named_lock(lock, self.config.lock_timeout, async move || {
                self.store.in_transaction(async move || f(now).await).await
            })
            .await
    }

    /// Runs `f` inside a single transaction without taking any advisory lock.
    async fn read<F, R>(&self, f: F) -> Result<R, EngineError>
    where
        F: AsyncFnOnce(Timestamp) -> Result<R, EngineError>,
    {
        let now = self.clock.now();
        self.store.in_transaction(async move || f(now).await).await
    }

    async fn require_group(&self, id: GroupId) -> Result<Group, EngineError> {
        self.store
            .group(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("group {id}")))
    }

    async fn require_item(&self, id: ItemId) -> Result<Item, EngineError> {
        self.store
            .item(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("item {id}")))
    }

    /// Re-marks the generated permissions of groups whose ancestors changed.
    async fn after_closure_change(
        &self,
        change: &ClosureChange,
        now: Timestamp,
    ) -> Result<PropagationOutcome, EngineError> {
        let pairs = pairs_for_closure_change(&self.store, change, now).await?;
        let mut worklist = Worklist::new();
        worklist.extend(pairs, PropagationMarker::SelfOnly);
        self.settle_permissions(worklist, now).await
    }

    /// Propagates the marked permissions and settles results of items which became visible.
    async fn settle_permissions(
        &self,
        worklist: Worklist<(GroupId, ItemId)>,
        now: Timestamp,
    ) -> Result<PropagationOutcome, EngineError> {
        let outcome = propagate_permissions(&self.store, worklist, now).await?;
        self.settle_newly_visible(&outcome, now).await?;
        Ok(outcome)
    }

    async fn settle_newly_visible(
        &self,
        outcome: &PropagationOutcome,
        now: Timestamp,
    ) -> Result<ResultPropagation, EngineError> {
        let mut marked = 0;
        for (group, item) in &outcome.newly_visible {
            marked += self
                .store
                .mark_child_results_below(*group, *item, now)
                .await?;
        }
        if marked > 0 {
            debug!(marked, "results re-marked below newly visible items");
        }
        propagate_results(&self.store, now).await
    }

    // Groups

    pub async fn create_group(&self, group: &Group) -> Result<(), EngineError> {
        self.write(GROUPS_GROUPS_LOCK, async |_| {
            self.store.insert_group(group).await?;
            Ok(())
        })
        .await
    }

    /// Makes `child` an active member of `parent`.
    pub async fn create_relation(
        &self,
        parent: GroupId,
        child: GroupId,
        attributes: &EdgeAttributes,
    ) -> Result<ClosureChange, EngineError> {
        self.write(GROUPS_GROUPS_LOCK, async |now| {
            self.require_group(parent).await?;
            self.require_group(child).await?;
            let change = closure::create_relation(&self.store, parent, child, attributes, now).await?;
            self.after_closure_change(&change, now).await?;
            Ok(change)
        })
        .await
    }

    /// Creates active edges for freshly created groups without any cycle checks.
    pub async fn create_relations_without_checking(
        &self,
        pairs: &[(GroupId, GroupId)],
    ) -> Result<ClosureChange, EngineError> {
        self.write(GROUPS_GROUPS_LOCK, async |now| {
            let change = closure::create_relations_without_checking(&self.store, pairs, now).await?;
            self.after_closure_change(&change, now).await?;
            Ok(change)
        })
        .await
    }

    pub async fn delete_relation(
        &self,
        parent: GroupId,
        child: GroupId,
        allow_orphan_deletion: bool,
    ) -> Result<RelationDeletion, EngineError> {
        self.write(GROUPS_GROUPS_LOCK, async |now| {
            let deletion =
                closure::delete_relation(&self.store, parent, child, allow_orphan_deletion).await?;
            self.after_closure_change(&deletion.closure, now).await?;
            Ok(deletion)
        })
        .await
    }

    /// Applies a membership action to a batch of child groups.
    pub async fn transition(
        &self,
        request: &RelationRequest,
    ) -> Result<TransitionOutcome, EngineError> {
        self.write(GROUPS_GROUPS_LOCK, async |now| {
            let outcome = apply_transition(&self.store, request, now).await?;
            self.after_closure_change(&outcome.closure, now).await?;
            Ok(outcome)
        })
        .await
    }

    /// Lets members of `manager` manage `group` and all of its descendants.
    pub async fn set_group_manager(
        &self,
        group: GroupId,
        manager: GroupId,
    ) -> Result<bool, EngineError> {
        self.write(GROUPS_GROUPS_LOCK, async |_| {
            self.require_group(group).await?;
            self.require_group(manager).await?;
            Ok(self.store.add_manager(group, manager).await?)
        })
        .await
    }

    // Items

    pub async fn create_item(&self, item: &Item) -> Result<(), EngineError> {
        self.write(PERMISSIONS_LOCK, async |_| {
            self.store.insert_item(item).await?;
            Ok(())
        })
        .await
    }

    /// Adds (or updates) an item edge, rejecting edges which would close a cycle.
    pub async fn create_item_edge(&self, edge: &ItemEdge) -> Result<(), EngineError> {
        self.write(PERMISSIONS_LOCK, async |now| {
            self.require_item(edge.parent).await?;
            self.require_item(edge.child).await?;
            let edges = self.store.item_edges().await?;
            if edge.parent == edge.child {
                return Err(EngineError::ItemRelationCycle {
                    parent: edge.parent,
                    child: edge.child,
                });
            }
            ensure_no_item_cycle(&edges, edge.parent, edge.child)?;

            self.store.upsert_item_edge(edge).await?;

            let mut worklist = Worklist::new();
            worklist.extend(
                pairs_for_item_edge(&self.store, edge.parent, edge.child).await?,
                PropagationMarker::SelfOnly,
            );
            self.store
                .mark_item_results(edge.child, PropagationState::ToBePropagated)
                .await?;
            self.settle_permissions(worklist, now).await?;
            Ok(())
        })
        .await
    }

    pub async fn delete_item_edge(
        &self,
        parent: ItemId,
        child: ItemId,
    ) -> Result<bool, EngineError> {
        self.write(PERMISSIONS_LOCK, async |now| {
            let pairs = pairs_for_item_edge(&self.store, parent, child).await?;
            if !self.store.delete_item_edge(parent, child).await? {
                return Ok(false);
            }

            let mut worklist = Worklist::new();
            worklist.extend(pairs, PropagationMarker::SelfOnly);
            self.store
                .mark_item_results(parent, PropagationState::ToBeRecomputed)
                .await?;
            self.settle_permissions(worklist, now).await?;
            Ok(true)
        })
        .await
    }

    // Permissions

    /// Stores the grant and propagates it to every descendant group and item.
    pub async fn grant_permission(
        &self,
        grant: &PermissionGrant,
    ) -> Result<PropagationOutcome, EngineError> {
        self.write(PERMISSIONS_LOCK, async |now| {
            self.require_group(grant.group).await?;
            self.require_group(grant.giver).await?;
            self.require_item(grant.item).await?;

            self.store.upsert_grant(grant).await?;

            let mut worklist = Worklist::new();
            worklist.extend(
                pairs_for_grant(&self.store, grant.group, grant.item).await?,
                PropagationMarker::SelfOnly,
            );
            self.settle_permissions(worklist, now).await
        })
        .await
    }

    pub async fn revoke_permission(
        &self,
        group: GroupId,
        item: ItemId,
        giver: GroupId,
    ) -> Result<PropagationOutcome, EngineError> {
        self.write(PERMISSIONS_LOCK, async |now| {
            if !self.store.delete_grant(group, item, giver).await? {
                return Ok(PropagationOutcome::default());
            }

            let mut worklist = Worklist::new();
            worklist.extend(
                pairs_for_grant(&self.store, group, item).await?,
                PropagationMarker::SelfOnly,
            );
            self.settle_permissions(worklist, now).await
        })
        .await
    }

    /// Applies tier activations and ancestor expiries which happened since the last computation.
    pub async fn sweep_permissions(&self) -> Result<PropagationOutcome, EngineError> {
        self.write(PERMISSIONS_LOCK, async |now| {
            let outcome = sweep_permissions(&self.store, now).await?;
            self.settle_newly_visible(&outcome, now).await?;
            Ok(outcome)
        })
        .await
    }

    // Results

    /// Starts a new attempt of `participant`, optionally for `root_item` below `parent_attempt`.
    pub async fn create_attempt(
        &self,
        participant: GroupId,
        root_item: Option<ItemId>,
        parent_attempt: Option<AttemptId>,
    ) -> Result<AttemptId, EngineError> {
        self.write(RESULTS_LOCK, async |now| {
            self.require_group(participant).await?;
            if let Some(item) = root_item {
                self.require_item(item).await?;
            }

            let id = retry_on_duplicate_key(&self.config.retry, async |_| {
                let id = self.store.next_attempt_id(participant).await?;
                self.store
                    .insert_attempt(&Attempt {
                        participant,
                        id,
                        root_item,
                        parent_attempt,
                        created_at: now,
                    })
                    .await?;
                Ok(id)
            })
            .await?;

            if let Some(item) = root_item {
                self.store
                    .insert_result(participant, id, item, PropagationState::ToBePropagated, now)
                    .await?;
                propagate_results(&self.store, now).await?;
            }

            Ok(id)
        })
        .await
    }

    /// Marks the result of a leaf for recomputation, creating it if needed.
    async fn touch_leaf(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let created = self
            .store
            .insert_result(participant, attempt, item, PropagationState::ToBeRecomputed, now)
            .await?;
        if !created {
            self.store
                .set_propagation_state(participant, attempt, item, PropagationState::ToBeRecomputed)
                .await?;
        }
        Ok(())
    }

    async fn insert_answer(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        author: GroupId,
        payload: &str,
        now: Timestamp,
    ) -> Result<AnswerId, EngineError> {
        if self.store.attempt(participant, attempt).await?.is_none() {
            return Err(EngineError::NotFound(format!(
                "attempt {attempt} of participant {participant}"
            )));
        }
        self.require_item(item).await?;
        self.touch_leaf(participant, attempt, item, now).await?;

        let id = retry_on_duplicate_key(&self.config.retry, async |_| {
            let answer = Answer {
                id: self.ids.next_id(),
                participant,
                attempt,
                item,
                author,
                answer: payload.to_string(),
                submitted_at: now,
            };
            self.store.insert_answer(&answer).await?;
            Ok(answer.id)
        })
        .await?;

        Ok(id)
    }

    /// Records an answer of `participant` on `item`.
    pub async fn submit_answer(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        author: GroupId,
        payload: &str,
    ) -> Result<AnswerId, EngineError> {
        self.write(RESULTS_LOCK, async |now| {
            let id = self
                .insert_answer(participant, attempt, item, author, payload, now)
                .await?;
            propagate_results(&self.store, now).await?;
            Ok(id)
        })
        .await
    }

    /// Records the grading of an answer and propagates the resulting score.
    ///
    /// Every answer is graded at most once, replayed events are ignored.
    pub async fn record_grade(&self, event: &GradingEvent) -> Result<GradeStatus, EngineError> {
        self.write(RESULTS_LOCK, async |now| {
            let answer_id = match event.answer {
                Some(id) => {
                    let answer = self
                        .store
                        .answer(id)
                        .await?
                        .ok_or_else(|| EngineError::NotFound(format!("answer {id}")))?;
                    if (answer.participant, answer.attempt, answer.item)
                        != (event.participant, event.attempt, event.item)
                    {
                        return Err(EngineError::UnprocessableEntity(format!(
                            "answer {id} belongs to another result"
                        )));
                    }
                    id
                }
                None => {
                    self.insert_answer(
                        event.participant,
                        event.attempt,
                        event.item,
                        event.participant,
                        "",
                        now,
                    )
                    .await?
                }
            };

            if let Some(existing) = self.store.grading(answer_id).await? {
                if existing.score != event.score {
                    warn!(
                        answer = answer_id,
                        recorded = existing.score,
                        replayed = event.score,
                        "grading replayed with a different score"
                    );
                }
                return Ok(GradeStatus::Replayed);
            }

            self.store
                .insert_grading(&Grading {
                    answer: answer_id,
                    score: event.score,
                    graded_at: event.graded_at,
                })
                .await?;
            self.touch_leaf(event.participant, event.attempt, event.item, now)
                .await?;
            propagate_results(&self.store, now).await?;

            Ok(GradeStatus::Recorded)
        })
        .await
    }

    /// Sets (or with `None` clears) the manual correction of a result's score.
    pub async fn set_score_edit_rule(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        rule: Option<(ScoreEditRule, f64)>,
    ) -> Result<(), EngineError> {
        self.write(RESULTS_LOCK, async |now| {
            if !self
                .store
                .set_score_edit_rule(participant, attempt, item, rule)
                .await?
            {
                return Err(EngineError::NotFound(format!(
                    "result of participant {participant} on item {item}"
                )));
            }
            self.store
                .set_propagation_state(participant, attempt, item, PropagationState::ToBeRecomputed)
                .await?;
            propagate_results(&self.store, now).await?;
            Ok(())
        })
        .await
    }

    /// Settles every pending result.
    pub async fn propagate_results(&self) -> Result<ResultPropagation, EngineError> {
        self.write(RESULTS_LOCK, async |now| propagate_results(&self.store, now).await)
            .await
    }

    // Lookups

    pub async fn group(&self, id: GroupId) -> Result<Option<Group>, EngineError> {
        self.read(async |_| Ok(self.store.group(id).await?)).await
    }

    pub async fn edge(
        &self,
        parent: GroupId,
        child: GroupId,
    ) -> Result<Option<GroupEdge>, EngineError> {
        self.read(async |_| Ok(self.store.edge(parent, child).await?))
            .await
    }

    /// Ancestors of `group` (itself included) which are not expired.
    pub async fn ancestors(&self, group: GroupId) -> Result<Vec<AncestorEntry>, EngineError> {
        self.read(async |now| {
            Ok(self
                .store
                .ancestors(group)
                .await?
                .into_iter()
                .filter(|entry| !entry.is_expired(now))
                .collect())
        })
        .await
    }

    pub async fn generated_permission(
        &self,
        group: GroupId,
        item: ItemId,
    ) -> Result<Option<GeneratedPermission>, EngineError> {
        self.read(async |_| Ok(self.store.generated(group, item).await?))
            .await
    }

    pub async fn generated_tiers(&self, group: GroupId, item: ItemId) -> Result<Tiers, EngineError> {
        self.read(async |_| Ok(self.store.generated_tiers(group, item).await?))
            .await
    }

    /// Effective permission of a user: the maximum over the user's non-expired ancestors.
    pub async fn user_permission(
        &self,
        user: GroupId,
        item: ItemId,
    ) -> Result<PermissionLevels, EngineError> {
        self.read(async |now| Ok(self.store.user_levels(user, item, now).await?))
            .await
    }

    pub async fn result(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
    ) -> Result<Option<ItemResult>, EngineError> {
        self.read(async |_| Ok(self.store.result(participant, attempt, item).await?))
            .await
    }

    /// Best result of `participant` on `item` across all attempts.
    pub async fn best_result(
        &self,
        participant: GroupId,
        item: ItemId,
    ) -> Result<Option<ItemResult>, EngineError> {
        self.read(async |_| Ok(best_result(self.store.results_of(participant, item).await?)))
            .await
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Applies relation actions to batches of child groups, enforcing the preconditions of each
//! action before moving edges through the transition table.
use serde::{Deserialize, Serialize};
use tessera_store::Timestamp;
use tracing::{debug, trace};

use crate::error::EngineError;
use crate::groups::closure::{ClosureChange, ensure_no_cycle, recompute_closure};
use crate::groups::transitions::{EdgeState, GroupRelationAction, Transition, next_state};
use crate::groups::{EdgeAttributes, EdgeId, Group, GroupId, GroupStore, GroupType, RelationType};

/// Approvals given by the user together with the action.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approvals {
    /// The user accepts that they can't leave the group while its membership lock is in force.
    pub lock_membership: bool,
}

/// Request to apply `action` to the edges between `parent` and each of `children`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRequest {
    pub parent: GroupId,
    pub children: Vec<GroupId>,
    pub action: GroupRelationAction,
    /// The user (self group) performing the action.
    pub actor: GroupId,
    pub role: Option<String>,
    pub expires_at: Option<Timestamp>,
    pub approvals: Approvals,
}

impl RelationRequest {
    /// Action performed by a user on their own membership in `parent`.
    pub fn user(user: GroupId, parent: GroupId, action: GroupRelationAction) -> Self {
        Self {
            parent,
            children: vec![user],
            action,
            actor: user,
            role: None,
            expires_at: None,
            approvals: Approvals::default(),
        }
    }

    /// Action performed by the manager `actor` on the given children of `parent`.
    pub fn admin(
        actor: GroupId,
        parent: GroupId,
        children: Vec<GroupId>,
        action: GroupRelationAction,
    ) -> Self {
        Self {
            parent,
            children,
            action,
            actor,
            role: None,
            expires_at: None,
            approvals: Approvals::default(),
        }
    }

    pub fn approve_lock_membership(mut self) -> Self {
        self.approvals.lock_membership = true;
        self
    }

    pub fn role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }

    pub fn expires_at(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionStatus {
    Success,
    Unchanged,
    Invalid,
}

/// Per-child outcome of a relation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionResult {
    pub child: GroupId,
    pub edge_id: Option<EdgeId>,
    pub new_state: EdgeState,
    pub changed: bool,
    pub status: TransitionStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransitionOutcome {
    /// The action which was actually applied, join requests by managers are upgraded.
    pub action: Option<GroupRelationAction>,
    pub results: Vec<TransitionResult>,
    pub closure: ClosureChange,
}

/// Checks the preconditions of `request` and moves every child edge through the transition table.
///
/// The closure is recomputed once at the end if the set of active edges changed. Any failing
/// precondition aborts the whole batch.
pub async fn apply_transition<S: GroupStore>(
    store: &S,
    request: &RelationRequest,
    now: Timestamp,
) -> Result<TransitionOutcome, EngineError> {
    let mut action = request.action;
    let is_join_request = matches!(
        action,
        GroupRelationAction::UserCreatesJoinRequest
            | GroupRelationAction::UserCreatesAcceptedJoinRequest
    );

    let Some(group) = store.group(request.parent).await? else {
        if is_join_request {
            return Err(EngineError::InsufficientAccessRights);
        }
        return Err(EngineError::NotFound(format!("group {}", request.parent)));
    };

    let manages = store.manages(request.actor, group.id, now).await?;

    if action.is_admin_action() && !manages {
        return Err(EngineError::InsufficientAccessRights);
    }

    if action == GroupRelationAction::UserCreatesJoinRequest && manages {
        debug!(group = group.id, "join request by a manager, accepting right away");
        action = GroupRelationAction::UserCreatesAcceptedJoinRequest;
    }

    match action {
        GroupRelationAction::UserCreatesJoinRequest if !group.free_access => {
            return Err(EngineError::InsufficientAccessRights);
        }
        GroupRelationAction::UserCreatesAcceptedJoinRequest if !manages => {
            return Err(EngineError::InsufficientAccessRights);
        }
        GroupRelationAction::UserLeavesGroup if group.is_user_deletion_locked(now) => {
            return Err(EngineError::Forbidden(format!(
                "membership of group {} can't be left before {}",
                group.id,
                group
                    .lock_user_deletion_until
                    .unwrap_or(Timestamp::MAX)
            )));
        }
        _ => (),
    }

    let mut results = Vec::with_capacity(request.children.len());
    let mut active_set_changed = false;

    for child in &request.children {
        let edge = store.edge(group.id, *child).await?;
        let current = edge
            .as_ref()
            .map(|edge| EdgeState {
                relation: Some(edge.relation_type),
                leave_requested: edge.leave_requested,
            })
            .unwrap_or(EdgeState::NONE);
        let lock_approved = edge
            .as_ref()
            .is_some_and(|edge| edge.lock_membership_approved);

        if action.is_leave_request_action() && lock_approved && group.is_membership_locked(now) {
            return Err(EngineError::Forbidden(format!(
                "membership of group {} is locked",
                group.id
            )));
        }

        let new_state = match next_state(action, current) {
            Transition::Apply(new_state) => new_state,
            transition => {
                trace!(parent = group.id, child, %action, ?transition, "edge not changed");
                results.push(TransitionResult {
                    child: *child,
                    edge_id: edge.as_ref().map(|edge| edge.id),
                    new_state: current,
                    changed: false,
                    status: if transition == Transition::Unchanged {
                        TransitionStatus::Unchanged
                    } else {
                        TransitionStatus::Invalid
                    },
                });
                continue;
            }
        };

        let Some(relation_type) = new_state.relation else {
            continue;
        };

        let becomes_active = new_state.is_active() && !current.is_active();
        let mut attributes = EdgeAttributes {
            role: request.role.clone(),
            expires_at: request.expires_at,
            lock_membership_approved: None,
        };

        if becomes_active || relation_type == RelationType::RequestSent {
            check_team_membership(store, &group, *child, now).await?;
            check_lock_approval(&group, action, request, lock_approved, &mut attributes, now)?;
        }

        if becomes_active {
            ensure_no_cycle(store, group.id, *child).await?;
        }

        let edge_id = store
            .upsert_edge(
                group.id,
                *child,
                relation_type,
                new_state.leave_requested,
                &attributes,
                now,
            )
            .await?;

        active_set_changed |= new_state.is_active() != current.is_active();

        debug!(parent = group.id, child, %action, %relation_type, "edge changed");

        results.push(TransitionResult {
            child: *child,
            edge_id: Some(edge_id),
            new_state,
            changed: true,
            status: TransitionStatus::Success,
        });
    }

    let closure = if active_set_changed {
        recompute_closure(store).await?
    } else {
        ClosureChange::default()
    };

    Ok(TransitionOutcome {
        action: Some(action),
        results,
        closure,
    })
}

/// A member of a team bound to a contest item can't join another team bound to the same item.
async fn check_team_membership<S: GroupStore>(
    store: &S,
    group: &Group,
    child: GroupId,
    now: Timestamp,
) -> Result<(), EngineError> {
    let (GroupType::Team, Some(team_item)) = (group.group_type, group.team_item_id) else {
        return Ok(());
    };

    let teams = store
        .team_memberships(child, team_item, group.id, now)
        .await?;
    if let Some(team) = teams.first() {
        return Err(EngineError::UnprocessableEntity(format!(
            "group {child} is already a member of team {team} for item {team_item}"
        )));
    }
    Ok(())
}

/// Joining a group whose membership lock is in force needs the user's approval of the lock.
///
/// Users give it with the action itself, managers accepting a request rely on the approval
/// stored with the request.
fn check_lock_approval(
    group: &Group,
    action: GroupRelationAction,
    request: &RelationRequest,
    lock_approved: bool,
    attributes: &mut EdgeAttributes,
    now: Timestamp,
) -> Result<(), EngineError> {
    if !group.is_membership_locked(now) {
        return Ok(());
    }

    let approved = if action.is_admin_action() {
        lock_approved
    } else {
        request.approvals.lock_membership
    };

    if !approved {
        return Err(EngineError::UnprocessableEntity(format!(
            "missing approval of the membership lock of group {}",
            group.id
        )));
    }

    attributes.lock_membership_approved = Some(true);
    Ok(())
}

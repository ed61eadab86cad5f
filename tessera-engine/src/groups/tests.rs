// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::EngineError;
use crate::groups::membership::{RelationRequest, TransitionStatus};
use crate::groups::transitions::{EdgeState, GroupRelationAction};
use crate::groups::{EdgeAttributes, Group, GroupId, GroupType, RelationType};
use crate::test_utils::{T0, TestEngine};

async fn ancestor_ids(engine: &TestEngine, group: GroupId) -> BTreeSet<GroupId> {
    engine
        .ancestors(group)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.ancestor)
        .collect()
}

#[tokio::test]
async fn closure_contains_transitive_ancestors() {
    let engine = TestEngine::new().await;
    engine.add_groups(&[10, 11, 12], GroupType::Class).await;
    engine.relate(10, 11).await;
    let change = engine
        .create_relation(11, 12, &EdgeAttributes::default())
        .await
        .unwrap();

    assert_eq!(change.changed_groups, BTreeSet::from([12]));
    assert_eq!(ancestor_ids(&engine, 12).await, BTreeSet::from([10, 11, 12]));
    assert_eq!(ancestor_ids(&engine, 10).await, BTreeSet::from([10]));

    let self_entry = engine
        .ancestors(12)
        .await
        .unwrap()
        .into_iter()
        .find(|entry| entry.ancestor == 12)
        .unwrap();
    assert!(self_entry.is_self);
}

#[tokio::test]
async fn cycles_are_rejected_through_expired_edges() {
    let engine = TestEngine::new().await;
    engine.add_groups(&[10, 11], GroupType::Class).await;

    let attributes = EdgeAttributes {
        expires_at: Some(T0 + Duration::from_secs(1)),
        ..Default::default()
    };
    engine.create_relation(10, 11, &attributes).await.unwrap();

    engine.advance(Duration::from_secs(2));
    assert_eq!(ancestor_ids(&engine, 11).await, BTreeSet::from([11]));

    let result = engine
        .create_relation(11, 10, &EdgeAttributes::default())
        .await;
    assert!(matches!(
        result,
        Err(EngineError::RelationCycle {
            parent: 11,
            child: 10
        })
    ));

    let result = engine
        .create_relation(10, 10, &EdgeAttributes::default())
        .await;
    assert!(matches!(result, Err(EngineError::RelationCycle { .. })));
    assert!(engine.edge(11, 10).await.unwrap().is_none());
}

#[tokio::test]
async fn expiry_is_the_latest_over_all_paths() {
    let engine = TestEngine::new().await;
    engine.add_groups(&[10, 11, 12, 13], GroupType::Class).await;

    let short = EdgeAttributes {
        expires_at: Some(T0 + Duration::from_secs(10)),
        ..Default::default()
    };
    let shorter = EdgeAttributes {
        expires_at: Some(T0 + Duration::from_secs(5)),
        ..Default::default()
    };

    // 10 -> 11 -> 13 expires with its earliest edge.
    engine.create_relation(10, 11, &short).await.unwrap();
    engine.create_relation(11, 13, &shorter).await.unwrap();

    let entry = |engine: TestEngine| async move {
        engine
            .ancestors(13)
            .await
            .unwrap()
            .into_iter()
            .find(|entry| entry.ancestor == 10)
    };
    assert_eq!(
        entry(engine.clone()).await.unwrap().expires_at,
        Some(T0 + Duration::from_secs(5))
    );

    // A second path without expiry wins.
    engine.relate(10, 12).await;
    engine.relate(12, 13).await;
    assert_eq!(entry(engine.clone()).await.unwrap().expires_at, None);
}

#[tokio::test]
async fn deleting_the_last_parent_needs_orphan_deletion() {
    let engine = TestEngine::new().await;
    engine.add_groups(&[10, 11, 12, 13], GroupType::Class).await;
    engine.add_group(100, GroupType::UserSelf).await;

    // 10 -> 11 -> 12, 13 -> 12, 11 -> 100
    engine.relate(10, 11).await;
    engine.relate(11, 12).await;
    engine.relate(13, 12).await;
    engine.relate(11, 100).await;

    let result = engine.delete_relation(10, 11, false).await;
    assert!(matches!(result, Err(EngineError::GroupBecomesOrphan(11))));
    assert!(engine.edge(10, 11).await.unwrap().is_some());

    let deletion = engine.delete_relation(10, 11, true).await.unwrap();
    assert!(deletion.removed);
    assert_eq!(deletion.deleted_groups, vec![11]);

    assert!(engine.group(11).await.unwrap().is_none());
    // Still has another parent.
    assert!(engine.group(12).await.unwrap().is_some());
    assert_eq!(ancestor_ids(&engine, 12).await, BTreeSet::from([12, 13]));
    // User groups are never removed with the subtree.
    assert!(engine.group(100).await.unwrap().is_some());
    assert_eq!(ancestor_ids(&engine, 100).await, BTreeSet::from([100]));
}

#[tokio::test]
async fn deleting_one_of_several_parents() {
    let engine = TestEngine::new().await;
    engine.add_groups(&[10, 11, 12], GroupType::Class).await;
    engine.relate(10, 12).await;
    engine.relate(11, 12).await;

    let deletion = engine.delete_relation(10, 12, false).await.unwrap();
    assert!(deletion.removed);
    assert!(deletion.deleted_groups.is_empty());
    assert_eq!(deletion.closure.changed_groups, BTreeSet::from([12]));
    assert_eq!(ancestor_ids(&engine, 12).await, BTreeSet::from([11, 12]));

    let deletion = engine.delete_relation(10, 12, false).await.unwrap();
    assert!(!deletion.removed);
}

#[tokio::test]
async fn relations_without_checking() {
    let engine = TestEngine::new().await;
    engine.add_groups(&[10, 11, 12], GroupType::Class).await;

    let change = engine
        .create_relations_without_checking(&[(10, 11), (11, 12)])
        .await
        .unwrap();
    assert_eq!(change.changed_groups, BTreeSet::from([11, 12]));
    assert_eq!(ancestor_ids(&engine, 12).await, BTreeSet::from([10, 11, 12]));
}

#[tokio::test]
async fn recreated_relations_drop_their_past_expiry() {
    let engine = TestEngine::new().await;
    engine.add_groups(&[20, 21], GroupType::Class).await;

    let attributes = EdgeAttributes {
        expires_at: Some(T0 + Duration::from_secs(10)),
        ..Default::default()
    };
    engine.create_relation(20, 21, &attributes).await.unwrap();

    engine.advance(Duration::from_secs(60));
    assert_eq!(ancestor_ids(&engine, 21).await, BTreeSet::from([21]));

    engine.relate(20, 21).await;
    let edge = engine.edge(20, 21).await.unwrap().unwrap();
    assert_eq!(edge.expires_at, None);
    assert!(edge.is_effective(engine.now()));
    assert_eq!(ancestor_ids(&engine, 21).await, BTreeSet::from([20, 21]));
}

/// Class 10 managed by the members of group 20, with manager 100 and user 200.
async fn managed_class(engine: &TestEngine, class: Group) {
    engine.create_group(&class).await.unwrap();
    engine.add_group(20, GroupType::Other).await;
    engine.add_groups(&[100, 200, 201], GroupType::UserSelf).await;
    engine.relate(20, 100).await;
    assert!(engine.set_group_manager(class.id, 20).await.unwrap());
}

#[tokio::test]
async fn invitation_flow() {
    let engine = TestEngine::new().await;
    managed_class(&engine, Group::new(10, GroupType::Class)).await;

    let outcome = engine
        .transition(&RelationRequest::admin(
            100,
            10,
            vec![200, 201],
            GroupRelationAction::AdminCreatesInvitation,
        ))
        .await
        .unwrap();
    assert_eq!(outcome.results.len(), 2);
    assert!(outcome.results.iter().all(|result| result.changed));
    assert!(outcome.closure.is_empty());

    let edge = engine.edge(10, 200).await.unwrap().unwrap();
    assert_eq!(edge.relation_type, RelationType::InvitationSent);

    let accept = RelationRequest::user(200, 10, GroupRelationAction::UserAcceptsInvitation);
    let outcome = engine.transition(&accept).await.unwrap();
    assert_eq!(outcome.results[0].new_state, EdgeState::new(RelationType::Active));
    assert_eq!(outcome.results[0].edge_id, Some(edge.id));
    assert_eq!(outcome.closure.changed_groups, BTreeSet::from([200]));
    assert_eq!(ancestor_ids(&engine, 200).await, BTreeSet::from([10, 200]));

    // Accepting again changes nothing.
    let outcome = engine.transition(&accept).await.unwrap();
    assert!(!outcome.results[0].changed);
    assert_eq!(outcome.results[0].status, TransitionStatus::Unchanged);

    let outcome = engine
        .transition(&RelationRequest::user(
            201,
            10,
            GroupRelationAction::UserRefusesInvitation,
        ))
        .await
        .unwrap();
    assert_eq!(
        outcome.results[0].new_state,
        EdgeState::new(RelationType::InvitationRefused)
    );

    // Refused invitations can't be accepted anymore.
    let outcome = engine
        .transition(&RelationRequest::user(
            201,
            10,
            GroupRelationAction::UserAcceptsInvitation,
        ))
        .await
        .unwrap();
    assert_eq!(outcome.results[0].status, TransitionStatus::Invalid);
}

#[tokio::test]
async fn admin_actions_need_a_manager() {
    let engine = TestEngine::new().await;
    managed_class(&engine, Group::new(10, GroupType::Class)).await;

    let result = engine
        .transition(&RelationRequest::admin(
            200,
            10,
            vec![201],
            GroupRelationAction::AdminCreatesInvitation,
        ))
        .await;
    assert!(matches!(result, Err(EngineError::InsufficientAccessRights)));
}

#[tokio::test]
async fn join_requests() {
    let engine = TestEngine::new().await;
    managed_class(&engine, Group::new(10, GroupType::Class)).await;
    engine
        .create_group(&Group::new(11, GroupType::Club).free_access(true))
        .await
        .unwrap();

    let join = |user, group| {
        RelationRequest::user(user, group, GroupRelationAction::UserCreatesJoinRequest)
    };

    // Not free to join and not a manager.
    let result = engine.transition(&join(200, 10)).await;
    assert!(matches!(result, Err(EngineError::InsufficientAccessRights)));

    // Missing group.
    let result = engine.transition(&join(200, 99)).await;
    assert!(matches!(result, Err(EngineError::InsufficientAccessRights)));

    let outcome = engine.transition(&join(200, 11)).await.unwrap();
    assert_eq!(
        outcome.results[0].new_state,
        EdgeState::new(RelationType::RequestSent)
    );
    assert!(outcome.closure.is_empty());

    // Managers join right away.
    let outcome = engine.transition(&join(100, 10)).await.unwrap();
    assert_eq!(
        outcome.action,
        Some(GroupRelationAction::UserCreatesAcceptedJoinRequest)
    );
    assert_eq!(
        engine.edge(10, 100).await.unwrap().unwrap().relation_type,
        RelationType::Active
    );
}

#[tokio::test]
async fn leave_request_under_approved_membership_lock_is_forbidden() {
    let engine = TestEngine::new().await;
    let class = Group::new(10, GroupType::Class)
        .require_lock_membership_approval_until(T0 + Duration::from_secs(86_400));
    managed_class(&engine, class).await;

    let attributes = EdgeAttributes {
        lock_membership_approved: Some(true),
        ..Default::default()
    };
    engine.create_relation(10, 200, &attributes).await.unwrap();

    let result = engine
        .transition(&RelationRequest::user(
            200,
            10,
            GroupRelationAction::UserCreatesLeaveRequest,
        ))
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));

    // Once the lock is over, leave requests are possible again.
    engine.advance(Duration::from_secs(86_401));
    let outcome = engine
        .transition(&RelationRequest::user(
            200,
            10,
            GroupRelationAction::UserCreatesLeaveRequest,
        ))
        .await
        .unwrap();
    assert_eq!(
        outcome.results[0].new_state,
        EdgeState::with_leave_request(RelationType::Active)
    );
    assert!(engine.edge(10, 200).await.unwrap().unwrap().leave_requested);
}

#[tokio::test]
async fn joining_a_locked_group_needs_approval() {
    let engine = TestEngine::new().await;
    let class = Group::new(10, GroupType::Class)
        .require_lock_membership_approval_until(T0 + Duration::from_secs(60));
    managed_class(&engine, class).await;

    engine
        .transition(&RelationRequest::admin(
            100,
            10,
            vec![200],
            GroupRelationAction::AdminCreatesInvitation,
        ))
        .await
        .unwrap();

    let accept = RelationRequest::user(200, 10, GroupRelationAction::UserAcceptsInvitation);
    let result = engine.transition(&accept).await;
    assert!(matches!(result, Err(EngineError::UnprocessableEntity(_))));

    engine
        .transition(&accept.approve_lock_membership())
        .await
        .unwrap();
    let edge = engine.edge(10, 200).await.unwrap().unwrap();
    assert!(edge.is_active());
    assert!(edge.lock_membership_approved);
}

#[tokio::test]
async fn leaving_is_forbidden_under_deletion_lock() {
    let engine = TestEngine::new().await;
    let class =
        Group::new(10, GroupType::Class).lock_user_deletion_until(T0 + Duration::from_secs(60));
    managed_class(&engine, class).await;
    engine.relate(10, 200).await;

    let leave = RelationRequest::user(200, 10, GroupRelationAction::UserLeavesGroup);
    let result = engine.transition(&leave).await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));

    engine.advance(Duration::from_secs(61));
    let outcome = engine.transition(&leave).await.unwrap();
    assert_eq!(outcome.results[0].new_state, EdgeState::new(RelationType::Left));
    assert_eq!(ancestor_ids(&engine, 200).await, BTreeSet::from([200]));
}

#[tokio::test]
async fn one_team_per_contest_item() {
    let engine = TestEngine::new().await;
    engine.add_groups(&[200, 201], GroupType::UserSelf).await;
    for team in [30, 31] {
        engine
            .create_group(&Group::new(team, GroupType::Team).free_access(true).team_item(50))
            .await
            .unwrap();
    }
    engine.add_group(20, GroupType::Other).await;
    engine.add_group(100, GroupType::UserSelf).await;
    engine.relate(20, 100).await;
    engine.set_group_manager(31, 20).await.unwrap();

    // Both users ask to join team 31, then 201 becomes a member of team 30.
    for user in [200, 201] {
        engine
            .transition(&RelationRequest::user(
                user,
                31,
                GroupRelationAction::UserCreatesJoinRequest,
            ))
            .await
            .unwrap();
    }
    engine.relate(30, 201).await;

    let result = engine
        .transition(&RelationRequest::user(
            201,
            31,
            GroupRelationAction::UserCreatesJoinRequest,
        ))
        .await;
    assert!(result.unwrap().results[0].status == TransitionStatus::Unchanged);

    // Accepting both fails for 201 and rolls back the whole batch.
    let result = engine
        .transition(&RelationRequest::admin(
            100,
            31,
            vec![200, 201],
            GroupRelationAction::AdminAcceptsJoinRequest,
        ))
        .await;
    assert!(matches!(result, Err(EngineError::UnprocessableEntity(_))));
    assert_eq!(
        engine.edge(31, 200).await.unwrap().unwrap().relation_type,
        RelationType::RequestSent
    );

    engine
        .transition(&RelationRequest::admin(
            100,
            31,
            vec![200],
            GroupRelationAction::AdminAcceptsJoinRequest,
        ))
        .await
        .unwrap();
    assert_eq!(ancestor_ids(&engine, 200).await, BTreeSet::from([31, 200]));
}

#[tokio::test]
async fn rejoining_after_an_expired_membership() {
    let engine = TestEngine::new().await;
    managed_class(&engine, Group::new(10, GroupType::Class)).await;

    let invite = RelationRequest::admin(
        100,
        10,
        vec![200],
        GroupRelationAction::AdminCreatesInvitation,
    );
    let accept = RelationRequest::user(200, 10, GroupRelationAction::UserAcceptsInvitation);

    engine.transition(&invite).await.unwrap();
    engine
        .transition(&accept.clone().expires_at(T0 + Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(ancestor_ids(&engine, 200).await, BTreeSet::from([10, 200]));

    engine.advance(Duration::from_secs(60));
    assert_eq!(ancestor_ids(&engine, 200).await, BTreeSet::from([200]));

    let outcome = engine
        .transition(&RelationRequest::admin(
            100,
            10,
            vec![200],
            GroupRelationAction::AdminRemovesMember,
        ))
        .await
        .unwrap();
    assert_eq!(outcome.results[0].new_state, EdgeState::new(RelationType::Left));

    engine.transition(&invite).await.unwrap();
    let outcome = engine.transition(&accept).await.unwrap();
    assert_eq!(outcome.results[0].new_state, EdgeState::new(RelationType::Active));

    let edge = engine.edge(10, 200).await.unwrap().unwrap();
    assert_eq!(edge.expires_at, None);
    assert_eq!(ancestor_ids(&engine, 200).await, BTreeSet::from([10, 200]));
}

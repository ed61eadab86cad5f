// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle state machine of group membership edges.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::groups::RelationType;

/// Actions which can be applied to the edge between a group and one of its (future) children.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupRelationAction {
    UserAcceptsInvitation,
    UserRefusesInvitation,
    UserCreatesJoinRequest,
    UserCreatesAcceptedJoinRequest,
    UserCreatesLeaveRequest,
    UserCancelsLeaveRequest,
    UserLeavesGroup,
    AdminCreatesInvitation,
    AdminAcceptsJoinRequest,
    AdminRefusesJoinRequest,
    AdminAcceptsLeaveRequest,
    AdminRefusesLeaveRequest,
    AdminRemovesMember,
}

impl GroupRelationAction {
    /// Actions performed by a manager of the parent group on behalf of its children.
    pub fn is_admin_action(&self) -> bool {
        matches!(
            self,
            GroupRelationAction::AdminCreatesInvitation
                | GroupRelationAction::AdminAcceptsJoinRequest
                | GroupRelationAction::AdminRefusesJoinRequest
                | GroupRelationAction::AdminAcceptsLeaveRequest
                | GroupRelationAction::AdminRefusesLeaveRequest
                | GroupRelationAction::AdminRemovesMember
        )
    }

    pub fn is_leave_request_action(&self) -> bool {
        matches!(
            self,
            GroupRelationAction::UserCreatesLeaveRequest
                | GroupRelationAction::UserCancelsLeaveRequest
        )
    }
}

impl fmt::Display for GroupRelationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupRelationAction::UserAcceptsInvitation => "userAcceptsInvitation",
            GroupRelationAction::UserRefusesInvitation => "userRefusesInvitation",
            GroupRelationAction::UserCreatesJoinRequest => "userCreatesJoinRequest",
            GroupRelationAction::UserCreatesAcceptedJoinRequest => {
                "userCreatesAcceptedJoinRequest"
            }
            GroupRelationAction::UserCreatesLeaveRequest => "userCreatesLeaveRequest",
            GroupRelationAction::UserCancelsLeaveRequest => "userCancelsLeaveRequest",
            GroupRelationAction::UserLeavesGroup => "userLeavesGroup",
            GroupRelationAction::AdminCreatesInvitation => "adminCreatesInvitation",
            GroupRelationAction::AdminAcceptsJoinRequest => "adminAcceptsJoinRequest",
            GroupRelationAction::AdminRefusesJoinRequest => "adminRefusesJoinRequest",
            GroupRelationAction::AdminAcceptsLeaveRequest => "adminAcceptsLeaveRequest",
            GroupRelationAction::AdminRefusesLeaveRequest => "adminRefusesLeaveRequest",
            GroupRelationAction::AdminRemovesMember => "adminRemovesMember",
        };

        write!(f, "{}", s)
    }
}

/// State of an edge as far as transitions are concerned. `relation` is `None` if there is no
/// edge yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeState {
    pub relation: Option<RelationType>,
    pub leave_requested: bool,
}

impl EdgeState {
    pub const NONE: EdgeState = EdgeState {
        relation: None,
        leave_requested: false,
    };

    pub fn new(relation: RelationType) -> Self {
        Self {
            relation: Some(relation),
            leave_requested: false,
        }
    }

    pub fn with_leave_request(relation: RelationType) -> Self {
        Self {
            relation: Some(relation),
            leave_requested: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.relation == Some(RelationType::Active)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The action moves the edge into the given state.
    Apply(EdgeState),

    /// The edge already is in the state the action leads to.
    Unchanged,

    /// The action is not allowed in the current state.
    Invalid,
}

/// Returns the transition `action` causes on an edge in state `current`.
pub fn next_state(action: GroupRelationAction, current: EdgeState) -> Transition {
    use GroupRelationAction::*;
    use RelationType::*;

    let active = EdgeState::new(Active);

    match (action, current.relation, current.leave_requested) {
        (UserAcceptsInvitation, Some(InvitationSent), _) => Transition::Apply(active),
        (UserAcceptsInvitation, Some(Active), _) => Transition::Unchanged,
        (UserAcceptsInvitation, _, _) => Transition::Invalid,

        (UserRefusesInvitation, Some(InvitationSent), _) => {
            Transition::Apply(EdgeState::new(InvitationRefused))
        }
        (UserRefusesInvitation, Some(InvitationRefused), _) => Transition::Unchanged,
        (UserRefusesInvitation, _, _) => Transition::Invalid,

        (UserCreatesJoinRequest, None | Some(InvitationRefused | RequestRefused | Left), _) => {
            Transition::Apply(EdgeState::new(RequestSent))
        }
        (UserCreatesJoinRequest, Some(InvitationSent), _) => Transition::Apply(active),
        (UserCreatesJoinRequest, Some(RequestSent), _) => Transition::Unchanged,
        (UserCreatesJoinRequest, Some(Active), _) => Transition::Invalid,

        (UserCreatesAcceptedJoinRequest, Some(Active), _) => Transition::Unchanged,
        (UserCreatesAcceptedJoinRequest, _, _) => Transition::Apply(active),

        (UserCreatesLeaveRequest, Some(Active), false) => {
            Transition::Apply(EdgeState::with_leave_request(Active))
        }
        (UserCreatesLeaveRequest, Some(Active), true) => Transition::Unchanged,
        (UserCreatesLeaveRequest, _, _) => Transition::Invalid,

        (UserCancelsLeaveRequest, Some(Active), true) => Transition::Apply(active),
        (UserCancelsLeaveRequest, _, _) => Transition::Invalid,

        (UserLeavesGroup | AdminRemovesMember, Some(Active), _) => {
            Transition::Apply(EdgeState::new(Left))
        }
        (UserLeavesGroup | AdminRemovesMember, Some(Left), _) => Transition::Unchanged,
        (UserLeavesGroup | AdminRemovesMember, _, _) => Transition::Invalid,

        (AdminCreatesInvitation, None | Some(InvitationRefused | RequestRefused | Left), _) => {
            Transition::Apply(EdgeState::new(InvitationSent))
        }
        // Inviting someone who asked to join accepts their request.
        (AdminCreatesInvitation, Some(RequestSent), _) => Transition::Apply(active),
        (AdminCreatesInvitation, Some(InvitationSent), _) => Transition::Unchanged,
        (AdminCreatesInvitation, Some(Active), _) => Transition::Invalid,

        (AdminAcceptsJoinRequest, Some(RequestSent), _) => Transition::Apply(active),
        (AdminAcceptsJoinRequest, _, _) => Transition::Invalid,

        (AdminRefusesJoinRequest, Some(RequestSent), _) => {
            Transition::Apply(EdgeState::new(RequestRefused))
        }
        (AdminRefusesJoinRequest, _, _) => Transition::Invalid,

        (AdminAcceptsLeaveRequest, Some(Active), true) => Transition::Apply(EdgeState::new(Left)),
        (AdminAcceptsLeaveRequest, _, _) => Transition::Invalid,

        (AdminRefusesLeaveRequest, Some(Active), true) => Transition::Apply(active),
        (AdminRefusesLeaveRequest, _, _) => Transition::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::GroupRelationAction::*;
    use super::{EdgeState, Transition, next_state};
    use crate::groups::RelationType::*;

    #[test]
    fn invitations() {
        let invited = EdgeState::new(InvitationSent);

        assert_eq!(
            next_state(AdminCreatesInvitation, EdgeState::NONE),
            Transition::Apply(invited)
        );
        assert_eq!(
            next_state(AdminCreatesInvitation, invited),
            Transition::Unchanged
        );
        assert_eq!(
            next_state(UserAcceptsInvitation, invited),
            Transition::Apply(EdgeState::new(Active))
        );
        assert_eq!(
            next_state(UserRefusesInvitation, invited),
            Transition::Apply(EdgeState::new(InvitationRefused))
        );

        // Accepting twice is fine, accepting nothing is not.
        assert_eq!(
            next_state(UserAcceptsInvitation, EdgeState::new(Active)),
            Transition::Unchanged
        );
        assert_eq!(
            next_state(UserAcceptsInvitation, EdgeState::NONE),
            Transition::Invalid
        );
        assert_eq!(
            next_state(UserRefusesInvitation, EdgeState::new(RequestSent)),
            Transition::Invalid
        );
    }

    #[test]
    fn join_requests() {
        let requested = EdgeState::new(RequestSent);

        assert_eq!(
            next_state(UserCreatesJoinRequest, EdgeState::NONE),
            Transition::Apply(requested)
        );
        assert_eq!(
            next_state(UserCreatesJoinRequest, EdgeState::new(Left)),
            Transition::Apply(requested)
        );
        assert_eq!(
            next_state(UserCreatesJoinRequest, requested),
            Transition::Unchanged
        );
        assert_eq!(
            next_state(UserCreatesJoinRequest, EdgeState::new(Active)),
            Transition::Invalid
        );
        assert_eq!(
            next_state(AdminAcceptsJoinRequest, requested),
            Transition::Apply(EdgeState::new(Active))
        );
        assert_eq!(
            next_state(AdminRefusesJoinRequest, requested),
            Transition::Apply(EdgeState::new(RequestRefused))
        );
        assert_eq!(
            next_state(AdminAcceptsJoinRequest, EdgeState::NONE),
            Transition::Invalid
        );
        assert_eq!(
            next_state(UserCreatesAcceptedJoinRequest, EdgeState::NONE),
            Transition::Apply(EdgeState::new(Active))
        );
    }

    #[test]
    fn leave_requests() {
        let active = EdgeState::new(Active);
        let leaving = EdgeState::with_leave_request(Active);

        assert_eq!(
            next_state(UserCreatesLeaveRequest, active),
            Transition::Apply(leaving)
        );
        assert_eq!(
            next_state(UserCreatesLeaveRequest, leaving),
            Transition::Unchanged
        );
        assert_eq!(
            next_state(UserCancelsLeaveRequest, leaving),
            Transition::Apply(active)
        );
        assert_eq!(
            next_state(UserCancelsLeaveRequest, active),
            Transition::Invalid
        );
        assert_eq!(
            next_state(AdminAcceptsLeaveRequest, leaving),
            Transition::Apply(EdgeState::new(Left))
        );
        assert_eq!(
            next_state(AdminRefusesLeaveRequest, leaving),
            Transition::Apply(active)
        );
        assert_eq!(
            next_state(AdminAcceptsLeaveRequest, active),
            Transition::Invalid
        );
    }

    #[test]
    fn leaving() {
        assert_eq!(
            next_state(UserLeavesGroup, EdgeState::new(Active)),
            Transition::Apply(EdgeState::new(Left))
        );
        assert_eq!(
            next_state(UserLeavesGroup, EdgeState::new(Left)),
            Transition::Unchanged
        );
        assert_eq!(
            next_state(AdminRemovesMember, EdgeState::new(InvitationSent)),
            Transition::Invalid
        );
    }
}

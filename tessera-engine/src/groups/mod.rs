// SPDX-License-Identifier: MIT OR Apache-2.0

//! Groups, their membership edges and the materialized ancestor closure.
//!
//! Groups form a directed acyclic graph. An edge is created and changes state through the
//! relation transitions (`transitions` and `membership`), only `active` edges count towards the
//! closure which is maintained by `closure`.
pub mod closure;
pub mod membership;
mod store;
#[cfg(test)]
mod tests;
pub mod transitions;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessera_store::{DecodeError, StoreError, Timestamp};

use crate::items::ItemId;

pub use store::GroupStore;

pub type GroupId = i64;

pub type EdgeId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupType {
    Class,
    Team,
    Club,
    Friends,
    Other,
    UserSelf,
    AdminRoot,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Class => "Class",
            GroupType::Team => "Team",
            GroupType::Club => "Club",
            GroupType::Friends => "Friends",
            GroupType::Other => "Other",
            GroupType::UserSelf => "User",
            GroupType::AdminRoot => "Base",
        }
    }

    /// User-self and admin-root groups are never removed together with a detached subtree.
    pub fn is_cascade_protected(&self) -> bool {
        matches!(self, GroupType::UserSelf | GroupType::AdminRoot)
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GroupType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = match s {
            "Class" => GroupType::Class,
            "Team" => GroupType::Team,
            "Club" => GroupType::Club,
            "Friends" => GroupType::Friends,
            "Other" => GroupType::Other,
            "User" => GroupType::UserSelf,
            "Base" => GroupType::AdminRoot,
            _ => return Err(DecodeError::FromStr),
        };
        Ok(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub group_type: GroupType,
    pub free_access: bool,
    pub lock_user_deletion_until: Option<Timestamp>,
    pub require_lock_membership_approval_until: Option<Timestamp>,
    pub team_item_id: Option<ItemId>,
}

impl Group {
    pub fn new(id: GroupId, group_type: GroupType) -> Self {
        Self {
            id,
            name: String::new(),
            group_type,
            free_access: false,
            lock_user_deletion_until: None,
            require_lock_membership_approval_until: None,
            team_item_id: None,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn free_access(mut self, free_access: bool) -> Self {
        self.free_access = free_access;
        self
    }

    pub fn lock_user_deletion_until(mut self, until: Timestamp) -> Self {
        self.lock_user_deletion_until = Some(until);
        self
    }

    pub fn require_lock_membership_approval_until(mut self, until: Timestamp) -> Self {
        self.require_lock_membership_approval_until = Some(until);
        self
    }

    pub fn team_item(mut self, item_id: ItemId) -> Self {
        self.team_item_id = Some(item_id);
        self
    }

    pub fn is_membership_locked(&self, now: Timestamp) -> bool {
        self.require_lock_membership_approval_until
            .is_some_and(|until| until > now)
    }

    pub fn is_user_deletion_locked(&self, now: Timestamp) -> bool {
        self.lock_user_deletion_until
            .is_some_and(|until| until > now)
    }
}

/// Lifecycle state of a group membership edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationType {
    InvitationSent,
    InvitationRefused,
    RequestSent,
    RequestRefused,
    Active,
    Left,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::InvitationSent => "invitationSent",
            RelationType::InvitationRefused => "invitationRefused",
            RelationType::RequestSent => "requestSent",
            RelationType::RequestRefused => "requestRefused",
            RelationType::Active => "active",
            RelationType::Left => "left",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = match s {
            "invitationSent" => RelationType::InvitationSent,
            "invitationRefused" => RelationType::InvitationRefused,
            "requestSent" => RelationType::RequestSent,
            "requestRefused" => RelationType::RequestRefused,
            "active" => RelationType::Active,
            "left" => RelationType::Left,
            _ => return Err(DecodeError::FromStr),
        };
        Ok(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEdge {
    pub id: EdgeId,
    pub parent: GroupId,
    pub child: GroupId,
    pub role: String,
    pub relation_type: RelationType,
    pub lock_membership_approved: bool,
    pub leave_requested: bool,
    pub expires_at: Option<Timestamp>,
    pub status_changed_at: Timestamp,
}

impl GroupEdge {
    pub fn is_active(&self) -> bool {
        self.relation_type == RelationType::Active
    }

    /// Active and not expired at `now`.
    pub fn is_effective(&self, now: Timestamp) -> bool {
        self.is_active() && self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// Row of the materialized transitive closure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestorEntry {
    pub ancestor: GroupId,
    pub child: GroupId,
    pub is_self: bool,
    pub expires_at: Option<Timestamp>,
}

impl AncestorEntry {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Values for a new or updated edge which are not part of its lifecycle state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeAttributes {
    pub role: Option<String>,
    pub expires_at: Option<Timestamp>,
    pub lock_membership_approved: Option<bool>,
}

pub(crate) fn decode<T: FromStr<Err = DecodeError>>(field: &str, value: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|err| StoreError::Decode(field.to_string(), err))
}

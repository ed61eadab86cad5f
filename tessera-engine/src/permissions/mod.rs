// SPDX-License-Identifier: MIT OR Apache-2.0

//! Granted permissions and the cached, inherited permissions generated from them.
//!
//! Granted permissions are the input: a group is given levels on an item by another group. The
//! propagation engine derives a generated permission for every reachable (group, item) pair by
//! merging grants to the group and its ancestors with the permissions inherited from parent
//! items.
pub mod levels;
pub mod propagation;
pub mod registry;
mod store;
pub mod tiers;

use serde::{Deserialize, Serialize};
use tessera_store::Timestamp;

use crate::error::EngineError;
use crate::groups::GroupId;
use crate::items::ItemId;

pub use levels::{CanEdit, CanGrantView, CanView, CanWatch, Component, Level, PermissionKind};
pub use registry::PermissionRegistry;
pub use store::PermissionStore;
pub use tiers::{Tier, Tiers};

/// A permission given to `group` on `item` by `giver`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub group: GroupId,
    pub item: ItemId,
    pub giver: GroupId,
    pub can_view: CanView,
    pub can_grant_view: CanGrantView,
    pub can_watch: CanWatch,
    pub can_edit: CanEdit,
    pub is_owner: bool,

    /// Time from which on the grant is in effect, `None` meaning immediately.
    pub since: Option<Timestamp>,
}

impl PermissionGrant {
    pub fn new(group: GroupId, item: ItemId, giver: GroupId) -> Self {
        Self {
            group,
            item,
            giver,
            can_view: CanView::None,
            can_grant_view: CanGrantView::None,
            can_watch: CanWatch::None,
            can_edit: CanEdit::None,
            is_owner: false,
            since: None,
        }
    }

    /// Builds a grant from level names as they are received from clients.
    pub fn from_names(
        registry: &PermissionRegistry,
        group: GroupId,
        item: ItemId,
        giver: GroupId,
        names: &GrantNames,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            group,
            item,
            giver,
            can_view: registry.parse(&names.can_view)?,
            can_grant_view: registry.parse(&names.can_grant_view)?,
            can_watch: registry.parse(&names.can_watch)?,
            can_edit: registry.parse(&names.can_edit)?,
            is_owner: names.is_owner,
            since: names.since,
        })
    }

    pub fn can_view(mut self, level: CanView) -> Self {
        self.can_view = level;
        self
    }

    pub fn can_grant_view(mut self, level: CanGrantView) -> Self {
        self.can_grant_view = level;
        self
    }

    pub fn can_watch(mut self, level: CanWatch) -> Self {
        self.can_watch = level;
        self
    }

    pub fn can_edit(mut self, level: CanEdit) -> Self {
        self.can_edit = level;
        self
    }

    pub fn owner(mut self) -> Self {
        self.is_owner = true;
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }
}

/// Level names of a grant request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantNames {
    pub can_view: String,
    pub can_grant_view: String,
    pub can_watch: String,
    pub can_edit: String,
    pub is_owner: bool,
    pub since: Option<Timestamp>,
}

impl Default for GrantNames {
    fn default() -> Self {
        Self {
            can_view: "none".into(),
            can_grant_view: "none".into(),
            can_watch: "none".into(),
            can_edit: "none".into(),
            is_owner: false,
            since: None,
        }
    }
}

/// Levels of a generated permission which are in effect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionLevels {
    pub can_view: CanView,
    pub can_grant_view: CanGrantView,
    pub can_watch: CanWatch,
    pub can_edit: CanEdit,
    pub is_owner: bool,
    pub is_grayed: bool,
}

impl PermissionLevels {
    /// Levels of `tiers` which are active at `now`.
    pub fn at(tiers: &Tiers, now: Timestamp) -> Self {
        Self {
            can_view: CanView::from_rank_saturating(tiers.level_at(Component::View, now)),
            can_grant_view: CanGrantView::from_rank_saturating(
                tiers.level_at(Component::GrantView, now),
            ),
            can_watch: CanWatch::from_rank_saturating(tiers.level_at(Component::Watch, now)),
            can_edit: CanEdit::from_rank_saturating(tiers.level_at(Component::Edit, now)),
            is_owner: tiers.level_at(Component::IsOwner, now) > 0,
            is_grayed: tiers.level_at(Component::Grayed, now) > 0,
        }
    }

    /// Maximum of both, component-wise.
    pub fn max(self, other: PermissionLevels) -> Self {
        Self {
            can_view: self.can_view.max(other.can_view),
            can_grant_view: self.can_grant_view.max(other.can_grant_view),
            can_watch: self.can_watch.max(other.can_watch),
            can_edit: self.can_edit.max(other.can_edit),
            is_owner: self.is_owner || other.is_owner,
            is_grayed: self.is_grayed || other.is_grayed,
        }
    }

    pub fn can_view_item_info(&self) -> bool {
        self.is_owner || self.can_view >= CanView::Info
    }

    pub fn can_view_item_content(&self) -> bool {
        self.is_owner || self.can_view >= CanView::Content
    }

    pub fn can_view_item_content_with_descendants(&self) -> bool {
        self.is_owner || self.can_view >= CanView::ContentWithDescendants
    }

    pub fn can_view_item_solution(&self) -> bool {
        self.is_owner || self.can_view >= CanView::Solution
    }

    pub fn can_grant_view_item(&self) -> bool {
        self.is_owner || self.can_grant_view > CanGrantView::None
    }

    pub fn can_watch_item_result(&self) -> bool {
        self.is_owner || self.can_watch >= CanWatch::Result
    }

    pub fn can_watch_item_answer(&self) -> bool {
        self.is_owner || self.can_watch >= CanWatch::Answer
    }

    pub fn can_edit_item_children(&self) -> bool {
        self.is_owner || self.can_edit >= CanEdit::Children
    }

    pub fn can_edit_item_all(&self) -> bool {
        self.is_owner || self.can_edit >= CanEdit::All
    }
}

/// Cached permission of a (group, item) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedPermission {
    pub group: GroupId,
    pub item: ItemId,
    pub levels: PermissionLevels,
    pub computed_at: Timestamp,
}

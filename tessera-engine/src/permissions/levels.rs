// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::{self, Debug};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessera_store::DecodeError;

/// The four kinds of permissions with named levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PermissionKind {
    View,
    GrantView,
    Watch,
    Edit,
}

impl PermissionKind {
    pub const ALL: [PermissionKind; 4] = [
        PermissionKind::View,
        PermissionKind::GrantView,
        PermissionKind::Watch,
        PermissionKind::Edit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionKind::View => "view",
            PermissionKind::GrantView => "grant_view",
            PermissionKind::Watch => "watch",
            PermissionKind::Edit => "edit",
        }
    }

    /// Level names in ascending order, the index of a name is its rank.
    pub fn level_names(&self) -> &'static [&'static str] {
        match self {
            PermissionKind::View => CanView::NAMES,
            PermissionKind::GrantView => CanGrantView::NAMES,
            PermissionKind::Watch => CanWatch::NAMES,
            PermissionKind::Edit => CanEdit::NAMES,
        }
    }
}

/// A totally ordered permission level. Greater levels contain all lower ones.
pub trait Level: Copy + Ord + Default + Debug {
    const KIND: PermissionKind;

    const NAMES: &'static [&'static str];

    fn rank(self) -> u8;

    fn from_rank(rank: u8) -> Option<Self>;

    /// Highest level, saturating for unknown ranks.
    fn from_rank_saturating(rank: u8) -> Self {
        let max = (Self::NAMES.len() - 1) as u8;
        Self::from_rank(rank.min(max)).unwrap_or_default()
    }
}

macro_rules! level {
    ($(#[$meta:meta])* $name:ident, $kind:expr, [$($variant:ident => $label:literal),+ $(,)?]) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[repr(u8)]
        pub enum $name {
            #[default]
            $($variant),+
        }

        impl $name {
            const VARIANTS: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                Self::NAMES[*self as usize]
            }
        }

        impl Level for $name {
            const KIND: PermissionKind = $kind;

            const NAMES: &'static [&'static str] = &[$($label),+];

            fn rank(self) -> u8 {
                self as u8
            }

            fn from_rank(rank: u8) -> Option<Self> {
                Self::VARIANTS.get(rank as usize).copied()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::NAMES
                    .iter()
                    .position(|name| *name == s)
                    .and_then(|rank| Self::from_rank(rank as u8))
                    .ok_or(DecodeError::FromStr)
            }
        }
    };
}

level!(
    /// What of an item a group can see.
    CanView,
    PermissionKind::View,
    [
        None => "none",
        Info => "info",
        Content => "content",
        ContentWithDescendants => "content_with_descendants",
        Solution => "solution",
    ]
);

level!(
    /// Up to which view level a group can grant to others.
    CanGrantView,
    PermissionKind::GrantView,
    [
        None => "none",
        Enter => "enter",
        Content => "content",
        ContentWithDescendants => "content_with_descendants",
        Solution => "solution",
        SolutionWithGrant => "solution_with_grant",
    ]
);

level!(
    /// What of other participants' work on an item a group can see.
    CanWatch,
    PermissionKind::Watch,
    [
        None => "none",
        Result => "result",
        Answer => "answer",
        AnswerWithGrant => "answer_with_grant",
    ]
);

level!(
    /// How a group can change an item.
    CanEdit,
    PermissionKind::Edit,
    [
        None => "none",
        Children => "children",
        All => "all",
        AllWithGrant => "all_with_grant",
    ]
);

/// The components a generated permission is made of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Component {
    View,
    GrantView,
    Watch,
    Edit,
    IsOwner,

    /// Partial access inherited through an `AsGrayed` edge.
    Grayed,
}

impl Component {
    pub const ALL: [Component; 6] = [
        Component::View,
        Component::GrantView,
        Component::Watch,
        Component::Edit,
        Component::IsOwner,
        Component::Grayed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::View => "view",
            Component::GrantView => "grant_view",
            Component::Watch => "watch",
            Component::Edit => "edit",
            Component::IsOwner => "is_owner",
            Component::Grayed => "grayed",
        }
    }
}

impl FromStr for Component {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Component::ALL
            .into_iter()
            .find(|component| component.as_str() == s)
            .ok_or(DecodeError::FromStr)
    }
}

#[cfg(test)]
mod tests {
    use super::{CanEdit, CanGrantView, CanView, CanWatch, Component, Level, PermissionKind};

    #[test]
    fn ranks_follow_declaration_order() {
        assert!(CanView::None < CanView::Info);
        assert!(CanView::Content < CanView::ContentWithDescendants);
        assert_eq!(CanView::Solution.rank(), 4);
        assert_eq!(CanGrantView::from_rank(5), Some(CanGrantView::SolutionWithGrant));
        assert_eq!(CanGrantView::from_rank(6), None);
        assert_eq!(CanWatch::from_rank_saturating(9), CanWatch::AnswerWithGrant);
        assert_eq!(CanEdit::default(), CanEdit::None);
    }

    #[test]
    fn names() {
        assert_eq!(CanView::ContentWithDescendants.to_string(), "content_with_descendants");
        assert_eq!("answer".parse::<CanWatch>().unwrap(), CanWatch::Answer);
        assert!("everything".parse::<CanEdit>().is_err());
        assert_eq!(PermissionKind::Edit.level_names()[3], "all_with_grant");
        assert_eq!("is_owner".parse::<Component>().unwrap(), Component::IsOwner);
    }
}

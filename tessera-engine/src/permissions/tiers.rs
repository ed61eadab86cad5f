// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time-aware permission values.
//!
//! Every component of a generated permission is kept as a list of tiers: the earliest time at
//! which each level becomes available. A level implies all lower ones, so after normalization the
//! tiers of a component strictly increase in both level and activation time.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_store::Timestamp;

use crate::items::PartialAccessPropagation;
use crate::permissions::PermissionGrant;
use crate::permissions::levels::{CanView, Component, Level};

/// A level which is active from `since` on, `None` meaning "always".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tier {
    pub level: u8,
    pub since: Option<Timestamp>,
}

impl Tier {
    pub fn is_active(&self, now: Timestamp) -> bool {
        self.since.is_none_or(|since| since <= now)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tiers(BTreeMap<Component, Vec<Tier>>);

impl Tiers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tier, level 0 carries no access and is ignored.
    pub fn add(&mut self, component: Component, level: u8, since: Option<Timestamp>) {
        if level == 0 {
            return;
        }
        self.0
            .entry(component)
            .or_default()
            .push(Tier { level, since });
    }

    pub fn add_grant(&mut self, grant: &PermissionGrant) {
        self.add(Component::View, grant.can_view.rank(), grant.since);
        self.add(Component::GrantView, grant.can_grant_view.rank(), grant.since);
        self.add(Component::Watch, grant.can_watch.rank(), grant.since);
        self.add(Component::Edit, grant.can_edit.rank(), grant.since);
        self.add(Component::IsOwner, grant.is_owner as u8, grant.since);
    }

    pub fn merge(&mut self, other: Tiers) {
        for (component, tiers) in other.0 {
            self.0.entry(component).or_default().extend(tiers);
        }
    }

    /// Drops every tier which is implied by a higher level that is active at least as early.
    pub fn normalize(mut self) -> Self {
        for tiers in self.0.values_mut() {
            tiers.sort_by(|a, b| b.level.cmp(&a.level).then(a.since.cmp(&b.since)));

            let mut kept: Vec<Tier> = Vec::with_capacity(tiers.len());
            for tier in tiers.iter() {
                let dominated = kept.last().is_some_and(|higher| higher.since <= tier.since);
                if !dominated {
                    kept.push(*tier);
                }
            }

            kept.reverse();
            *tiers = kept;
        }
        self.0.retain(|_, tiers| !tiers.is_empty());
        self
    }

    /// Highest level of `component` which is active at `now`.
    pub fn level_at(&self, component: Component, now: Timestamp) -> u8 {
        self.0
            .get(&component)
            .and_then(|tiers| {
                tiers
                    .iter()
                    .filter(|tier| tier.is_active(now))
                    .map(|tier| tier.level)
                    .max()
            })
            .unwrap_or(0)
    }

    pub fn tiers(&self, component: Component) -> &[Tier] {
        self.0
            .get(&component)
            .map(|tiers| tiers.as_slice())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Component, Tier)> + '_ {
        self.0
            .iter()
            .flat_map(|(component, tiers)| tiers.iter().map(|tier| (*component, *tier)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Tiers a child item inherits from these (parent) tiers through an edge with the given
    /// partial access propagation.
    ///
    /// Full view access passes unchanged, partial view access depends on the edge and `info`
    /// never passes. The grayed marker is not inherited, all other components pass unchanged.
    pub fn inherit(&self, propagation: PartialAccessPropagation) -> Tiers {
        let mut inherited = Tiers::new();
        for (component, tier) in self.iter() {
            match component {
                Component::View if tier.level >= CanView::ContentWithDescendants.rank() => {
                    inherited.add(Component::View, tier.level, tier.since);
                }
                Component::View if tier.level == CanView::Content.rank() => match propagation {
                    PartialAccessPropagation::AsPartial => {
                        inherited.add(Component::View, tier.level, tier.since);
                    }
                    PartialAccessPropagation::AsGrayed => {
                        inherited.add(Component::Grayed, 1, tier.since);
                    }
                    PartialAccessPropagation::None => (),
                },
                Component::View | Component::Grayed => (),
                Component::GrantView | Component::Watch | Component::Edit | Component::IsOwner => {
                    inherited.add(component, tier.level, tier.since);
                }
            }
        }
        inherited
    }
}

impl FromIterator<(Component, Tier)> for Tiers {
    fn from_iter<T: IntoIterator<Item = (Component, Tier)>>(iter: T) -> Self {
        let mut tiers = Tiers::new();
        for (component, tier) in iter {
            tiers.add(component, tier.level, tier.since);
        }
        tiers.normalize()
    }
}

#[cfg(test)]
mod tests {
    use tessera_store::Timestamp;

    use super::{Tier, Tiers};
    use crate::items::PartialAccessPropagation;
    use crate::permissions::levels::{CanView, Component, Level};

    fn at(millis: i64) -> Option<Timestamp> {
        Some(Timestamp::from_millis(millis))
    }

    fn view(level: CanView, since: Option<Timestamp>) -> (Component, Tier) {
        (
            Component::View,
            Tier {
                level: level.rank(),
                since,
            },
        )
    }

    #[test]
    fn normalization_drops_dominated_tiers() {
        let tiers: Tiers = [
            view(CanView::Content, at(20)),
            view(CanView::Info, at(30)),
            view(CanView::Solution, at(10)),
            view(CanView::Content, at(5)),
            view(CanView::Solution, at(40)),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            tiers.tiers(Component::View),
            &[
                Tier {
                    level: CanView::Content.rank(),
                    since: at(5)
                },
                Tier {
                    level: CanView::Solution.rank(),
                    since: at(10)
                },
            ]
        );
    }

    #[test]
    fn immediate_tiers_dominate() {
        let tiers: Tiers = [view(CanView::Info, None), view(CanView::Content, at(10))]
            .into_iter()
            .collect();
        assert_eq!(tiers.tiers(Component::View).len(), 2);

        let tiers: Tiers = [view(CanView::Info, at(10)), view(CanView::Content, None)]
            .into_iter()
            .collect();
        assert_eq!(tiers.tiers(Component::View).len(), 1);
    }

    #[test]
    fn level_at_respects_activation() {
        let tiers: Tiers = [
            view(CanView::Info, None),
            view(CanView::ContentWithDescendants, at(100)),
        ]
        .into_iter()
        .collect();

        let now = Timestamp::from_millis(50);
        assert_eq!(tiers.level_at(Component::View, now), CanView::Info.rank());

        let later = Timestamp::from_millis(100);
        assert_eq!(
            tiers.level_at(Component::View, later),
            CanView::ContentWithDescendants.rank()
        );
        assert_eq!(tiers.level_at(Component::Edit, later), 0);
    }

    #[test]
    fn inheritance_of_view_levels() {
        let content: Tiers = [view(CanView::Content, None)].into_iter().collect();

        let partial = content.inherit(PartialAccessPropagation::AsPartial);
        assert_eq!(
            partial.level_at(Component::View, Timestamp::from_millis(0)),
            CanView::Content.rank()
        );

        let grayed = content.inherit(PartialAccessPropagation::AsGrayed);
        assert_eq!(grayed.level_at(Component::View, Timestamp::from_millis(0)), 0);
        assert_eq!(grayed.level_at(Component::Grayed, Timestamp::from_millis(0)), 1);

        // Grayed doesn't propagate any further.
        assert!(grayed.inherit(PartialAccessPropagation::AsGrayed).is_empty());

        assert!(content.inherit(PartialAccessPropagation::None).is_empty());

        let info: Tiers = [view(CanView::Info, None)].into_iter().collect();
        assert!(info.inherit(PartialAccessPropagation::AsPartial).is_empty());

        let full: Tiers = [view(CanView::Solution, at(3))].into_iter().collect();
        assert_eq!(full.inherit(PartialAccessPropagation::None), full);
    }

    #[test]
    fn other_components_pass_unchanged() {
        let tiers: Tiers = [
            (
                Component::Edit,
                Tier {
                    level: 2,
                    since: None,
                },
            ),
            (
                Component::IsOwner,
                Tier {
                    level: 1,
                    since: at(7),
                },
            ),
        ]
        .into_iter()
        .collect();

        assert_eq!(tiers.inherit(PartialAccessPropagation::None), tiers);
    }
}

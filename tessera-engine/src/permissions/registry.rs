// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::EngineError;
use crate::permissions::levels::{Level, PermissionKind};

static REGISTRY: OnceLock<PermissionRegistry> = OnceLock::new();

/// Immutable mapping between permission level names and their ranks.
///
/// Built once per process and shared, see `shared`.
#[derive(Debug)]
pub struct PermissionRegistry {
    ranks: HashMap<PermissionKind, HashMap<&'static str, u8>>,
}

impl PermissionRegistry {
    fn build() -> Self {
        let mut ranks: HashMap<PermissionKind, HashMap<&'static str, u8>> = HashMap::new();
        for kind in PermissionKind::ALL {
            for (rank, name) in kind.level_names().iter().enumerate() {
                ranks.entry(kind).or_default().insert(*name, rank as u8);
            }
        }
        Self { ranks }
    }

    /// Returns the process-wide registry, building it on first use.
    pub fn shared() -> &'static PermissionRegistry {
        REGISTRY.get_or_init(PermissionRegistry::build)
    }

    pub fn rank(&self, kind: PermissionKind, name: &str) -> Result<u8, EngineError> {
        self.ranks
            .get(&kind)
            .and_then(|names| names.get(name))
            .copied()
            .ok_or_else(|| EngineError::UnknownLevel {
                kind: kind.as_str(),
                name: name.to_string(),
            })
    }

    pub fn name(&self, kind: PermissionKind, rank: u8) -> Option<&'static str> {
        kind.level_names().get(rank as usize).copied()
    }

    pub fn parse<L: Level>(&self, name: &str) -> Result<L, EngineError> {
        let rank = self.rank(L::KIND, name)?;
        L::from_rank(rank).ok_or_else(|| EngineError::UnknownLevel {
            kind: L::KIND.as_str(),
            name: name.to_string(),
        })
    }

    pub fn render<L: Level>(&self, level: L) -> &'static str {
        self.name(L::KIND, level.rank()).unwrap_or("none")
    }
}

#[cfg(test)]
mod tests {
    use super::PermissionRegistry;
    use crate::error::EngineError;
    use crate::permissions::levels::{CanGrantView, CanView, PermissionKind};

    #[test]
    fn shared_registry_is_built_once() {
        let a = PermissionRegistry::shared();
        let b = PermissionRegistry::shared();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn parse_and_render() {
        let registry = PermissionRegistry::shared();

        assert_eq!(registry.rank(PermissionKind::View, "content").unwrap(), 2);
        assert_eq!(
            registry.parse::<CanGrantView>("solution_with_grant").unwrap(),
            CanGrantView::SolutionWithGrant
        );
        assert_eq!(registry.render(CanView::Info), "info");
        assert_eq!(registry.name(PermissionKind::Watch, 2), Some("answer"));
        assert_eq!(registry.name(PermissionKind::Watch, 7), None);

        // Names are per kind.
        assert!(matches!(
            registry.parse::<CanView>("enter"),
            Err(EngineError::UnknownLevel { kind: "view", .. })
        ));
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dirty-marking worklist shared by the propagation engines.
use std::collections::BTreeSet;

/// What needs to happen to a marked entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PropagationMarker {
    /// Recompute the entity itself from its sources.
    SelfOnly,

    /// The entity changed, re-mark its dependents.
    Children,
}

/// Set of marked entities, iterated in key order for deterministic passes.
///
/// An entity can carry both markers at once. Marking twice is a no-op.
#[derive(Clone, Debug)]
pub struct Worklist<K> {
    dirty: BTreeSet<K>,
    children: BTreeSet<K>,
}

impl<K> Default for Worklist<K> {
    fn default() -> Self {
        Self {
            dirty: BTreeSet::new(),
            children: BTreeSet::new(),
        }
    }
}

impl<K: Ord + Clone> Worklist<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, key: K, marker: PropagationMarker) -> bool {
        match marker {
            PropagationMarker::SelfOnly => self.dirty.insert(key),
            PropagationMarker::Children => self.children.insert(key),
        }
    }

    pub fn extend(&mut self, keys: impl IntoIterator<Item = K>, marker: PropagationMarker) {
        for key in keys {
            self.mark(key, marker);
        }
    }

    /// Removes and returns every entity carrying `marker`.
    pub fn take(&mut self, marker: PropagationMarker) -> BTreeSet<K> {
        match marker {
            PropagationMarker::SelfOnly => std::mem::take(&mut self.dirty),
            PropagationMarker::Children => std::mem::take(&mut self.children),
        }
    }

    pub fn is_marked(&self, key: &K, marker: PropagationMarker) -> bool {
        match marker {
            PropagationMarker::SelfOnly => self.dirty.contains(key),
            PropagationMarker::Children => self.children.contains(key),
        }
    }

    pub fn len(&self) -> usize {
        self.dirty.len() + self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{PropagationMarker, Worklist};

    #[test]
    fn markers_are_independent() {
        let mut worklist = Worklist::new();
        assert!(worklist.mark((1, 10), PropagationMarker::SelfOnly));
        assert!(!worklist.mark((1, 10), PropagationMarker::SelfOnly));
        assert!(worklist.mark((1, 10), PropagationMarker::Children));
        assert_eq!(worklist.len(), 2);

        let dirty = worklist.take(PropagationMarker::SelfOnly);
        assert_eq!(dirty.into_iter().collect::<Vec<_>>(), vec![(1, 10)]);
        assert!(!worklist.is_empty());
        assert!(worklist.is_marked(&(1, 10), PropagationMarker::Children));

        worklist.take(PropagationMarker::Children);
        assert!(worklist.is_empty());
    }

    #[test]
    fn take_returns_sorted_keys() {
        let mut worklist = Worklist::new();
        worklist.extend([3, 1, 2], PropagationMarker::SelfOnly);
        assert_eq!(
            worklist
                .take(PropagationMarker::SelfOnly)
                .into_iter()
                .collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::Debug;

/// Source of fresh row identifiers.
///
/// Generated identifiers are not guaranteed to be unique, callers insert them optimistically and
/// retry with a new one when they collide (see `retry_on_duplicate_key`).
pub trait IdGenerator: Send + Sync + Debug {
    fn next_id(&self) -> i64;
}

/// Uniformly random positive 63-bit identifiers.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn next_id(&self) -> i64 {
        rand::random_range(1..i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::{IdGenerator, RandomIds};

    #[test]
    fn random_ids_are_positive() {
        for _ in 0..1000 {
            assert!(RandomIds.next_id() > 0);
        }
    }
}

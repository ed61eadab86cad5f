// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for tests running against a temporary store.
use std::sync::Mutex;
use std::sync::PoisonError;

use sqlx::query_scalar;

use crate::ids::IdGenerator;
use crate::sqlite::{SqliteStore, StoreError};

/// Hands out a fixed sequence of identifiers, repeating the last one when exhausted.
///
/// Useful to force identifier collisions in tests.
#[derive(Debug)]
pub struct SequenceIds {
    ids: Mutex<(Vec<i64>, usize)>,
}

impl SequenceIds {
    pub fn new(ids: impl Into<Vec<i64>>) -> Self {
        Self {
            ids: Mutex::new((ids.into(), 0)),
        }
    }
}

impl IdGenerator for SequenceIds {
    fn next_id(&self) -> i64 {
        let mut state = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        let (ids, position) = &mut *state;
        let id = ids
            .get(*position)
            .or(ids.last())
            .copied()
            .expect("sequence is not empty");
        *position += 1;
        id
    }
}

/// Counts the committed rows of `table`.
pub async fn count_rows(store: &SqliteStore, table: &str) -> Result<i64, StoreError> {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    store
        .execute(async |pool| Ok(query_scalar(&sql).fetch_one(pool).await?))
        .await
}

#[cfg(test)]
mod tests {
    use super::SequenceIds;
    use crate::ids::IdGenerator;
    use crate::sqlite::SqliteStore;
    use crate::test_utils::count_rows;

    #[test]
    fn sequence_repeats_last() {
        let ids = SequenceIds::new([1, 2]);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 2);
    }

    #[tokio::test]
    async fn migrations_create_empty_tables() {
        let store = SqliteStore::temporary().await;
        for table in [
            "groups",
            "groups_groups",
            "groups_ancestors",
            "group_managers",
            "items",
            "items_items",
            "permissions_granted",
            "permissions_generated",
            "permissions_generated_tiers",
            "attempts",
            "results",
            "answers",
            "gradings",
        ] {
            assert_eq!(count_rows(&store, table).await.unwrap(), 0, "{table}");
        }
    }
}

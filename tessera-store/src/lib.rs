// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite storage layer for the tessera engine.
//!
//! Provides a transaction provider with strictly serialized write transactions, named advisory
//! locks with bounded waiting, a retry combinator for optimistic inserts and the embedded schema
//! migrations for all tables the engine works on.
mod ids;
mod locks;
mod retry;
pub mod sqlite;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
mod timestamp;
mod traits;

pub use ids::{IdGenerator, RandomIds};
pub use locks::{NamedLockGuard, NamedLocks};
pub use retry::{Backoff, RetryPolicy, retry_on_duplicate_key};
pub use sqlite::{DecodeError, SqliteStore, SqliteStoreBuilder, StoreError, TransactionPermit};
pub use timestamp::Timestamp;
pub use traits::Transaction;

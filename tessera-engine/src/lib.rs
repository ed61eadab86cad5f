// SPDX-License-Identifier: MIT OR Apache-2.0

//! Access-control and progress-aggregation core of a hierarchical learning platform.
//!
//! Groups form a directed acyclic graph whose transitive closure is materialized
//! ([`groups::closure`]) and whose membership edges move through a small state machine
//! ([`groups::transitions`]). Permissions granted on items are propagated down the group closure
//! and the item graph into cached, time-aware generated permissions ([`permissions`]).
//! Per-attempt results recorded at leaf items are aggregated upwards through the item graph
//! ([`results`]).
//!
//! All mutations go through [`Engine`] which runs every call in a single transaction and drives
//! the triggered propagation to a fixpoint before committing.
pub mod clock;
pub mod config;
mod engine;
mod error;
pub mod graph;
pub mod groups;
pub mod items;
pub mod permissions;
pub mod results;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod worklist;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use groups::{Group, GroupId, GroupType, RelationType};
pub use items::{Item, ItemEdge, ItemId};
pub use permissions::{PermissionGrant, PermissionLevels, PermissionRegistry};
pub use results::{AttemptId, GradingEvent, ItemResult};

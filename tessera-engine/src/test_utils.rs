// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(unused)]
use std::ops::Deref;
use std::time::Duration;

use tessera_store::{IdGenerator, RetryPolicy, SqliteStore, Timestamp};

use crate::clock::ManualClock;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::groups::{EdgeAttributes, Group, GroupId, GroupType};
use crate::items::{Item, ItemEdge, ItemId};
use crate::permissions::{CanView, PermissionGrant};

/// Start time of the manual clock of every test engine.
pub const T0: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// Group every test grant is given by.
pub const GIVER: GroupId = 1;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Engine over a temporary in-memory store with a manual clock.
#[derive(Clone, Debug)]
pub struct TestEngine {
    pub engine: Engine,
    pub clock: ManualClock,
}

impl Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_engine(|engine| engine).await
    }

    pub async fn with_ids(ids: impl IdGenerator + 'static) -> Self {
        Self::with_engine(|engine| engine.id_generator(ids)).await
    }

    async fn with_engine(f: impl FnOnce(Engine) -> Engine) -> Self {
        setup_logging();

        let store = SqliteStore::temporary().await;
        let clock = ManualClock::new(T0);
        let config = EngineConfig::default()
            .lock_timeout(Duration::from_millis(500))
            .retry(RetryPolicy::default().no_backoff());
        let engine = f(Engine::new(store).config(config).clock(clock.clone()));

        let test_engine = Self { engine, clock };
        test_engine.add_group(GIVER, GroupType::AdminRoot).await;
        test_engine
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub async fn add_group(&self, id: GroupId, group_type: GroupType) {
        self.engine
            .create_group(&Group::new(id, group_type))
            .await
            .unwrap();
    }

    pub async fn add_groups(&self, ids: &[GroupId], group_type: GroupType) {
        for id in ids {
            self.add_group(*id, group_type).await;
        }
    }

    pub async fn relate(&self, parent: GroupId, child: GroupId) {
        self.engine
            .create_relation(parent, child, &EdgeAttributes::default())
            .await
            .unwrap();
    }

    pub async fn item(&self, item: Item) {
        self.engine.create_item(&item).await.unwrap();
    }

    pub async fn items(&self, ids: &[ItemId]) {
        for id in ids {
            self.item(Item::new(*id)).await;
        }
    }

    pub async fn item_edge(&self, edge: ItemEdge) {
        self.engine.create_item_edge(&edge).await.unwrap();
    }

    pub async fn grant_view(&self, group: GroupId, item: ItemId, level: CanView) {
        self.engine
            .grant_permission(&PermissionGrant::new(group, item, GIVER).can_view(level))
            .await
            .unwrap();
    }

    pub async fn can_view(&self, group: GroupId, item: ItemId) -> CanView {
        self.engine
            .generated_permission(group, item)
            .await
            .unwrap()
            .map(|generated| generated.levels.can_view)
            .unwrap_or_default()
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

use sqlx::{FromRow, query, query_as, query_scalar};
use tessera_store::{SqliteStore, StoreError, Timestamp};

use crate::groups::{GroupId, decode};
use crate::items::ItemId;
use crate::permissions::{
    CanEdit, CanGrantView, CanView, CanWatch, Component, GeneratedPermission, Level,
    PermissionGrant, PermissionLevels, Tier, Tiers,
};

/// `?, ?, ..` with `count` placeholders.
fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Store API for granted and generated permissions.
pub trait PermissionStore {
    /// Inserts the grant or replaces the levels of an existing one from the same giver.
    fn upsert_grant(&self, grant: &PermissionGrant)
    -> impl Future<Output = Result<(), StoreError>>;

    fn delete_grant(
        &self,
        group: GroupId,
        item: ItemId,
        giver: GroupId,
    ) -> impl Future<Output = Result<bool, StoreError>>;

    /// Grants on `item` to `group` or any of its ancestors not expired at `now`.
    fn effective_grants(
        &self,
        group: GroupId,
        item: ItemId,
        now: Timestamp,
    ) -> impl Future<Output = Result<Vec<PermissionGrant>, StoreError>>;

    /// Items granted to `group` or any of its ancestors not expired at `now`.
    fn granted_items(
        &self,
        group: GroupId,
        now: Timestamp,
    ) -> impl Future<Output = Result<Vec<ItemId>, StoreError>>;

    fn generated(
        &self,
        group: GroupId,
        item: ItemId,
    ) -> impl Future<Output = Result<Option<GeneratedPermission>, StoreError>>;

    fn generated_tiers(
        &self,
        group: GroupId,
        item: ItemId,
    ) -> impl Future<Output = Result<Tiers, StoreError>>;

    /// Replaces the generated permission of the pair, deleting it if `tiers` is empty.
    fn write_generated(
        &self,
        group: GroupId,
        item: ItemId,
        tiers: &Tiers,
        now: Timestamp,
    ) -> impl Future<Output = Result<(), StoreError>>;

    /// Re-derives the cached levels of the pair from its stored tiers.
    fn refresh_cached(
        &self,
        group: GroupId,
        item: ItemId,
        now: Timestamp,
    ) -> impl Future<Output = Result<(), StoreError>>;

    /// Pairs of the given groups which have a generated permission.
    fn generated_pairs(
        &self,
        groups: &[GroupId],
    ) -> impl Future<Output = Result<Vec<(GroupId, ItemId)>, StoreError>>;

    /// Groups with a generated permission on any of the given items.
    fn groups_with_generated(
        &self,
        items: &[ItemId],
    ) -> impl Future<Output = Result<Vec<GroupId>, StoreError>>;

    /// Whether `user` or one of its non-expired ancestors has `can_view >= info` on `item` or
    /// on any item above it.
    fn visible_in_item_ancestry(
        &self,
        user: GroupId,
        item: ItemId,
        now: Timestamp,
    ) -> impl Future<Output = Result<bool, StoreError>>;

    /// Pairs with a tier which became active after the pair was last computed.
    fn pairs_with_pending_activation(
        &self,
        now: Timestamp,
    ) -> impl Future<Output = Result<Vec<(GroupId, ItemId)>, StoreError>>;

    /// Pairs of groups with an ancestor row which expired after the pair was last computed.
    fn pairs_with_expired_ancestry(
        &self,
        now: Timestamp,
    ) -> impl Future<Output = Result<Vec<(GroupId, ItemId)>, StoreError>>;

    /// Component-wise maximum of the generated permissions of `user` and its ancestors.
    fn user_levels(
        &self,
        user: GroupId,
        item: ItemId,
        now: Timestamp,
    ) -> impl Future<Output = Result<PermissionLevels, StoreError>>;
}

#[derive(FromRow)]
struct GrantRow {
    group_id: GroupId,
    item_id: ItemId,
    giver_group_id: GroupId,
    can_view: u8,
    can_grant_view: u8,
    can_watch: u8,
    can_edit: u8,
    is_owner: bool,
    since: Option<Timestamp>,
}

impl From<GrantRow> for PermissionGrant {
    fn from(row: GrantRow) -> Self {
        PermissionGrant {
            group: row.group_id,
            item: row.item_id,
            giver: row.giver_group_id,
            can_view: CanView::from_rank_saturating(row.can_view),
            can_grant_view: CanGrantView::from_rank_saturating(row.can_grant_view),
            can_watch: CanWatch::from_rank_saturating(row.can_watch),
            can_edit: CanEdit::from_rank_saturating(row.can_edit),
            is_owner: row.is_owner,
            since: row.since,
        }
    }
}

#[derive(FromRow)]
struct GeneratedRow {
    group_id: GroupId,
    item_id: ItemId,
    can_view: u8,
    can_grant_view: u8,
    can_watch: u8,
    can_edit: u8,
    is_owner: bool,
    is_grayed: bool,
    computed_at: Timestamp,
}

impl GeneratedRow {
    fn levels(&self) -> PermissionLevels {
        PermissionLevels {
            can_view: CanView::from_rank_saturating(self.can_view),
            can_grant_view: CanGrantView::from_rank_saturating(self.can_grant_view),
            can_watch: CanWatch::from_rank_saturating(self.can_watch),
            can_edit: CanEdit::from_rank_saturating(self.can_edit),
            is_owner: self.is_owner,
            is_grayed: self.is_grayed,
        }
    }
}

impl From<GeneratedRow> for GeneratedPermission {
    fn from(row: GeneratedRow) -> Self {
        GeneratedPermission {
            group: row.group_id,
            item: row.item_id,
            levels: row.levels(),
            computed_at: row.computed_at,
        }
    }
}

impl PermissionStore for SqliteStore {
    async fn upsert_grant(&self, grant: &PermissionGrant) -> Result<(), StoreError> {
        self.tx(async |tx| {
            query(
                "
                INSERT INTO
                    permissions_granted (
                        group_id,
                        item_id,
                        giver_group_id,
                        can_view,
                        can_grant_view,
                        can_watch,
                        can_edit,
                        is_owner,
                        since
                    )
                VALUES
                    (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (group_id, item_id, giver_group_id) DO UPDATE SET
                    can_view = excluded.can_view,
                    can_grant_view = excluded.can_grant_view,
                    can_watch = excluded.can_watch,
                    can_edit = excluded.can_edit,
                    is_owner = excluded.is_owner,
                    since = excluded.since
                ",
            )
            .bind(grant.group)
            .bind(grant.item)
            .bind(grant.giver)
            .bind(grant.can_view.rank())
            .bind(grant.can_grant_view.rank())
            .bind(grant.can_watch.rank())
            .bind(grant.can_edit.rank())
            .bind(grant.is_owner)
            .bind(grant.since)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
        .await
    }

    async fn delete_grant(
        &self,
        group: GroupId,
        item: ItemId,
        giver: GroupId,
    ) -> Result<bool, StoreError> {
        let result = self
            .tx(async |tx| {
                Ok(query(
                    "
                    DELETE FROM
                        permissions_granted
                    WHERE
                        group_id = ?
                        AND item_id = ?
                        AND giver_group_id = ?
                    ",
                )
                .bind(group)
                .bind(item)
                .bind(giver)
                .execute(&mut **tx)
                .await?)
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn effective_grants(
        &self,
        group: GroupId,
        item: ItemId,
        now: Timestamp,
    ) -> Result<Vec<PermissionGrant>, StoreError> {
        let rows = self
            .tx(async |tx| {
                Ok(query_as::<_, GrantRow>(
                    "
                    SELECT
                        permissions_granted.group_id,
                        permissions_granted.item_id,
                        permissions_granted.giver_group_id,
                        permissions_granted.can_view,
                        permissions_granted.can_grant_view,
                        permissions_granted.can_watch,
                        permissions_granted.can_edit,
                        permissions_granted.is_owner,
                        permissions_granted.since
                    FROM
                        permissions_granted
                    JOIN groups_ancestors
                        ON groups_ancestors.ancestor_group_id = permissions_granted.group_id
                    WHERE
                        groups_ancestors.child_group_id = ?1
                        AND permissions_granted.item_id = ?2
                        AND (groups_ancestors.expires_at IS NULL OR groups_ancestors.expires_at > ?3)
                    ",
                )
                .bind(group)
                .bind(item)
                .bind(now)
                .fetch_all(&mut **tx)
                .await?)
            })
            .await?;
        Ok(rows.into_iter().map(PermissionGrant::from).collect())
    }

    async fn granted_items(&self, group: GroupId, now: Timestamp) -> Result<Vec<ItemId>, StoreError> {
        self.tx(async |tx| {
            Ok(sqlx::query_scalar(
                "
                SELECT DISTINCT
                    permissions_granted.item_id
                FROM
                    permissions_granted
                JOIN groups_ancestors
                    ON groups_ancestors.ancestor_group_id = permissions_granted.group_id
                WHERE
                    groups_ancestors.child_group_id = ?1
                    AND (groups_ancestors.expires_at IS NULL OR groups_ancestors.expires_at > ?2)
                ORDER BY
                    permissions_granted.item_id
                ",
            )
            .bind(group)
            .bind(now)
            .fetch_all(&mut **tx)
            .await?)
        })
        .await
    }

    async fn generated(
        &self,
        group: GroupId,
        item: ItemId,
    ) -> Result<Option<GeneratedPermission>, StoreError> {
        let row = self
            .tx(async |tx| {
                Ok(query_as::<_, GeneratedRow>(
                    "
                    SELECT
                        group_id,
                        item_id,
                        can_view,
                        can_grant_view,
                        can_watch,
                        can_edit,
                        is_owner,
                        is_grayed,
                        computed_at
                    FROM
                        permissions_generated
                    WHERE
                        group_id = ?
                        AND item_id = ?
                    ",
                )
                .bind(group)
                .bind(item)
                .fetch_optional(&mut **tx)
                .await?)
            })
            .await?;
        Ok(row.map(GeneratedPermission::from))
    }

    async fn generated_tiers(&self, group: GroupId, item: ItemId) -> Result<Tiers, StoreError> {
        let rows: Vec<(String, u8, Option<Timestamp>)> = self
            .tx(async |tx| {
                Ok(query_as(
                    "
                    SELECT
                        component,
                        level,
                        since
                    FROM
                        permissions_generated_tiers
                    WHERE
                        group_id = ?
                        AND item_id = ?
                    ORDER BY
                        component,
                        level
                    ",
                )
                .bind(group)
                .bind(item)
                .fetch_all(&mut **tx)
                .await?)
            })
            .await?;

        rows.into_iter()
            .map(|(component, level, since)| {
                let component: Component = decode("component", &component)?;
                Ok((component, Tier { level, since }))
            })
            .collect()
    }

    async fn write_generated(
        &self,
        group: GroupId,
        item: ItemId,
        tiers: &Tiers,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let levels = PermissionLevels::at(tiers, now);

        self.tx(async |tx| {
            // Tiers are removed through the foreign key cascade.
            query(
                "
                DELETE FROM
                    permissions_generated
                WHERE
                    group_id = ?
                    AND item_id = ?
                ",
            )
            .bind(group)
            .bind(item)
            .execute(&mut **tx)
            .await?;

            if tiers.is_empty() {
                return Ok(());
            }

            query(
                "
                INSERT INTO
                    permissions_generated (
                        group_id,
                        item_id,
                        can_view,
                        can_grant_view,
                        can_watch,
                        can_edit,
                        is_owner,
                        is_grayed,
                        computed_at
                    )
                VALUES
                    (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(group)
            .bind(item)
            .bind(levels.can_view.rank())
            .bind(levels.can_grant_view.rank())
            .bind(levels.can_watch.rank())
            .bind(levels.can_edit.rank())
            .bind(levels.is_owner)
            .bind(levels.is_grayed)
            .bind(now)
            .execute(&mut **tx)
            .await?;

            for (component, tier) in tiers.iter() {
                query(
                    "
                    INSERT INTO
                        permissions_generated_tiers (
                            group_id,
                            item_id,
                            component,
                            level,
                            since
                        )
                    VALUES
                        (?, ?, ?, ?, ?)
                    ",
                )
                .bind(group)
                .bind(item)
                .bind(component.as_str())
                .bind(tier.level)
                .bind(tier.since)
                .execute(&mut **tx)
                .await?;
            }

            Ok(())
        })
        .await
    }

    async fn refresh_cached(
        &self,
        group: GroupId,
        item: ItemId,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let tiers = self.generated_tiers(group, item).await?;
        let levels = PermissionLevels::at(&tiers, now);

        self.tx(async |tx| {
            query(
                "
                UPDATE
                    permissions_generated
                SET
                    can_view = ?,
                    can_grant_view = ?,
                    can_watch = ?,
                    can_edit = ?,
                    is_owner = ?,
                    is_grayed = ?,
                    computed_at = ?
                WHERE
                    group_id = ?
                    AND item_id = ?
                ",
            )
            .bind(levels.can_view.rank())
            .bind(levels.can_grant_view.rank())
            .bind(levels.can_watch.rank())
            .bind(levels.can_edit.rank())
            .bind(levels.is_owner)
            .bind(levels.is_grayed)
            .bind(now)
            .bind(group)
            .bind(item)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
        .await
    }

    async fn generated_pairs(
        &self,
        groups: &[GroupId],
    ) -> Result<Vec<(GroupId, ItemId)>, StoreError> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "
            SELECT
                group_id,
                item_id
            FROM
                permissions_generated
            WHERE
                group_id IN ({})
            ORDER BY
                group_id,
                item_id
            ",
            placeholders(groups.len())
        );
        self.tx(async |tx| {
            let mut pairs = query_as::<_, (GroupId, ItemId)>(&sql);
            for group in groups {
                pairs = pairs.bind(group);
            }
            Ok(pairs.fetch_all(&mut **tx).await?)
        })
        .await
    }

    async fn groups_with_generated(&self, items: &[ItemId]) -> Result<Vec<GroupId>, StoreError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "
            SELECT DISTINCT
                group_id
            FROM
                permissions_generated
            WHERE
                item_id IN ({})
            ORDER BY
                group_id
            ",
            placeholders(items.len())
        );
        self.tx(async |tx| {
            let mut groups = query_scalar::<_, GroupId>(&sql);
            for item in items {
                groups = groups.bind(item);
            }
            Ok(groups.fetch_all(&mut **tx).await?)
        })
        .await
    }

    async fn visible_in_item_ancestry(
        &self,
        user: GroupId,
        item: ItemId,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        self.tx(async |tx| {
            let visible: bool = query_scalar(
                "
                WITH RECURSIVE item_ancestors (item_id) AS (
                    SELECT ?2
                    UNION
                    SELECT
                        items_items.parent_item_id
                    FROM
                        items_items
                    JOIN item_ancestors
                        ON item_ancestors.item_id = items_items.child_item_id
                )
                SELECT EXISTS (
                    SELECT
                        1
                    FROM
                        permissions_generated
                    JOIN item_ancestors
                        ON item_ancestors.item_id = permissions_generated.item_id
                    JOIN groups_ancestors
                        ON groups_ancestors.ancestor_group_id = permissions_generated.group_id
                    WHERE
                        groups_ancestors.child_group_id = ?1
                        AND (groups_ancestors.expires_at IS NULL OR groups_ancestors.expires_at > ?3)
                        AND permissions_generated.can_view >= ?4
                )
                ",
            )
            .bind(user)
            .bind(item)
            .bind(now)
            .bind(CanView::Info.rank())
            .fetch_one(&mut **tx)
            .await?;
            Ok(visible)
        })
        .await
    }

    async fn pairs_with_pending_activation(
        &self,
        now: Timestamp,
    ) -> Result<Vec<(GroupId, ItemId)>, StoreError> {
        self.tx(async |tx| {
            Ok(query_as(
                "
                SELECT DISTINCT
                    permissions_generated.group_id,
                    permissions_generated.item_id
                FROM
                    permissions_generated
                JOIN permissions_generated_tiers AS tiers
                    ON tiers.group_id = permissions_generated.group_id
                    AND tiers.item_id = permissions_generated.item_id
                WHERE
                    tiers.since > permissions_generated.computed_at
                    AND tiers.since <= ?
                ORDER BY
                    permissions_generated.group_id,
                    permissions_generated.item_id
                ",
            )
            .bind(now)
            .fetch_all(&mut **tx)
            .await?)
        })
        .await
    }

    async fn pairs_with_expired_ancestry(
        &self,
        now: Timestamp,
    ) -> Result<Vec<(GroupId, ItemId)>, StoreError> {
        self.tx(async |tx| {
            Ok(query_as(
                "
                SELECT DISTINCT
                    permissions_generated.group_id,
                    permissions_generated.item_id
                FROM
                    permissions_generated
                JOIN groups_ancestors
                    ON groups_ancestors.child_group_id = permissions_generated.group_id
                WHERE
                    groups_ancestors.expires_at > permissions_generated.computed_at
                    AND groups_ancestors.expires_at <= ?
                ORDER BY
                    permissions_generated.group_id,
                    permissions_generated.item_id
                ",
            )
            .bind(now)
            .fetch_all(&mut **tx)
            .await?)
        })
        .await
    }

    async fn user_levels(
        &self,
        user: GroupId,
        item: ItemId,
        now: Timestamp,
    ) -> Result<PermissionLevels, StoreError> {
        let rows = self
            .tx(async |tx| {
                Ok(query_as::<_, GeneratedRow>(
                    "
                    SELECT
                        permissions_generated.group_id,
                        permissions_generated.item_id,
                        permissions_generated.can_view,
                        permissions_generated.can_grant_view,
                        permissions_generated.can_watch,
                        permissions_generated.can_edit,
                        permissions_generated.is_owner,
                        permissions_generated.is_grayed,
                        permissions_generated.computed_at
                    FROM
                        permissions_generated
                    JOIN groups_ancestors
                        ON groups_ancestors.ancestor_group_id = permissions_generated.group_id
                    WHERE
                        groups_ancestors.child_group_id = ?1
                        AND permissions_generated.item_id = ?2
                        AND (groups_ancestors.expires_at IS NULL OR groups_ancestors.expires_at > ?3)
                    ",
                )
                .bind(user)
                .bind(item)
                .bind(now)
                .fetch_all(&mut **tx)
                .await?)
            })
            .await?;

        Ok(rows
            .iter()
            .map(GeneratedRow::levels)
            .fold(PermissionLevels::default(), PermissionLevels::max))
    }
}

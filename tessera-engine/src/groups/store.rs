// SPDX-License-Identifier: MIT OR Apache-2.0

use sqlx::{FromRow, query, query_as, query_scalar};
use tessera_store::{SqliteStore, StoreError, Timestamp};

use crate::groups::{
    AncestorEntry, EdgeAttributes, EdgeId, Group, GroupEdge, GroupId, RelationType, decode,
};
use crate::items::ItemId;

/// Store API for groups, their edges, managers and the materialized ancestor closure.
///
/// All methods run inside the currently open transaction.
pub trait GroupStore {
    fn insert_group(&self, group: &Group) -> impl Future<Output = Result<(), StoreError>>;

    fn group(&self, id: GroupId) -> impl Future<Output = Result<Option<Group>, StoreError>>;

    fn group_ids(&self) -> impl Future<Output = Result<Vec<GroupId>, StoreError>>;

    /// Removes groups together with their edges, closure rows and permissions.
    fn delete_groups(&self, ids: &[GroupId]) -> impl Future<Output = Result<u64, StoreError>>;

    fn edge(
        &self,
        parent: GroupId,
        child: GroupId,
    ) -> impl Future<Output = Result<Option<GroupEdge>, StoreError>>;

    /// Inserts the edge or updates its state, returning its id.
    ///
    /// `status_changed_at` is only moved forward when the relation type differs from the stored
    /// one. Unset attributes keep their stored (or default) values, except for the expiry of an
    /// edge becoming active which is always taken from `attributes`.
    fn upsert_edge(
        &self,
        parent: GroupId,
        child: GroupId,
        relation_type: RelationType,
        leave_requested: bool,
        attributes: &EdgeAttributes,
        now: Timestamp,
    ) -> impl Future<Output = Result<EdgeId, StoreError>>;

    fn delete_edge(
        &self,
        parent: GroupId,
        child: GroupId,
    ) -> impl Future<Output = Result<bool, StoreError>>;

    /// All `active` edges as `(parent, child, expires_at)`, expired ones included.
    fn active_edges(
        &self,
    ) -> impl Future<Output = Result<Vec<(GroupId, GroupId, Option<Timestamp>)>, StoreError>>;

    fn active_parents(
        &self,
        child: GroupId,
    ) -> impl Future<Output = Result<Vec<GroupId>, StoreError>>;

    fn ancestor_entries(&self) -> impl Future<Output = Result<Vec<AncestorEntry>, StoreError>>;

    fn ancestors(
        &self,
        child: GroupId,
    ) -> impl Future<Output = Result<Vec<AncestorEntry>, StoreError>>;

    fn descendants(
        &self,
        ancestor: GroupId,
    ) -> impl Future<Output = Result<Vec<AncestorEntry>, StoreError>>;

    /// Returns `true` if a closure row `(ancestor, child)` exists, expired or not.
    fn is_ancestor(
        &self,
        ancestor: GroupId,
        child: GroupId,
    ) -> impl Future<Output = Result<bool, StoreError>>;

    fn upsert_ancestors(
        &self,
        entries: &[AncestorEntry],
    ) -> impl Future<Output = Result<(), StoreError>>;

    fn delete_ancestors(
        &self,
        pairs: &[(GroupId, GroupId)],
    ) -> impl Future<Output = Result<(), StoreError>>;

    fn add_manager(
        &self,
        group: GroupId,
        manager: GroupId,
    ) -> impl Future<Output = Result<bool, StoreError>>;

    /// Returns `true` if a group `actor` is a member of manages `group` or one of its ancestors.
    fn manages(
        &self,
        actor: GroupId,
        group: GroupId,
        now: Timestamp,
    ) -> impl Future<Output = Result<bool, StoreError>>;

    /// Teams bound to `team_item` other than `except` which `child` is currently an active
    /// member of.
    fn team_memberships(
        &self,
        child: GroupId,
        team_item: ItemId,
        except: GroupId,
        now: Timestamp,
    ) -> impl Future<Output = Result<Vec<GroupId>, StoreError>>;
}

#[derive(FromRow)]
struct GroupRow {
    id: GroupId,
    name: String,
    #[sqlx(rename = "type")]
    group_type: String,
    free_access: bool,
    lock_user_deletion_until: Option<Timestamp>,
    require_lock_membership_approval_until: Option<Timestamp>,
    team_item_id: Option<ItemId>,
}

impl TryFrom<GroupRow> for Group {
    type Error = StoreError;

    fn try_from(row: GroupRow) -> Result<Self, Self::Error> {
        Ok(Group {
            id: row.id,
            name: row.name,
            group_type: decode("type", &row.group_type)?,
            free_access: row.free_access,
            lock_user_deletion_until: row.lock_user_deletion_until,
            require_lock_membership_approval_until: row.require_lock_membership_approval_until,
            team_item_id: row.team_item_id,
        })
    }
}

#[derive(FromRow)]
struct EdgeRow {
    id: EdgeId,
    parent_group_id: GroupId,
    child_group_id: GroupId,
    role: String,
    relation_type: String,
    lock_membership_approved: bool,
    leave_requested: bool,
    expires_at: Option<Timestamp>,
    status_changed_at: Timestamp,
}

impl TryFrom<EdgeRow> for GroupEdge {
    type Error = StoreError;

    fn try_from(row: EdgeRow) -> Result<Self, Self::Error> {
        Ok(GroupEdge {
            id: row.id,
            parent: row.parent_group_id,
            child: row.child_group_id,
            role: row.role,
            relation_type: decode("relation_type", &row.relation_type)?,
            lock_membership_approved: row.lock_membership_approved,
            leave_requested: row.leave_requested,
            expires_at: row.expires_at,
            status_changed_at: row.status_changed_at,
        })
    }
}

#[derive(FromRow)]
struct AncestorRow {
    ancestor_group_id: GroupId,
    child_group_id: GroupId,
    is_self: bool,
    expires_at: Option<Timestamp>,
}

impl From<AncestorRow> for AncestorEntry {
    fn from(row: AncestorRow) -> Self {
        AncestorEntry {
            ancestor: row.ancestor_group_id,
            child: row.child_group_id,
            is_self: row.is_self,
            expires_at: row.expires_at,
        }
    }
}

impl GroupStore for SqliteStore {
    async fn insert_group(&self, group: &Group) -> Result<(), StoreError> {
        self.tx(async |tx| {
            query(
                "
                INSERT INTO
                    groups (
                        id,
                        name,
                        type,
                        free_access,
                        lock_user_deletion_until,
                        require_lock_membership_approval_until,
                        team_item_id
                    )
                VALUES
                    (?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(group.id)
            .bind(&group.name)
            .bind(group.group_type.as_str())
            .bind(group.free_access)
            .bind(group.lock_user_deletion_until)
            .bind(group.require_lock_membership_approval_until)
            .bind(group.team_item_id)
            .execute(&mut **tx)
            .await?;

            // Every group is its own ancestor.
            query(
                "
                INSERT OR IGNORE INTO
                    groups_ancestors (ancestor_group_id, child_group_id, is_self, expires_at)
                VALUES
                    (?, ?, 1, NULL)
                ",
            )
            .bind(group.id)
            .bind(group.id)
            .execute(&mut **tx)
            .await?;

            Ok(())
        })
        .await
    }

    async fn group(&self, id: GroupId) -> Result<Option<Group>, StoreError> {
        let row = self
            .tx(async |tx| {
                Ok(query_as::<_, GroupRow>(
                    "
                    SELECT
                        id,
                        name,
                        type,
                        free_access,
                        lock_user_deletion_until,
                        require_lock_membership_approval_until,
                        team_item_id
                    FROM
                        groups
                    WHERE
                        id = ?
                    ",
                )
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?)
            })
            .await?;

        row.map(Group::try_from).transpose()
    }

    async fn group_ids(&self) -> Result<Vec<GroupId>, StoreError> {
        self.tx(async |tx| {
            Ok(query_scalar("SELECT id FROM groups ORDER BY id")
                .fetch_all(&mut **tx)
                .await?)
        })
        .await
    }

    async fn delete_groups(&self, ids: &[GroupId]) -> Result<u64, StoreError> {
        self.tx(async |tx| {
            let mut deleted = 0;
            for id in ids {
                deleted += query("DELETE FROM groups WHERE id = ?")
                    .bind(id)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected();
            }
            Ok(deleted)
        })
        .await
    }

    async fn edge(&self, parent: GroupId, child: GroupId) -> Result<Option<GroupEdge>, StoreError> {
        let row = self
            .tx(async |tx| {
                Ok(query_as::<_, EdgeRow>(
                    "
                    SELECT
                        id,
                        parent_group_id,
                        child_group_id,
                        role,
                        relation_type,
                        lock_membership_approved,
                        leave_requested,
                        expires_at,
                        status_changed_at
                    FROM
                        groups_groups
                    WHERE
                        parent_group_id = ?
                        AND child_group_id = ?
                    ",
                )
                .bind(parent)
                .bind(child)
                .fetch_optional(&mut **tx)
                .await?)
            })
            .await?;

        row.map(GroupEdge::try_from).transpose()
    }

    async fn upsert_edge(
        &self,
        parent: GroupId,
        child: GroupId,
        relation_type: RelationType,
        leave_requested: bool,
        attributes: &EdgeAttributes,
        now: Timestamp,
    ) -> Result<EdgeId, StoreError> {
        self.tx(async |tx| {
            Ok(query_scalar(
                "
                INSERT INTO
                    groups_groups (
                        parent_group_id,
                        child_group_id,
                        role,
                        relation_type,
                        lock_membership_approved,
                        leave_requested,
                        expires_at,
                        status_changed_at
                    )
                VALUES
                    (?1, ?2, COALESCE(?3, 'member'), ?4, COALESCE(?5, 0), ?6, ?7, ?8)
                ON CONFLICT (parent_group_id, child_group_id) DO UPDATE SET
                    role = COALESCE(?3, groups_groups.role),
                    lock_membership_approved = COALESCE(?5, groups_groups.lock_membership_approved),
                    leave_requested = excluded.leave_requested,
                    expires_at = CASE
                        WHEN excluded.relation_type = 'active'
                            AND groups_groups.relation_type != 'active'
                        THEN ?7
                        ELSE COALESCE(?7, groups_groups.expires_at)
                    END,
                    status_changed_at = CASE
                        WHEN groups_groups.relation_type != excluded.relation_type
                        THEN excluded.status_changed_at
                        ELSE groups_groups.status_changed_at
                    END,
                    relation_type = excluded.relation_type
                RETURNING
                    id
                ",
            )
            .bind(parent)
            .bind(child)
            .bind(attributes.role.as_deref())
            .bind(relation_type.as_str())
            .bind(attributes.lock_membership_approved)
            .bind(leave_requested)
            .bind(attributes.expires_at)
            .bind(now)
            .fetch_one(&mut **tx)
            .await?)
        })
        .await
    }

    async fn delete_edge(&self, parent: GroupId, child: GroupId) -> Result<bool, StoreError> {
        let result = self
            .tx(async |tx| {
                Ok(query(
                    "
                    DELETE FROM
                        groups_groups
                    WHERE
                        parent_group_id = ?
                        AND child_group_id = ?
                    ",
                )
                .bind(parent)
                .bind(child)
                .execute(&mut **tx)
                .await?)
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_edges(&self) -> Result<Vec<(GroupId, GroupId, Option<Timestamp>)>, StoreError> {
        self.tx(async |tx| {
            Ok(query_as(
                "
                SELECT
                    parent_group_id,
                    child_group_id,
                    expires_at
                FROM
                    groups_groups
                WHERE
                    relation_type = 'active'
                ",
            )
            .fetch_all(&mut **tx)
            .await?)
        })
        .await
    }

    async fn active_parents(&self, child: GroupId) -> Result<Vec<GroupId>, StoreError> {
        self.tx(async |tx| {
            Ok(query_scalar(
                "
                SELECT
                    parent_group_id
                FROM
                    groups_groups
                WHERE
                    child_group_id = ?
                    AND relation_type = 'active'
                ORDER BY
                    parent_group_id
                ",
            )
            .bind(child)
            .fetch_all(&mut **tx)
            .await?)
        })
        .await
    }

    async fn ancestor_entries(&self) -> Result<Vec<AncestorEntry>, StoreError> {
        let rows = self
            .tx(async |tx| {
                Ok(query_as::<_, AncestorRow>(
                    "
                    SELECT
                        ancestor_group_id,
                        child_group_id,
                        is_self,
                        expires_at
                    FROM
                        groups_ancestors
                    ",
                )
                .fetch_all(&mut **tx)
                .await?)
            })
            .await?;
        Ok(rows.into_iter().map(AncestorEntry::from).collect())
    }

    async fn ancestors(&self, child: GroupId) -> Result<Vec<AncestorEntry>, StoreError> {
        let rows = self
            .tx(async |tx| {
                Ok(query_as::<_, AncestorRow>(
                    "
                    SELECT
                        ancestor_group_id,
                        child_group_id,
                        is_self,
                        expires_at
                    FROM
                        groups_ancestors
                    WHERE
                        child_group_id = ?
                    ORDER BY
                        ancestor_group_id
                    ",
                )
                .bind(child)
                .fetch_all(&mut **tx)
                .await?)
            })
            .await?;
        Ok(rows.into_iter().map(AncestorEntry::from).collect())
    }

    async fn descendants(&self, ancestor: GroupId) -> Result<Vec<AncestorEntry>, StoreError> {
        let rows = self
            .tx(async |tx| {
                Ok(query_as::<_, AncestorRow>(
                    "
                    SELECT
                        ancestor_group_id,
                        child_group_id,
                        is_self,
                        expires_at
                    FROM
                        groups_ancestors
                    WHERE
                        ancestor_group_id = ?
                    ORDER BY
                        child_group_id
                    ",
                )
                .bind(ancestor)
                .fetch_all(&mut **tx)
                .await?)
            })
            .await?;
        Ok(rows.into_iter().map(AncestorEntry::from).collect())
    }

    async fn is_ancestor(&self, ancestor: GroupId, child: GroupId) -> Result<bool, StoreError> {
        self.tx(async |tx| {
            Ok(query_scalar(
                "
                SELECT EXISTS (
                    SELECT
                        1
                    FROM
                        groups_ancestors
                    WHERE
                        ancestor_group_id = ?
                        AND child_group_id = ?
                )
                ",
            )
            .bind(ancestor)
            .bind(child)
            .fetch_one(&mut **tx)
            .await?)
        })
        .await
    }

    async fn upsert_ancestors(&self, entries: &[AncestorEntry]) -> Result<(), StoreError> {
        self.tx(async |tx| {
            for entry in entries {
                query(
                    "
                    INSERT INTO
                        groups_ancestors (
                            ancestor_group_id,
                            child_group_id,
                            is_self,
                            expires_at
                        )
                    VALUES
                        (?, ?, ?, ?)
                    ON CONFLICT (ancestor_group_id, child_group_id) DO UPDATE SET
                        is_self = excluded.is_self,
                        expires_at = excluded.expires_at
                    ",
                )
                .bind(entry.ancestor)
                .bind(entry.child)
                .bind(entry.is_self)
                .bind(entry.expires_at)
                .execute(&mut **tx)
                .await?;
            }
            Ok(())
        })
        .await
    }

    async fn delete_ancestors(&self, pairs: &[(GroupId, GroupId)]) -> Result<(), StoreError> {
        self.tx(async |tx| {
            for (ancestor, child) in pairs {
                query(
                    "
                    DELETE FROM
                        groups_ancestors
                    WHERE
                        ancestor_group_id = ?
                        AND child_group_id = ?
                    ",
                )
                .bind(ancestor)
                .bind(child)
                .execute(&mut **tx)
                .await?;
            }
            Ok(())
        })
        .await
    }

    async fn add_manager(&self, group: GroupId, manager: GroupId) -> Result<bool, StoreError> {
        let result = self
            .tx(async |tx| {
                Ok(query(
                    "
                    INSERT OR IGNORE INTO
                        group_managers (group_id, manager_id)
                    VALUES
                        (?, ?)
                    ",
                )
                .bind(group)
                .bind(manager)
                .execute(&mut **tx)
                .await?)
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn manages(
        &self,
        actor: GroupId,
        group: GroupId,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        self.tx(async |tx| {
            Ok(query_scalar(
                "
                SELECT EXISTS (
                    SELECT
                        1
                    FROM
                        group_managers
                    JOIN groups_ancestors AS actor_ancestors
                        ON actor_ancestors.ancestor_group_id = group_managers.manager_id
                    JOIN groups_ancestors AS group_ancestors
                        ON group_ancestors.ancestor_group_id = group_managers.group_id
                    WHERE
                        actor_ancestors.child_group_id = ?1
                        AND group_ancestors.child_group_id = ?2
                        AND (actor_ancestors.expires_at IS NULL OR actor_ancestors.expires_at > ?3)
                        AND (group_ancestors.expires_at IS NULL OR group_ancestors.expires_at > ?3)
                )
                ",
            )
            .bind(actor)
            .bind(group)
            .bind(now)
            .fetch_one(&mut **tx)
            .await?)
        })
        .await
    }

    async fn team_memberships(
        &self,
        child: GroupId,
        team_item: ItemId,
        except: GroupId,
        now: Timestamp,
    ) -> Result<Vec<GroupId>, StoreError> {
        self.tx(async |tx| {
            Ok(query_scalar(
                "
                SELECT
                    groups.id
                FROM
                    groups
                JOIN groups_groups
                    ON groups_groups.parent_group_id = groups.id
                WHERE
                    groups.type = 'Team'
                    AND groups.team_item_id = ?1
                    AND groups.id != ?2
                    AND groups_groups.child_group_id = ?3
                    AND groups_groups.relation_type = 'active'
                    AND (groups_groups.expires_at IS NULL OR groups_groups.expires_at > ?4)
                ORDER BY
                    groups.id
                ",
            )
            .bind(team_item)
            .bind(except)
            .bind(child)
            .bind(now)
            .fetch_all(&mut **tx)
            .await?)
        })
        .await
    }
}

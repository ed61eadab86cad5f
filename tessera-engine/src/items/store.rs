// SPDX-License-Identifier: MIT OR Apache-2.0

use sqlx::{FromRow, query, query_as, query_scalar};
use tessera_store::{SqliteStore, StoreError};

use crate::groups::decode;
use crate::items::{Item, ItemEdge, ItemId};

/// Store API for items and the edges between them.
pub trait ItemStore {
    fn insert_item(&self, item: &Item) -> impl Future<Output = Result<(), StoreError>>;

    fn item(&self, id: ItemId) -> impl Future<Output = Result<Option<Item>, StoreError>>;

    /// All item edges as `(parent, child)`.
    fn item_edges(&self) -> impl Future<Output = Result<Vec<(ItemId, ItemId)>, StoreError>>;

    /// Inserts the edge or replaces the attributes of an existing one.
    fn upsert_item_edge(&self, edge: &ItemEdge) -> impl Future<Output = Result<(), StoreError>>;

    fn delete_item_edge(
        &self,
        parent: ItemId,
        child: ItemId,
    ) -> impl Future<Output = Result<bool, StoreError>>;

    /// Edges leading to `child` together with the parent item.
    fn parent_edges(
        &self,
        child: ItemId,
    ) -> impl Future<Output = Result<Vec<(ItemEdge, Item)>, StoreError>>;

    /// Edges leaving `parent` together with the child item, in child order.
    fn child_edges(
        &self,
        parent: ItemId,
    ) -> impl Future<Output = Result<Vec<(ItemEdge, Item)>, StoreError>>;

    /// Whether `item` is `root` or lies below it.
    fn is_within(
        &self,
        root: ItemId,
        item: ItemId,
    ) -> impl Future<Output = Result<bool, StoreError>>;
}

#[derive(FromRow)]
struct ItemRow {
    id: ItemId,
    custom_chapter: bool,
    validation_type: String,
    no_score: bool,
    requires_explicit_entry: bool,
}

impl TryFrom<ItemRow> for Item {
    type Error = StoreError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        Ok(Item {
            id: row.id,
            custom_chapter: row.custom_chapter,
            validation_type: decode("validation_type", &row.validation_type)?,
            no_score: row.no_score,
            requires_explicit_entry: row.requires_explicit_entry,
        })
    }
}

/// Edge joined with the item on its other end.
#[derive(FromRow)]
struct LinkRow {
    parent_item_id: ItemId,
    child_item_id: ItemId,
    category: String,
    partial_access_propagation: String,
    score_weight: i64,
    child_order: i64,
    #[sqlx(flatten)]
    item: ItemRow,
}

impl LinkRow {
    fn into_link(self) -> Result<(ItemEdge, Item), StoreError> {
        let edge = ItemEdge {
            parent: self.parent_item_id,
            child: self.child_item_id,
            category: decode("category", &self.category)?,
            partial_access_propagation: decode(
                "partial_access_propagation",
                &self.partial_access_propagation,
            )?,
            score_weight: self.score_weight,
            child_order: self.child_order,
        };
        Ok((edge, Item::try_from(self.item)?))
    }
}

impl ItemStore for SqliteStore {
    async fn insert_item(&self, item: &Item) -> Result<(), StoreError> {
        self.tx(async |tx| {
            query(
                "
                INSERT INTO
                    items (
                        id,
                        custom_chapter,
                        validation_type,
                        no_score,
                        requires_explicit_entry
                    )
                VALUES
                    (?, ?, ?, ?, ?)
                ",
            )
            .bind(item.id)
            .bind(item.custom_chapter)
            .bind(item.validation_type.as_str())
            .bind(item.no_score)
            .bind(item.requires_explicit_entry)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
        .await
    }

    async fn item(&self, id: ItemId) -> Result<Option<Item>, StoreError> {
        let row = self
            .tx(async |tx| {
                Ok(query_as::<_, ItemRow>(
                    "
                    SELECT
                        id,
                        custom_chapter,
                        validation_type,
                        no_score,
                        requires_explicit_entry
                    FROM
                        items
                    WHERE
                        id = ?
                    ",
                )
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?)
            })
            .await?;

        row.map(Item::try_from).transpose()
    }

    async fn item_edges(&self) -> Result<Vec<(ItemId, ItemId)>, StoreError> {
        self.tx(async |tx| {
            Ok(
                query_as("SELECT parent_item_id, child_item_id FROM items_items")
                    .fetch_all(&mut **tx)
                    .await?,
            )
        })
        .await
    }

    async fn upsert_item_edge(&self, edge: &ItemEdge) -> Result<(), StoreError> {
        self.tx(async |tx| {
            query(
                "
                INSERT INTO
                    items_items (
                        parent_item_id,
                        child_item_id,
                        category,
                        partial_access_propagation,
                        score_weight,
                        child_order
                    )
                VALUES
                    (?, ?, ?, ?, ?, ?)
                ON CONFLICT (parent_item_id, child_item_id) DO UPDATE SET
                    category = excluded.category,
                    partial_access_propagation = excluded.partial_access_propagation,
                    score_weight = excluded.score_weight,
                    child_order = excluded.child_order
                ",
            )
            .bind(edge.parent)
            .bind(edge.child)
            .bind(edge.category.as_str())
            .bind(edge.partial_access_propagation.as_str())
            .bind(edge.score_weight)
            .bind(edge.child_order)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
        .await
    }

    async fn delete_item_edge(&self, parent: ItemId, child: ItemId) -> Result<bool, StoreError> {
        let result = self
            .tx(async |tx| {
                Ok(query(
                    "
                    DELETE FROM
                        items_items
                    WHERE
                        parent_item_id = ?
                        AND child_item_id = ?
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

    async fn parent_edges(&self, child: ItemId) -> Result<Vec<(ItemEdge, Item)>, StoreError> {
        let rows = self
            .tx(async |tx| {
                Ok(query_as::<_, LinkRow>(
                    "
                    SELECT
                        items_items.parent_item_id,
                        items_items.child_item_id,
                        items_items.category,
                        items_items.partial_access_propagation,
                        items_items.score_weight,
                        items_items.child_order,
                        items.id,
                        items.custom_chapter,
                        items.validation_type,
                        items.no_score,
                        items.requires_explicit_entry
                    FROM
                        items_items
                    JOIN items
                        ON items.id = items_items.parent_item_id
                    WHERE
                        items_items.child_item_id = ?
                    ORDER BY
                        items_items.parent_item_id
                    ",
                )
                .bind(child)
                .fetch_all(&mut **tx)
                .await?)
            })
            .await?;

        rows.into_iter().map(LinkRow::into_link).collect()
    }

    async fn child_edges(&self, parent: ItemId) -> Result<Vec<(ItemEdge, Item)>, StoreError> {
        let rows = self
            .tx(async |tx| {
                Ok(query_as::<_, LinkRow>(
                    "
                    SELECT
                        items_items.parent_item_id,
                        items_items.child_item_id,
                        items_items.category,
                        items_items.partial_access_propagation,
                        items_items.score_weight,
                        items_items.child_order,
                        items.id,
                        items.custom_chapter,
                        items.validation_type,
                        items.no_score,
                        items.requires_explicit_entry
                    FROM
                        items_items
                    JOIN items
                        ON items.id = items_items.child_item_id
                    WHERE
                        items_items.parent_item_id = ?
                    ORDER BY
                        items_items.child_order,
                        items_items.child_item_id
                    ",
                )
                .bind(parent)
                .fetch_all(&mut **tx)
                .await?)
            })
            .await?;

        rows.into_iter().map(LinkRow::into_link).collect()
    }

    async fn is_within(&self, root: ItemId, item: ItemId) -> Result<bool, StoreError> {
        self.tx(async |tx| {
            let within: bool = query_scalar(
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
                    SELECT 1 FROM item_ancestors WHERE item_id = ?1
                )
                ",
            )
            .bind(root)
            .bind(item)
            .fetch_one(&mut **tx)
            .await?;
            Ok(within)
        })
        .await
    }
}

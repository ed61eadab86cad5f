// SPDX-License-Identifier: MIT OR Apache-2.0

use tessera_store::StoreError;

use crate::error::EngineError;
use crate::items::{
    Category, Item, ItemEdge, ItemId, ItemStore, PartialAccessPropagation, ValidationType,
    ensure_no_item_cycle,
};
use crate::test_utils::TestEngine;

async fn children(engine: &TestEngine, parent: ItemId) -> Vec<(ItemEdge, Item)> {
    let store = engine.store();
    store
        .in_transaction::<_, _, StoreError>(async || store.child_edges(parent).await)
        .await
        .unwrap()
}

#[test]
fn cycle_detection_on_edge_lists() {
    let edges = [(1, 2), (2, 3), (1, 4)];
    assert!(ensure_no_item_cycle(&edges, 4, 3).is_ok());
    assert!(matches!(
        ensure_no_item_cycle(&edges, 3, 1),
        Err(EngineError::ItemRelationCycle { parent: 3, child: 1 })
    ));
    assert!(ensure_no_item_cycle(&edges, 5, 5).is_err());
}

#[tokio::test]
async fn items_and_edges_round_trip() {
    let engine = TestEngine::new().await;
    engine
        .item(
            Item::new(1)
                .custom_chapter()
                .validation_type(ValidationType::Categories),
        )
        .await;
    engine.item(Item::new(2).no_score()).await;
    engine.item(Item::new(3).requires_explicit_entry()).await;

    engine
        .item_edge(
            ItemEdge::new(1, 3)
                .category(Category::Validation)
                .score_weight(3)
                .child_order(0),
        )
        .await;
    engine
        .item_edge(
            ItemEdge::new(1, 2)
                .partial_access_propagation(PartialAccessPropagation::AsGrayed)
                .child_order(1),
        )
        .await;

    let links = children(&engine, 1).await;
    assert_eq!(links.len(), 2);

    let (edge, child) = &links[0];
    assert_eq!(child.id, 3);
    assert!(child.requires_explicit_entry);
    assert_eq!(edge.category, Category::Validation);
    assert_eq!(edge.score_weight, 3);

    let (edge, child) = &links[1];
    assert_eq!(child.id, 2);
    assert!(child.no_score);
    assert_eq!(
        edge.partial_access_propagation,
        PartialAccessPropagation::AsGrayed
    );

    // Updating an edge replaces its attributes.
    engine
        .item_edge(ItemEdge::new(1, 2).child_order(1).score_weight(5))
        .await;
    let links = children(&engine, 1).await;
    assert_eq!(links[1].0.score_weight, 5);
    assert_eq!(
        links[1].0.partial_access_propagation,
        PartialAccessPropagation::AsPartial
    );
}

#[tokio::test]
async fn item_cycles_are_rejected() {
    let engine = TestEngine::new().await;
    engine.items(&[1, 2, 3]).await;
    engine.item_edge(ItemEdge::new(1, 2)).await;
    engine.item_edge(ItemEdge::new(2, 3)).await;

    let result = engine.create_item_edge(&ItemEdge::new(3, 1)).await;
    assert!(matches!(
        result,
        Err(EngineError::ItemRelationCycle { parent: 3, child: 1 })
    ));

    let result = engine.create_item_edge(&ItemEdge::new(2, 2)).await;
    assert!(matches!(result, Err(EngineError::ItemRelationCycle { .. })));

    let result = engine.create_item_edge(&ItemEdge::new(3, 4)).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));

    assert!(children(&engine, 3).await.is_empty());
}

#[tokio::test]
async fn deleting_item_edges() {
    let engine = TestEngine::new().await;
    engine.items(&[1, 2]).await;
    engine.item_edge(ItemEdge::new(1, 2)).await;

    assert!(engine.delete_item_edge(1, 2).await.unwrap());
    assert!(!engine.delete_item_edge(1, 2).await.unwrap());
    assert!(children(&engine, 1).await.is_empty());
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Content items and the edges of the item hierarchy.
mod store;
#[cfg(test)]
mod tests;

use std::fmt;
use std::str::FromStr;

use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use tessera_store::DecodeError;

use crate::error::EngineError;
use crate::graph::has_path;

pub use store::ItemStore;

pub type ItemId = i64;

/// How the validation of an item is derived from its children.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationType {
    /// Validated as soon as a child is validated, at the latest of the children's dates.
    #[default]
    Default,

    /// Validated once all children connected through `Validation` edges are.
    Categories,
}

impl ValidationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationType::Default => "Default",
            ValidationType::Categories => "Categories",
        }
    }
}

impl FromStr for ValidationType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Default" => Ok(ValidationType::Default),
            "Categories" => Ok(ValidationType::Categories),
            _ => Err(DecodeError::FromStr),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[default]
    Normal,
    Validation,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Normal => "Normal",
            Category::Validation => "Validation",
        }
    }
}

impl FromStr for Category {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Normal" => Ok(Category::Normal),
            "Validation" => Ok(Category::Validation),
            _ => Err(DecodeError::FromStr),
        }
    }
}

/// How partial ("content") view access of the parent reaches the child.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartialAccessPropagation {
    /// Partial access is not inherited.
    None,

    /// Partial access is inherited as partial access.
    #[default]
    AsPartial,

    /// Partial access is inherited as the grayed marker.
    AsGrayed,
}

impl PartialAccessPropagation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartialAccessPropagation::None => "None",
            PartialAccessPropagation::AsPartial => "AsPartial",
            PartialAccessPropagation::AsGrayed => "AsGrayed",
        }
    }
}

impl fmt::Display for PartialAccessPropagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PartialAccessPropagation {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(PartialAccessPropagation::None),
            "AsPartial" => Ok(PartialAccessPropagation::AsPartial),
            "AsGrayed" => Ok(PartialAccessPropagation::AsGrayed),
            _ => Err(DecodeError::FromStr),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,

    /// Custom chapters are a hard barrier for permission inheritance.
    pub custom_chapter: bool,
    pub validation_type: ValidationType,

    /// Excluded from the score and validation of its parents.
    pub no_score: bool,

    /// Parent results are not created automatically for this item.
    pub requires_explicit_entry: bool,
}

impl Item {
    pub fn new(id: ItemId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn custom_chapter(mut self) -> Self {
        self.custom_chapter = true;
        self
    }

    pub fn validation_type(mut self, validation_type: ValidationType) -> Self {
        self.validation_type = validation_type;
        self
    }

    pub fn no_score(mut self) -> Self {
        self.no_score = true;
        self
    }

    pub fn requires_explicit_entry(mut self) -> Self {
        self.requires_explicit_entry = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemEdge {
    pub parent: ItemId,
    pub child: ItemId,
    pub category: Category,
    pub partial_access_propagation: PartialAccessPropagation,
    pub score_weight: i64,
    pub child_order: i64,
}

impl ItemEdge {
    pub fn new(parent: ItemId, child: ItemId) -> Self {
        Self {
            parent,
            child,
            category: Category::Normal,
            partial_access_propagation: PartialAccessPropagation::AsPartial,
            score_weight: 1,
            child_order: 0,
        }
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn partial_access_propagation(mut self, propagation: PartialAccessPropagation) -> Self {
        self.partial_access_propagation = propagation;
        self
    }

    pub fn score_weight(mut self, score_weight: i64) -> Self {
        self.score_weight = score_weight;
        self
    }

    pub fn child_order(mut self, child_order: i64) -> Self {
        self.child_order = child_order;
        self
    }
}

/// Fails with `ItemRelationCycle` if adding `parent -> child` to the existing edges would close a
/// cycle.
pub fn ensure_no_item_cycle(
    edges: &[(ItemId, ItemId)],
    parent: ItemId,
    child: ItemId,
) -> Result<(), EngineError> {
    let graph: DiGraphMap<ItemId, ()> = DiGraphMap::from_edges(edges.iter().copied());
    if has_path(&graph, child, parent) {
        return Err(EngineError::ItemRelationCycle { parent, child });
    }
    Ok(())
}

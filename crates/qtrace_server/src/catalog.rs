//! Relation catalog consulted by the planner.
//!
//! Just enough shape for cost estimation and statistics spoofing: page and
//! tuple counts per relation, plus index entries with a tree height.

use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct RelationEntry {
    pub oid: u32,
    pub name: String,
    pub pages: i32,
    pub tuples: f64,
    /// Index oids defined over this relation.
    pub indexes: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub oid: u32,
    pub name: String,
    pub table_oid: u32,
    pub pages: i32,
    pub tuples: f64,
    pub tree_height: i32,
}

#[derive(Debug, Default)]
pub struct Catalog {
    relations: RwLock<BTreeMap<u32, RelationEntry>>,
    indexes: RwLock<BTreeMap<u32, IndexEntry>>,
}

impl Catalog {
    pub fn register_table(&self, oid: u32, name: &str, pages: i32, tuples: f64) {
        let mut relations = self
            .relations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        relations.insert(
            oid,
            RelationEntry {
                oid,
                name: name.to_string(),
                pages,
                tuples,
                indexes: Vec::new(),
            },
        );
    }

    pub fn register_index(&self, oid: u32, name: &str, table_oid: u32, pages: i32, tuples: f64) {
        let mut indexes = self
            .indexes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        indexes.insert(
            oid,
            IndexEntry {
                oid,
                name: name.to_string(),
                table_oid,
                pages,
                tuples,
                // Rough btree height for synthetic relations.
                tree_height: (tuples.max(2.0).log2() / 8.0).ceil() as i32,
            },
        );
        let mut relations = self
            .relations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(table) = relations.get_mut(&table_oid) {
            if !table.indexes.contains(&oid) {
                table.indexes.push(oid);
            }
        }
    }

    pub fn relation(&self, oid: u32) -> Option<RelationEntry> {
        self.relations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&oid)
            .cloned()
    }

    pub fn index(&self, oid: u32) -> Option<IndexEntry> {
        self.indexes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&oid)
            .cloned()
    }

    pub fn relation_oids(&self) -> Vec<u32> {
        self.relations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect()
    }
}

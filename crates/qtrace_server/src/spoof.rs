//! Table-size statistics spoofing for planner experimentation.
//!
//! Installed entries override pages, tuples, and (for indexes) tree height
//! inside the get-relation-info hook, before any cost computation that
//! follows.

use std::sync::Mutex;

use crate::planner::RelOptInfo;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatEntry {
    pub rel_oid: u32,
    pub relpages: i32,
    pub reltuples: f64,
    pub tree_height: i32,
}

#[derive(Debug, Default)]
pub struct SpoofList {
    entries: Mutex<Vec<StatEntry>>,
}

impl SpoofList {
    /// Install or update the spoofed statistics for one relation.
    pub fn install_stats(&self, rel_oid: u32, relpages: i32, reltuples: f64, tree_height: i32) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match entries.iter_mut().find(|entry| entry.rel_oid == rel_oid) {
            Some(entry) => {
                entry.relpages = relpages;
                entry.reltuples = reltuples;
                entry.tree_height = tree_height;
            }
            None => entries.push(StatEntry {
                rel_oid,
                relpages,
                reltuples,
                tree_height,
            }),
        }
    }

    /// Remove one relation's spoofed statistics. Returns whether an entry
    /// was present.
    pub fn remove_stats(&self, rel_oid: u32) -> bool {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|entry| entry.rel_oid != rel_oid);
        entries.len() != before
    }

    pub fn clear_stats(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Apply every installed entry to a relation about to be planned.
    /// Spoofed index entries also override the matching index opt-info.
    pub fn apply(&self, target: u32, rel: &mut RelOptInfo) {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in entries.iter() {
            if entry.rel_oid == target {
                rel.pages = entry.relpages;
                rel.tuples = entry.reltuples;
            }
            for index in &mut rel.indexlist {
                if entry.rel_oid == index.indexoid {
                    index.pages = entry.relpages;
                    index.tuples = entry.reltuples;
                    if entry.tree_height != 0 {
                        index.tree_height = entry.tree_height;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::IndexOptInfo;

    fn rel() -> RelOptInfo {
        RelOptInfo {
            relid: 100,
            pages: 10,
            tuples: 1_000.0,
            indexlist: vec![IndexOptInfo {
                indexoid: 200,
                pages: 4,
                tuples: 1_000.0,
                tree_height: 2,
            }],
        }
    }

    #[test]
    fn install_overrides_pages_and_tuples() {
        let spoof = SpoofList::default();
        spoof.install_stats(100, 9_999, 5e6, 0);
        let mut rel = rel();
        spoof.apply(100, &mut rel);
        assert_eq!(rel.pages, 9_999);
        assert_eq!(rel.tuples, 5e6);
        // Index untouched by a table-oid entry.
        assert_eq!(rel.indexlist[0].tree_height, 2);
    }

    #[test]
    fn index_entries_override_tree_height_only_when_nonzero() {
        let spoof = SpoofList::default();
        spoof.install_stats(200, 77, 1e5, 0);
        let mut rel = rel();
        spoof.apply(100, &mut rel);
        assert_eq!(rel.indexlist[0].pages, 77);
        assert_eq!(rel.indexlist[0].tree_height, 2, "zero height keeps prior");

        spoof.install_stats(200, 77, 1e5, 5);
        let mut rel = self::rel();
        spoof.apply(100, &mut rel);
        assert_eq!(rel.indexlist[0].tree_height, 5);
    }

    #[test]
    fn reinstall_updates_in_place_and_remove_clears() {
        let spoof = SpoofList::default();
        spoof.install_stats(100, 1, 1.0, 0);
        spoof.install_stats(100, 2, 2.0, 0);
        let mut rel = rel();
        spoof.apply(100, &mut rel);
        assert_eq!(rel.pages, 2);

        assert!(spoof.remove_stats(100));
        assert!(!spoof.remove_stats(100));
        let mut fresh = self::rel();
        spoof.apply(100, &mut fresh);
        assert_eq!(fresh.pages, 10);
    }
}

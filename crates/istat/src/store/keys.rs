//! Append-only index of counter names for listing and glob matching.
//!
//! Writers only ever push onto the key list. Matching works on a tree of
//! names and their dotted parents that is brought up to date lazily, the
//! first time a match runs after new keys arrived:
//!
//! ```text
//! keys:  [a.b.c (leaf), a.x (leaf)]
//! tree:  a      branch
//!        a.b    branch
//!        a.b.c  leaf
//!        a.x    leaf
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::names::strip_ext;
use super::pattern::pattern_match;

/// How a listed name should be displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisplayType {
    /// A directly recorded counter.
    Gauge = 0,
    /// A collated counter.
    Event = 1,
    /// A parent of other counters.
    Aggregate = 2,
}

/// One known counter name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    /// Munged counter name.
    pub name: String,
    /// True for collated counters.
    pub collated: bool,
}

/// One result of [`KeyIndex::matches`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterMatch {
    /// Counter or parent name.
    pub name: String,
    /// False if other names live below this one.
    pub is_leaf: bool,
    /// Display type derived from leafness and collation.
    pub display_type: DisplayType,
}

#[derive(Debug, Clone, Copy)]
struct KeyNode {
    is_leaf: bool,
    collated: bool,
}

#[derive(Debug, Default)]
struct MatchTree {
    applied: usize,
    nodes: BTreeMap<String, KeyNode>,
}

impl MatchTree {
    fn insert(&mut self, name: &str, collated: bool) {
        if self.nodes.contains_key(name) {
            return;
        }
        self.nodes.insert(
            name.to_string(),
            KeyNode {
                is_leaf: true,
                collated,
            },
        );
        let mut current = name;
        while let Some(parent) = strip_ext(current) {
            match self.nodes.get_mut(parent) {
                Some(node) => {
                    // its own parents are already present
                    node.is_leaf = false;
                    break;
                }
                None => {
                    self.nodes.insert(
                        parent.to_string(),
                        KeyNode {
                            is_leaf: false,
                            collated: false,
                        },
                    );
                }
            }
            current = parent;
        }
    }
}

/// Names of every live counter.
#[derive(Debug, Default)]
pub struct KeyIndex {
    keys: RwLock<Vec<KeyEntry>>,
    dirty: AtomicBool,
    tree: Mutex<MatchTree>,
}

impl KeyIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a counter name.
    pub fn add(&self, name: impl Into<String>, collated: bool) {
        self.keys.write().push(KeyEntry {
            name: name.into(),
            collated,
        });
        self.dirty.store(true, Ordering::Release);
    }

    /// Number of names added since the last replace.
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Returns true if no names are known.
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Copy of the current key list.
    pub fn snapshot(&self) -> Vec<KeyEntry> {
        self.keys.read().clone()
    }

    /// Swaps in a rebuilt key list and drops the match tree.
    pub fn replace(&self, keys: Vec<KeyEntry>) {
        let mut tree = self.tree.lock();
        debug!("Replacing key index with {} keys", keys.len());
        *self.keys.write() = keys;
        *tree = MatchTree::default();
        self.dirty.store(true, Ordering::Release);
    }

    /// Lists every counter and parent name matching `pattern`, sorted by
    /// name.
    ///
    /// Only one match runs at a time.
    pub fn matches(&self, pattern: &str) -> Vec<CounterMatch> {
        let mut tree = self.tree.lock();
        if self.dirty.swap(false, Ordering::AcqRel) {
            let keys = self.keys.read();
            let start = tree.applied.min(keys.len());
            for entry in &keys[start..] {
                tree.insert(&entry.name, entry.collated);
            }
            tree.applied = keys.len();
        }
        tree.nodes
            .iter()
            .filter(|(name, _)| pattern_match(name, pattern))
            .map(|(name, node)| CounterMatch {
                name: name.clone(),
                is_leaf: node.is_leaf,
                display_type: match (node.is_leaf, node.collated) {
                    (false, _) => DisplayType::Aggregate,
                    (true, true) => DisplayType::Event,
                    (true, false) => DisplayType::Gauge,
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> KeyIndex {
        let index = KeyIndex::new();
        index.add("a.file.that.is.nested", true);
        index.add("a.file.that.is.non", false);
        index.add("a.different.file", true);
        index.add("a.other.different.file", false);
        index
    }

    #[test]
    fn test_match_all_lists_parents() {
        let index = sample_index();
        let found = index.matches("*");
        assert_eq!(found.len(), 11);

        let names: Vec<&str> = found.iter().map(|m| m.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);

        let get = |name: &str| found.iter().find(|m| m.name == name).unwrap().clone();
        assert_eq!(get("a").display_type, DisplayType::Aggregate);
        assert!(!get("a.file.that.is").is_leaf);
        assert_eq!(get("a.file.that.is.nested").display_type, DisplayType::Event);
        assert_eq!(get("a.file.that.is.non").display_type, DisplayType::Gauge);
        assert_eq!(get("a.different.file").display_type, DisplayType::Event);
        assert!(get("a.other.different.file").is_leaf);
    }

    #[test]
    fn test_match_with_pattern() {
        let index = sample_index();
        let names: Vec<String> = index
            .matches("a.?")
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["a.different", "a.file", "a.other"]);
        assert!(index.matches("b*").is_empty());
    }

    #[test]
    fn test_leaf_that_gains_children_becomes_branch() {
        let index = KeyIndex::new();
        index.add("x.y", false);
        assert!(index.matches("x.y")[0].is_leaf);

        index.add("x.y.z", false);
        let found = index.matches("x.y");
        assert_eq!(found.len(), 1);
        assert!(!found[0].is_leaf);
        assert_eq!(found[0].display_type, DisplayType::Aggregate);
    }

    #[test]
    fn test_replace_rebuilds() {
        let index = sample_index();
        assert_eq!(index.matches("*").len(), 11);
        index.replace(vec![KeyEntry {
            name: "solo".to_string(),
            collated: false,
        }]);
        assert_eq!(index.len(), 1);
        let found = index.matches("*");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "solo");
    }
}

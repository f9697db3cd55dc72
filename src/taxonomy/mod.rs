//! Three-level category tree (main → sub1 → sub2).
//!
//! - `similarity`: name comparison used for near-duplicate detection
//! - `digest`: bounded summary of the tree for the classifier prompt
//! - `reconcile`: merges proposed category names into the tree
//! - `store`: taxonomy.json persistence

pub mod digest;
pub mod reconcile;
pub mod similarity;
pub mod store;

use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::eid::Eid;
use crate::normalizer::{collapse_whitespace, normalize_key};

pub use digest::{build_digest, TaxonomyDigest};
pub use reconcile::{ReconcileReport, Reconciler};
pub use store::{TaxonomyPersistence, TaxonomyStore, TaxonomyStoreError};

/// Reserved main/sub1 name for keywords that could not be classified
pub const FALLBACK_CATEGORY: &str = "Unclassified";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Main,
    Sub1,
    Sub2,
}

impl Level {
    pub fn parent(self) -> Option<Level> {
        match self {
            Level::Main => None,
            Level::Sub1 => Some(Level::Main),
            Level::Sub2 => Some(Level::Sub1),
        }
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Level::Main => "main",
            Level::Sub1 => "sub1",
            Level::Sub2 => "sub2",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub id: Eid,
    pub level: Level,
    pub canonical_name: String,
    pub parent_id: Option<Eid>,

    /// Most recent keywords assigned here, oldest first
    #[serde(default)]
    pub exemplars: Vec<String>,

    /// Proposed names that were resolved to this node by similarity
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,

    #[serde(default)]
    pub keyword_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<String>,
}

impl CategoryNode {
    pub fn normalized_name(&self) -> String {
        normalize_key(&self.canonical_name)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TaxonomyError {
    #[error("category name is empty")]
    EmptyName,

    #[error("parent {0} does not exist")]
    UnknownParent(Eid),

    #[error("{level} node {name:?} cannot sit under a {parent_level} node")]
    LevelMismatch {
        level: Level,
        name: String,
        parent_level: String,
    },

    #[error("duplicate sibling name {0:?}")]
    DuplicateSibling(String),

    #[error("duplicate node id {0}")]
    DuplicateId(Eid),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    #[serde(default)]
    nodes: Vec<CategoryNode>,
}

impl Taxonomy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[CategoryNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &Eid) -> Option<&CategoryNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn get_mut(&mut self, id: &Eid) -> Option<&mut CategoryNode> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    /// Children of `parent`, or the main categories when `parent` is None.
    pub fn children<'a>(&'a self, parent: Option<&Eid>) -> impl Iterator<Item = &'a CategoryNode> + 'a {
        let parent = parent.cloned();
        self.nodes.iter().filter(move |n| n.parent_id == parent)
    }

    pub fn find_child(&self, parent: Option<&Eid>, normalized_name: &str) -> Option<&CategoryNode> {
        self.children(parent)
            .find(|n| n.normalized_name() == normalized_name)
    }

    pub fn count_level(&self, level: Level) -> usize {
        self.nodes.iter().filter(|n| n.level == level).count()
    }

    /// Add a node, enforcing parent level and sibling uniqueness.
    pub fn insert(&mut self, level: Level, name: &str, parent: Option<&Eid>) -> Result<Eid, TaxonomyError> {
        let name = collapse_whitespace(name);
        if name.is_empty() {
            return Err(TaxonomyError::EmptyName);
        }

        let parent_level = match parent {
            Some(id) => Some(
                self.get(id)
                    .ok_or_else(|| TaxonomyError::UnknownParent(id.clone()))?
                    .level,
            ),
            None => None,
        };
        if parent_level != level.parent() {
            return Err(TaxonomyError::LevelMismatch {
                level,
                name,
                parent_level: parent_level.map(|l| l.to_string()).unwrap_or("root".into()),
            });
        }

        if self.find_child(parent, &normalize_key(&name)).is_some() {
            return Err(TaxonomyError::DuplicateSibling(name));
        }

        let id = Eid::new();
        self.nodes.push(CategoryNode {
            id: id.clone(),
            level,
            canonical_name: name,
            parent_id: parent.cloned(),
            exemplars: vec![],
            aliases: vec![],
            keyword_count: 0,
            last_used: None,
        });
        Ok(id)
    }

    /// Check the tree invariants. Levels strictly decrease towards the root,
    /// so a valid parent chain can never form a cycle.
    pub fn validate(&self) -> Result<(), TaxonomyError> {
        let mut ids = std::collections::HashSet::new();
        for node in &self.nodes {
            if !ids.insert(&node.id) {
                return Err(TaxonomyError::DuplicateId(node.id.clone()));
            }
        }

        let mut siblings = std::collections::HashSet::new();
        for node in &self.nodes {
            if node.canonical_name.trim().is_empty() {
                return Err(TaxonomyError::EmptyName);
            }

            let parent_level = match &node.parent_id {
                Some(pid) => Some(
                    self.get(pid)
                        .ok_or_else(|| TaxonomyError::UnknownParent(pid.clone()))?
                        .level,
                ),
                None => None,
            };
            if parent_level != node.level.parent() {
                return Err(TaxonomyError::LevelMismatch {
                    level: node.level,
                    name: node.canonical_name.clone(),
                    parent_level: parent_level.map(|l| l.to_string()).unwrap_or("root".into()),
                });
            }

            if !siblings.insert((node.parent_id.clone(), node.normalized_name())) {
                return Err(TaxonomyError::DuplicateSibling(node.canonical_name.clone()));
            }
        }

        Ok(())
    }

    /// Render the tree as an indented outline.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        let mut mains: Vec<_> = self.children(None).collect();
        mains.sort_by_key(|n| n.normalized_name());
        for main in mains {
            out.push_str(&format!("{} ({})\n", main.canonical_name, main.keyword_count));
            let mut subs: Vec<_> = self.children(Some(&main.id)).collect();
            subs.sort_by_key(|n| n.normalized_name());
            for sub in subs {
                out.push_str(&format!("  {} ({})\n", sub.canonical_name, sub.keyword_count));
                let mut leaves: Vec<_> = self.children(Some(&sub.id)).collect();
                leaves.sort_by_key(|n| n.normalized_name());
                for leaf in leaves {
                    out.push_str(&format!("    {} ({})", leaf.canonical_name, leaf.keyword_count));
                    if !leaf.aliases.is_empty() {
                        out.push_str(&format!(" aka {}", leaf.aliases.join(", ")));
                    }
                    out.push('\n');
                }
            }
        }
        out
    }
}

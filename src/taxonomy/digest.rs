//! Bounded summary of the category tree for the classifier prompt.
//!
//! Small trees are listed whole, alphabetically. Once the tree grows past
//! `full_tree_threshold` nodes, siblings are ranked by how many keywords they
//! hold and how recently they were used, and only the top entries per level
//! are kept.

use serde::Serialize;

use crate::config::DigestConfig;
use crate::eid::Eid;
use crate::taxonomy::{CategoryNode, Taxonomy};

pub const EMPTY_DIGEST: &str = "(no existing categories)";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exemplars: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DigestEntry>,
    #[serde(skip)]
    keyword_count: u64,
    #[serde(skip)]
    last_used: Option<String>,
}

impl DigestEntry {
    fn from_node(node: &CategoryNode, exemplars: Vec<String>, children: Vec<DigestEntry>) -> Self {
        Self {
            name: node.canonical_name.clone(),
            exemplars,
            children,
            keyword_count: node.keyword_count,
            last_used: node.last_used.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaxonomyDigest {
    pub mains: Vec<DigestEntry>,
    /// True when branches were dropped to respect the caps
    pub sampled: bool,
}

fn pick<'a>(tree: &'a Taxonomy, parent: Option<&Eid>, cap: usize, sampled: bool) -> Vec<&'a CategoryNode> {
    let mut nodes: Vec<&CategoryNode> = tree.children(parent).collect();
    if sampled {
        nodes.sort_by(|a, b| {
            b.keyword_count
                .cmp(&a.keyword_count)
                .then_with(|| b.last_used.cmp(&a.last_used))
                .then_with(|| a.normalized_name().cmp(&b.normalized_name()))
        });
        nodes.truncate(cap);
    } else {
        nodes.sort_by_key(|n| n.normalized_name());
    }
    nodes
}

pub fn build_digest(tree: &Taxonomy, limits: &DigestConfig) -> TaxonomyDigest {
    let sampled = tree.len() > limits.full_tree_threshold;

    let mains = pick(tree, None, limits.max_main, sampled)
        .into_iter()
        .map(|main| {
            let subs = pick(tree, Some(&main.id), limits.max_sub1, sampled)
                .into_iter()
                .map(|sub1| {
                    let leaves = pick(tree, Some(&sub1.id), limits.max_sub2, sampled)
                        .into_iter()
                        .map(|sub2| {
                            DigestEntry::from_node(sub2, recent(&sub2.exemplars, limits.max_exemplars), vec![])
                        })
                        .collect();
                    DigestEntry::from_node(sub1, vec![], leaves)
                })
                .collect();
            DigestEntry::from_node(main, vec![], subs)
        })
        .collect();

    TaxonomyDigest { mains, sampled }
}

fn recent(exemplars: &[String], cap: usize) -> Vec<String> {
    let skip = exemplars.len().saturating_sub(cap);
    exemplars[skip..].to_vec()
}

impl TaxonomyDigest {
    pub fn is_empty(&self) -> bool {
        self.mains.is_empty()
    }

    /// Indented outline, at most `max_chars` long. The lowest-ranked main
    /// categories are dropped first when over budget; the rest keep their order.
    pub fn render(&self, max_chars: usize) -> String {
        if self.mains.is_empty() {
            return EMPTY_DIGEST.to_string();
        }

        let blocks: Vec<String> = self.mains.iter().map(render_main).collect();
        let mut ranked: Vec<usize> = (0..blocks.len()).collect();
        ranked.sort_by(|&a, &b| {
            let (a, b) = (&self.mains[a], &self.mains[b]);
            b.keyword_count
                .cmp(&a.keyword_count)
                .then_with(|| b.last_used.cmp(&a.last_used))
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut size: usize = blocks.iter().map(String::len).sum();
        while ranked.len() > 1 && size > max_chars {
            if let Some(dropped) = ranked.pop() {
                size -= blocks[dropped].len();
            }
        }
        if ranked.len() < blocks.len() {
            log::debug!("taxonomy digest trimmed to {}/{} main categories", ranked.len(), blocks.len());
        }

        ranked.sort_unstable();
        let out: String = ranked.iter().map(|&idx| blocks[idx].as_str()).collect();
        if out.len() <= max_chars {
            return out;
        }
        // a single main category larger than the budget
        let mut cut = max_chars;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out[..cut].to_string()
    }
}

fn render_main(main: &DigestEntry) -> String {
    let mut out = format!("- {}\n", main.name);
    for sub1 in &main.children {
        out.push_str(&format!("  - {}\n", sub1.name));
        for sub2 in &sub1.children {
            if sub2.exemplars.is_empty() {
                out.push_str(&format!("    - {}\n", sub2.name));
            } else {
                out.push_str(&format!(
                    "    - {} (e.g. {})\n",
                    sub2.name,
                    sub2.exemplars.join("; ")
                ));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::Level;

    fn tree_with(mains: usize, subs: usize) -> Taxonomy {
        let mut tree = Taxonomy::new();
        for m in 0..mains {
            let main = tree.insert(Level::Main, &format!("Main {m:02}"), None).unwrap();
            tree.get_mut(&main).unwrap().keyword_count = m as u64;
            for s in 0..subs {
                let sub1 = tree
                    .insert(Level::Sub1, &format!("Sub {s:02}"), Some(&main))
                    .unwrap();
                let sub2 = tree
                    .insert(Level::Sub2, &format!("Leaf {s:02}"), Some(&sub1))
                    .unwrap();
                let node = tree.get_mut(&sub2).unwrap();
                node.exemplars = vec!["a".into(), "b".into(), "c".into(), "d".into()];
                node.keyword_count = s as u64;
            }
        }
        tree
    }

    #[test]
    fn empty_tree_renders_placeholder() {
        let digest = build_digest(&Taxonomy::new(), &DigestConfig::default());
        assert!(digest.is_empty());
        assert_eq!(digest.render(1000), EMPTY_DIGEST);
    }

    #[test]
    fn small_tree_is_listed_whole() {
        let tree = tree_with(3, 8);
        let limits = DigestConfig::default();
        let digest = build_digest(&tree, &limits);

        assert!(!digest.sampled);
        assert_eq!(digest.mains.len(), 3);
        assert_eq!(digest.mains[0].name, "Main 00");
        assert_eq!(digest.mains[0].children.len(), 8);
        // exemplars are capped to the most recent ones
        assert_eq!(
            digest.mains[0].children[0].children[0].exemplars,
            vec!["b", "c", "d"]
        );
    }

    #[test]
    fn large_tree_prefers_populous_branches() {
        let tree = tree_with(20, 4);
        let limits = DigestConfig {
            full_tree_threshold: 10,
            max_main: 5,
            max_sub1: 2,
            ..Default::default()
        };
        let digest = build_digest(&tree, &limits);

        assert!(digest.sampled);
        assert_eq!(digest.mains.len(), 5);
        assert_eq!(digest.mains[0].name, "Main 19");
        assert_eq!(digest.mains[0].children.len(), 2);
        assert_eq!(digest.mains[0].children[0].name, "Sub 03");
    }

    #[test]
    fn recency_breaks_ties() {
        let mut tree = tree_with(12, 1);
        for node in tree.nodes.iter_mut() {
            node.keyword_count = 1;
        }
        let newest = tree.find_child(None, "main 04").unwrap().id.clone();
        tree.get_mut(&newest).unwrap().last_used = Some("2026-01-01 00:00:00".into());

        let limits = DigestConfig {
            full_tree_threshold: 5,
            max_main: 1,
            ..Default::default()
        };
        let digest = build_digest(&tree, &limits);
        assert_eq!(digest.mains[0].name, "Main 04");
    }

    #[test]
    fn render_respects_char_budget() {
        let tree = tree_with(10, 3);
        let digest = build_digest(&tree, &DigestConfig::default());

        let full = digest.render(usize::MAX);
        assert!(full.contains("- Main 09"));

        // the least populated mains go first, the survivors stay alphabetical
        let trimmed = digest.render(400);
        assert!(trimmed.len() <= 400);
        assert!(trimmed.starts_with("- Main 07"));
        assert!(trimmed.contains("- Main 09"));
        assert!(!trimmed.contains("Main 06"));
        assert!(!trimmed.contains("Main 00"));
    }
}

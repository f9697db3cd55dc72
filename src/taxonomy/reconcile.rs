use serde::Serialize;

use crate::eid::Eid;
use crate::normalizer::{collapse_whitespace, normalize_key};
use crate::providers::Assignment;
use crate::taxonomy::similarity::similarity;
use crate::taxonomy::{Level, Taxonomy, TaxonomyError, FALLBACK_CATEGORY};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedNode {
    pub id: Eid,
    pub level: Level,
    pub name: String,
}

/// A proposed name that was resolved to an existing sibling by similarity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AliasEvent {
    pub level: Level,
    pub proposed: String,
    pub canonical: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub created: Vec<CreatedNode>,
    pub aliases: Vec<AliasEvent>,
    /// Levels resolved to an already existing node
    pub reused: usize,
}

/// Merges proposed category paths into the tree.
///
/// Per level: exact (normalized) sibling match, then the most similar sibling
/// at or above `threshold`, then a new node.
#[derive(Debug, Clone)]
pub struct Reconciler {
    pub threshold: f32,
    pub max_exemplars: usize,
}

impl Reconciler {
    pub fn new(threshold: f32, max_exemplars: usize) -> Self {
        Self {
            threshold,
            max_exemplars,
        }
    }

    /// Exact-name matching only, for restoring exported rows verbatim.
    pub fn exact(max_exemplars: usize) -> Self {
        Self::new(f32::INFINITY, max_exemplars)
    }

    /// Resolve every assignment against `tree`, mutating it in place.
    ///
    /// Returns the assignments rewritten to canonical names, in input order.
    /// Fallback assignments pass through untouched.
    pub fn reconcile(
        &self,
        tree: &mut Taxonomy,
        assignments: &[Assignment],
        now: &str,
    ) -> Result<(Vec<Assignment>, ReconcileReport), TaxonomyError> {
        let mut report = ReconcileReport::default();
        let mut out = Vec::with_capacity(assignments.len());

        for assignment in assignments {
            if assignment.is_fallback() {
                out.push(assignment.clone());
                continue;
            }

            let main = self.resolve(tree, Level::Main, None, &assignment.main_cat, &mut report)?;
            let sub1 = self.resolve(tree, Level::Sub1, Some(&main), &assignment.sub_cat_1, &mut report)?;
            let sub2 = self.resolve(tree, Level::Sub2, Some(&sub1), &assignment.sub_cat_2, &mut report)?;

            let mut canonical = assignment.clone();
            for (id, slot) in [
                (&main, &mut canonical.main_cat),
                (&sub1, &mut canonical.sub_cat_1),
                (&sub2, &mut canonical.sub_cat_2),
            ] {
                let node = tree
                    .get_mut(id)
                    .ok_or_else(|| TaxonomyError::UnknownParent(id.clone()))?;
                node.keyword_count += 1;
                node.last_used = Some(now.to_string());
                node.exemplars.retain(|e| normalize_key(e) != normalize_key(&assignment.keyword));
                node.exemplars.push(assignment.keyword.clone());
                let excess = node.exemplars.len().saturating_sub(self.max_exemplars);
                node.exemplars.drain(..excess);

                *slot = node.canonical_name.clone();
            }
            out.push(canonical);
        }

        log::debug!(
            "reconciled {} assignments created={} aliases={} reused={}",
            assignments.len(),
            report.created.len(),
            report.aliases.len(),
            report.reused
        );

        Ok((out, report))
    }

    fn resolve(
        &self,
        tree: &mut Taxonomy,
        level: Level,
        parent: Option<&Eid>,
        proposed: &str,
        report: &mut ReconcileReport,
    ) -> Result<Eid, TaxonomyError> {
        let name = collapse_whitespace(proposed);
        if name.is_empty() {
            return Err(TaxonomyError::EmptyName);
        }

        if let Some(node) = tree.find_child(parent, &normalize_key(&name)) {
            report.reused += 1;
            return Ok(node.id.clone());
        }

        let best = tree
            .children(parent)
            .map(|n| (similarity(&n.canonical_name, &name), n.id.clone()))
            .filter(|(score, _)| *score >= self.threshold)
            .max_by(|a, b| a.0.total_cmp(&b.0));

        if let Some((score, id)) = best {
            let node = tree
                .get_mut(&id)
                .ok_or_else(|| TaxonomyError::UnknownParent(id.clone()))?;
            if !node.aliases.iter().any(|a| normalize_key(a) == normalize_key(&name)) {
                node.aliases.push(name.clone());
            }
            log::info!(
                "alias level={level} proposed={name:?} canonical={:?} score={score:.3}",
                node.canonical_name
            );
            report.aliases.push(AliasEvent {
                level,
                proposed: name,
                canonical: node.canonical_name.clone(),
                score,
            });
            report.reused += 1;
            return Ok(id);
        }

        let id = tree.insert(level, &name, parent)?;
        log::info!("new category level={level} name={name:?}");
        report.created.push(CreatedNode {
            id: id.clone(),
            level,
            name,
        });
        Ok(id)
    }
}

impl Assignment {
    pub fn is_fallback(&self) -> bool {
        self.main_cat == FALLBACK_CATEGORY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign(keyword: &str, main: &str, sub1: &str, sub2: &str) -> Assignment {
        Assignment {
            keyword: keyword.into(),
            main_cat: main.into(),
            sub_cat_1: sub1.into(),
            sub_cat_2: sub2.into(),
            theme: format!("{sub2} intent"),
        }
    }

    const NOW: &str = "2026-10-16 12:00:00";

    #[test]
    fn same_path_creates_nodes_once() {
        let reconciler = Reconciler::new(0.9, 5);
        let mut tree = Taxonomy::new();
        let input = vec![
            assign("buy tomato seeds", "Gardening", "Buying", "Buying Seeds"),
            assign("buy pepper seeds", "gardening", "BUYING", "buying  seeds"),
        ];

        let (out, report) = reconciler.reconcile(&mut tree, &input, NOW).unwrap();

        assert_eq!(tree.len(), 3);
        assert_eq!(report.created.len(), 3);
        assert_eq!(out[1].main_cat, "Gardening");
        assert_eq!(out[1].sub_cat_2, "Buying Seeds");
        assert_eq!(out[1].theme, input[1].theme);

        let main = tree.find_child(None, "gardening").unwrap();
        assert_eq!(main.keyword_count, 2);
        assert_eq!(main.last_used.as_deref(), Some(NOW));
    }

    #[test]
    fn near_duplicate_becomes_alias() {
        let reconciler = Reconciler::new(0.9, 5);
        let mut tree = Taxonomy::new();
        reconciler
            .reconcile(
                &mut tree,
                &[assign("raised bed kit", "Gardening", "Buying", "Raised Garden Beds")],
                NOW,
            )
            .unwrap();

        let (out, report) = reconciler
            .reconcile(
                &mut tree,
                &[assign("cedar raised bed", "Gardening", "Buying", "Raised Garden Bed")],
                NOW,
            )
            .unwrap();

        assert!(report.created.is_empty());
        assert_eq!(report.aliases.len(), 1);
        assert_eq!(report.aliases[0].proposed, "Raised Garden Bed");
        assert_eq!(out[0].sub_cat_2, "Raised Garden Beds");

        let leaf = tree
            .nodes()
            .iter()
            .find(|n| n.level == Level::Sub2)
            .unwrap();
        assert_eq!(leaf.aliases, vec!["Raised Garden Bed"]);
    }

    #[test]
    fn distinct_intents_stay_apart() {
        let reconciler = Reconciler::new(0.9, 5);
        let mut tree = Taxonomy::new();
        let input = vec![
            assign("buy tomato seeds", "Gardening", "Buying", "Buying Seeds"),
            assign("buy potting soil", "Gardening", "Buying", "Buying Soil"),
            assign("raised bed kit", "Gardening", "Buying", "Buying Raised Garden Beds"),
        ];

        let (_, report) = reconciler.reconcile(&mut tree, &input, NOW).unwrap();
        assert!(report.aliases.is_empty());
        assert_eq!(tree.count_level(Level::Sub2), 3);
    }

    #[test]
    fn fallback_is_skipped() {
        let reconciler = Reconciler::new(0.9, 5);
        let mut tree = Taxonomy::new();
        let input = vec![assign(
            "???",
            FALLBACK_CATEGORY,
            FALLBACK_CATEGORY,
            "openai:malformed_response",
        )];

        let (out, report) = reconciler.reconcile(&mut tree, &input, NOW).unwrap();
        assert!(tree.is_empty());
        assert!(report.created.is_empty());
        assert_eq!(out, input);
    }

    #[test]
    fn exemplars_keep_most_recent() {
        let reconciler = Reconciler::new(0.9, 2);
        let mut tree = Taxonomy::new();
        let input: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|k| assign(k, "Main", "Sub", "Leaf"))
            .collect();

        reconciler.reconcile(&mut tree, &input, NOW).unwrap();
        let leaf = tree
            .nodes()
            .iter()
            .find(|n| n.level == Level::Sub2)
            .unwrap();
        assert_eq!(leaf.exemplars, vec!["b", "c"]);
    }
}

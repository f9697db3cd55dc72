use crate::storage::{BackendLocal, StorageManager};
use crate::taxonomy::{Taxonomy, TaxonomyError};

const TAXONOMY_FILE: &str = "taxonomy.json";

#[derive(Debug, thiserror::Error)]
pub enum TaxonomyStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("taxonomy file is malformed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("taxonomy violates an invariant: {0}")]
    Invalid(#[from] TaxonomyError),
}

/// Reads and writes the category tree as a single JSON document.
pub trait TaxonomyPersistence: Send + Sync {
    fn load(&self) -> Result<Taxonomy, TaxonomyStoreError>;
    fn save(&self, tree: &Taxonomy) -> Result<(), TaxonomyStoreError>;
}

#[derive(Clone, Debug)]
pub struct TaxonomyStore {
    store: BackendLocal,
}

impl TaxonomyStore {
    pub fn new(store: BackendLocal) -> Self {
        Self { store }
    }
}

impl TaxonomyPersistence for TaxonomyStore {
    fn load(&self) -> Result<Taxonomy, TaxonomyStoreError> {
        if !self.store.exists(TAXONOMY_FILE) {
            log::info!("no taxonomy yet, starting with an empty tree");
            return Ok(Taxonomy::new());
        }

        let data = self.store.read(TAXONOMY_FILE)?;
        let tree: Taxonomy = serde_json::from_slice(&data)?;
        tree.validate()?;

        log::debug!("loaded taxonomy with {} nodes", tree.len());
        Ok(tree)
    }

    fn save(&self, tree: &Taxonomy) -> Result<(), TaxonomyStoreError> {
        tree.validate()?;
        let data = serde_json::to_vec_pretty(tree)?;
        self.store.write(TAXONOMY_FILE, &data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::Level;

    #[test]
    fn save_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaxonomyStore::new(BackendLocal::new(tmp.path()).unwrap());

        assert!(store.load().unwrap().is_empty());

        let mut tree = Taxonomy::new();
        let main = tree.insert(Level::Main, "Gardening", None).unwrap();
        let sub1 = tree.insert(Level::Sub1, "Buying", Some(&main)).unwrap();
        tree.insert(Level::Sub2, "Buying Seeds", Some(&sub1)).unwrap();
        store.save(&tree).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, tree);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(TAXONOMY_FILE), "{not json").unwrap();
        let store = TaxonomyStore::new(BackendLocal::new(tmp.path()).unwrap());
        assert!(matches!(store.load(), Err(TaxonomyStoreError::Json(_))));
    }
}

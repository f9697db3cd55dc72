use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Instant,
};

pub const DEFAULT_PER_PAGE: usize = 50;
pub const MAX_PER_PAGE: usize = 500;

/// date_added format, UTC
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn timestamp() -> String {
    chrono::Utc::now().format(DATE_FORMAT).to_string()
}

/// One classified (keyword, language) pair. Field order is the on-disk column order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeywordRow {
    pub normalized_text: String,
    pub display_text: String,
    pub language: String,
    pub main_cat: String,
    pub sub_cat_1: String,
    pub sub_cat_2: String,
    pub theme: String,
    pub date_added: String,
    pub prompt_version: String,
    pub source_batch_id: String,
}

impl KeywordRow {
    /// The seven user-facing columns, in export order.
    pub fn display_columns(&self) -> [&str; 7] {
        [
            &self.main_cat,
            &self.sub_cat_1,
            &self.sub_cat_2,
            &self.display_text,
            &self.language,
            &self.theme,
            &self.date_added,
        ]
    }

    pub fn is_complete(&self) -> bool {
        !self.normalized_text.trim().is_empty()
            && self.display_columns().iter().all(|c| !c.trim().is_empty())
    }

    fn key(&self) -> (String, String) {
        (self.language.clone(), self.normalized_text.clone())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KeywordQuery {
    #[serde(default)]
    pub main_cat: Option<String>,
    #[serde(default)]
    pub sub_cat_1: Option<String>,
    #[serde(default)]
    pub sub_cat_2: Option<String>,
    #[serde(default)]
    pub language: Option<String>,

    /// 1-based
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub per_page: Option<usize>,
}

impl KeywordQuery {
    fn matches(&self, row: &KeywordRow) -> bool {
        fn eq(filter: &Option<String>, value: &str) -> bool {
            match filter.as_deref().map(str::trim) {
                None | Some("") => true,
                Some(f) => f.to_lowercase() == value.to_lowercase(),
            }
        }

        eq(&self.main_cat, &row.main_cat)
            && eq(&self.sub_cat_1, &row.sub_cat_1)
            && eq(&self.sub_cat_2, &row.sub_cat_2)
            && eq(&self.language, &row.language)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum KeywordStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("row for {0:?} has an empty column")]
    Incomplete(String),

    #[error("lock poisoned")]
    Poisoned,
}

pub trait KeywordManager: Send + Sync {
    fn find(&self, normalized_text: &str, language: &str) -> Result<Option<KeywordRow>, KeywordStoreError>;
    /// Insert or update by (normalized_text, language). date_added of existing rows is kept.
    fn upsert(&self, rows: Vec<KeywordRow>) -> Result<UpsertStats, KeywordStoreError>;
    /// Like upsert, but date_added is taken from the incoming rows (import of an export).
    fn restore(&self, rows: Vec<KeywordRow>) -> Result<UpsertStats, KeywordStoreError>;
    /// All rows ordered by main_cat, sub_cat_1, sub_cat_2, keyword.
    fn snapshot(&self) -> Result<Vec<KeywordRow>, KeywordStoreError>;
    fn query(&self, query: &KeywordQuery) -> Result<Page<KeywordRow>, KeywordStoreError>;
    fn total(&self) -> Result<usize, KeywordStoreError>;
}

type RowMap = BTreeMap<(String, String), KeywordRow>;

#[derive(Debug, Clone)]
pub struct BackendCsv {
    rows: Arc<RwLock<RowMap>>,
    path: PathBuf,
}

const CSV_HEADERS: [&str; 10] = [
    "normalized_text",
    "display_text",
    "language",
    "main_cat",
    "sub_cat_1",
    "sub_cat_2",
    "theme",
    "date_added",
    "prompt_version",
    "source_batch_id",
];

impl BackendCsv {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeywordStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Err(err) = std::fs::metadata(&path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new keyword table at {}", path.display());
                    write_rows(&path, std::iter::empty())?;
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(&path)?;

        let mut rows = RowMap::new();
        for record in csv_reader.deserialize::<KeywordRow>() {
            let row = record?;
            rows.insert(row.key(), row);
        }

        log::debug!(
            "took {}ms to read {} keyword rows",
            now.elapsed().as_micros() as f64 / 1000.0,
            rows.len()
        );

        Ok(BackendCsv {
            rows: Arc::new(RwLock::new(rows)),
            path,
        })
    }

    fn merge(&self, incoming: Vec<KeywordRow>, keep_date: bool) -> Result<UpsertStats, KeywordStoreError> {
        if let Some(bad) = incoming.iter().find(|r| !r.is_complete()) {
            return Err(KeywordStoreError::Incomplete(bad.display_text.clone()));
        }

        let mut rows = self.rows.write().map_err(|_| KeywordStoreError::Poisoned)?;

        // stage on a copy so a failed write leaves the table untouched
        let mut staged = rows.clone();
        let mut stats = UpsertStats::default();
        for mut row in incoming {
            match staged.get(&row.key()) {
                Some(existing) => {
                    if keep_date {
                        row.date_added = existing.date_added.clone();
                    }
                    stats.updated += 1;
                }
                None => stats.inserted += 1,
            }
            staged.insert(row.key(), row);
        }

        write_rows(&self.path, staged.values())?;
        *rows = staged;

        Ok(stats)
    }
}

fn write_rows<'a>(
    path: &Path,
    rows: impl Iterator<Item = &'a KeywordRow>,
) -> Result<(), KeywordStoreError> {
    let temp_path = path.with_extension("csv-tmp");
    let result = (|| {
        let mut csv_wrt = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&temp_path)?;
        csv_wrt.write_record(CSV_HEADERS)?;
        for row in rows {
            csv_wrt.serialize(row)?;
        }
        csv_wrt.flush()?;
        Ok::<_, KeywordStoreError>(())
    })();

    if let Err(err) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

impl KeywordManager for BackendCsv {
    fn find(&self, normalized_text: &str, language: &str) -> Result<Option<KeywordRow>, KeywordStoreError> {
        let rows = self.rows.read().map_err(|_| KeywordStoreError::Poisoned)?;
        Ok(rows
            .get(&(language.to_string(), normalized_text.to_string()))
            .cloned())
    }

    fn upsert(&self, rows: Vec<KeywordRow>) -> Result<UpsertStats, KeywordStoreError> {
        self.merge(rows, true)
    }

    fn restore(&self, rows: Vec<KeywordRow>) -> Result<UpsertStats, KeywordStoreError> {
        self.merge(rows, false)
    }

    fn snapshot(&self) -> Result<Vec<KeywordRow>, KeywordStoreError> {
        let rows = self.rows.read().map_err(|_| KeywordStoreError::Poisoned)?;
        let mut out: Vec<KeywordRow> = rows.values().cloned().collect();
        out.sort_by(|a, b| {
            (&a.main_cat, &a.sub_cat_1, &a.sub_cat_2, &a.normalized_text, &a.language).cmp(&(
                &b.main_cat,
                &b.sub_cat_1,
                &b.sub_cat_2,
                &b.normalized_text,
                &b.language,
            ))
        });
        Ok(out)
    }

    fn query(&self, query: &KeywordQuery) -> Result<Page<KeywordRow>, KeywordStoreError> {
        let rows = self.rows.read().map_err(|_| KeywordStoreError::Poisoned)?;
        let mut matched: Vec<&KeywordRow> = rows.values().filter(|r| query.matches(r)).collect();

        // newest first, like the explorer view
        matched.sort_by(|a, b| {
            b.date_added
                .cmp(&a.date_added)
                .then_with(|| a.normalized_text.cmp(&b.normalized_text))
        });

        let per_page = query
            .per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE);
        let page = query.page.unwrap_or(1).max(1);
        let items = matched
            .iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .map(|r| (*r).clone())
            .collect();

        Ok(Page {
            items,
            total: matched.len(),
            page,
            per_page,
        })
    }

    fn total(&self) -> Result<usize, KeywordStoreError> {
        Ok(self.rows.read().map_err(|_| KeywordStoreError::Poisoned)?.len())
    }
}

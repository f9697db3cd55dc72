//! Keyword import and the seven-column export format.

use std::collections::HashSet;
use std::io::Write;

use crate::grouping::GroupingError;
use crate::keywords::KeywordRow;
use crate::normalizer::{collapse_whitespace, normalize_key, normalize_language, MAX_BATCH_SIZE};

pub const EXPORT_HEADERS: [&str; 7] = [
    "main_cat",
    "sub_cat_1",
    "sub_cat_2",
    "keyword",
    "language",
    "semantic_theme",
    "date_added",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedKeyword {
    pub keyword: String,
    pub language: Option<String>,
}

/// UTF-8, falling back to Latin-1.
pub fn decode(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) => text.trim_start_matches('\u{feff}').to_string(),
        Err(_) => data.iter().map(|&b| b as char).collect(),
    }
}

/// One keyword per line, blank lines dropped.
pub fn parse_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read a keyword CSV.
///
/// The header row is optional. When present, a `keyword` column is used
/// (otherwise the first column) and a `language` column is picked up.
pub fn read_keywords(data: &[u8]) -> Result<Vec<ImportedKeyword>, GroupingError> {
    let text = decode(data);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = reader.records();
    let Some(first) = records.next() else {
        return Err(GroupingError::input("CSV file is empty"));
    };
    let first = first.map_err(|err| GroupingError::input(format!("invalid CSV: {err}")))?;

    let column = |name: &str| {
        first
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    };
    let (has_header, keyword_col, language_col) = match (column("keyword"), column("language")) {
        (Some(k), lang) => (true, k, lang),
        (None, Some(lang)) => (true, 0, Some(lang)),
        (None, None) => (false, 0, None),
    };

    let mut out = vec![];
    let mut push = |record: &csv::StringRecord| {
        let Some(keyword) = record.get(keyword_col).map(collapse_whitespace).filter(|k| !k.is_empty()) else {
            return;
        };
        let language = language_col
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string);
        out.push(ImportedKeyword { keyword, language });
    };

    if !has_header {
        push(&first);
    }
    for record in records {
        let record = record.map_err(|err| GroupingError::input(format!("invalid CSV: {err}")))?;
        push(&record);
    }

    let unique: HashSet<String> = out.iter().map(|k| normalize_key(&k.keyword)).collect();
    if unique.is_empty() {
        return Err(GroupingError::input("no keywords found in CSV"));
    }
    if unique.len() > MAX_BATCH_SIZE {
        return Err(GroupingError::input(format!(
            "CSV has {} unique keywords, the limit is {MAX_BATCH_SIZE}",
            unique.len()
        )));
    }

    Ok(out)
}

/// Group keywords by language code, in order of first appearance. Rows
/// without a language use `fallback`. Every language is checked up front, so
/// one bad value rejects the whole file.
pub fn group_by_language(
    items: Vec<ImportedKeyword>,
    fallback: Option<&str>,
) -> Result<Vec<(String, Vec<String>)>, GroupingError> {
    let mut groups: Vec<(String, Vec<String>)> = vec![];
    for item in items {
        let lang = normalize_language(item.language.as_deref().or(fallback))?;
        match groups.iter_mut().find(|(l, _)| *l == lang) {
            Some((_, keywords)) => keywords.push(item.keyword),
            None => groups.push((lang, vec![item.keyword])),
        }
    }
    Ok(groups)
}

pub fn write_export<W: Write>(rows: &[KeywordRow], writer: W) -> Result<(), csv::Error> {
    let mut csv_wrt = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
    csv_wrt.write_record(EXPORT_HEADERS)?;
    for row in rows {
        csv_wrt.write_record(row.display_columns())?;
    }
    csv_wrt.flush()?;
    Ok(())
}

pub fn export_to_string(rows: &[KeywordRow]) -> Result<String, csv::Error> {
    let mut buf = vec![];
    write_export(rows, &mut buf)?;
    Ok(decode(&buf))
}

/// Read an export file back into rows. Only the seven display columns are
/// filled in; `normalized_text` is derived from the keyword.
pub fn read_export(data: &[u8]) -> Result<Vec<KeywordRow>, GroupingError> {
    let text = decode(data);
    let mut reader = csv::ReaderBuilder::new().from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|err| GroupingError::input(format!("invalid CSV: {err}")))?
        .clone();
    let index = |name: &str| -> Result<usize, GroupingError> {
        headers
            .iter()
            .position(|h| {
                let h = h.trim();
                h.eq_ignore_ascii_case(name) || (name == "semantic_theme" && h.eq_ignore_ascii_case("theme"))
            })
            .ok_or_else(|| GroupingError::input(format!("export is missing the {name} column")))
    };
    let cols = [
        index("main_cat")?,
        index("sub_cat_1")?,
        index("sub_cat_2")?,
        index("keyword")?,
        index("language")?,
        index("semantic_theme")?,
        index("date_added")?,
    ];

    let mut rows = vec![];
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|err| GroupingError::input(format!("invalid CSV: {err}")))?;
        let get = |i: usize| record.get(cols[i]).unwrap_or_default().to_string();

        let row = KeywordRow {
            normalized_text: normalize_key(&get(3)),
            display_text: get(3),
            language: get(4),
            main_cat: get(0),
            sub_cat_1: get(1),
            sub_cat_2: get(2),
            theme: get(5),
            date_added: get(6),
            prompt_version: String::new(),
            source_batch_id: String::new(),
        };
        if !row.is_complete() {
            return Err(GroupingError::input(format!(
                "export row {} has an empty column",
                line + 2
            )));
        }
        rows.push(row);
    }

    Ok(rows)
}

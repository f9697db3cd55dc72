//! Name similarity for near-duplicate category detection.
//!
//! Names are compared in a loose form: lowercase, `&` spelled out as `and`,
//! punctuation dropped, whitespace collapsed. The score is the Levenshtein
//! ratio of the two forms. Names whose numbers differ never match, so
//! "Size 10 Pots" and "Size 12 Pots" stay separate categories.

/// Loose comparison form of a category name.
pub fn comparison_form(name: &str) -> String {
    let lower = name.to_lowercase().replace('&', " and ");
    let cleaned: String = lower
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity in [0.0, 1.0]; 1.0 means identical comparison forms.
pub fn similarity(a: &str, b: &str) -> f32 {
    let a = comparison_form(a);
    let b = comparison_form(b);

    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() || digits(&a) != digits(&b) {
        return 0.0;
    }

    let longest = a.chars().count().max(b.chars().count());
    1.0 - levenshtein(&a, &b) as f32 / longest as f32
}

fn digits(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_ascii_digit())
        .filter(|d| !d.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Character-level edit distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

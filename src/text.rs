use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "by", "for", "from", "in", "into", "is", "of", "on",
    "or", "the", "to", "with",
];

pub fn clean_text(text: &str) -> String {
    let text = text.replace('\u{a0}', " ");
    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}

pub fn normalize_quotes(text: &str) -> String {
    text.replace(['\u{201c}', '\u{201d}'], "\"")
        .replace('\u{2019}', "'")
}

/// Removes markup tags and decodes the handful of entities NCBI XML uses.
pub fn strip_tags(text: &str) -> String {
    let stripped = TAG_RE.replace_all(text, " ");
    decode_entities(&stripped)
}

pub fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Overlapping windows of `window` characters advancing by `step`. Offsets are
/// character offsets into `text`.
pub fn sliding_window(text: &str, window: usize, step: usize) -> Vec<(usize, String)> {
    let chars = text.chars().collect::<Vec<_>>();
    if window == 0 || chars.len() <= window {
        return vec![(0, text.to_string())];
    }
    let step = step.max(1);
    let mut windows = Vec::new();
    let mut idx = 0;
    while idx < chars.len() {
        let end = (idx + window).min(chars.len());
        windows.push((idx, chars[idx..end].iter().collect()));
        if end >= chars.len() {
            break;
        }
        idx += step;
    }
    windows
}

pub fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let kept = text.chars().take(limit.saturating_sub(3)).collect::<String>();
    format!("{kept}...")
}

pub fn unique_preserve_order<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for value in values {
        let value = value.as_ref().trim();
        if value.is_empty() {
            continue;
        }
        if seen.insert(value.to_lowercase()) {
            result.push(value.to_string());
        }
    }
    result
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty() && !STOPWORDS.contains(token))
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity over lowercase word tokens, stopwords removed.
pub fn title_similarity(left: &str, right: &str) -> f64 {
    let left = tokens(left);
    let right = tokens(right);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    shared as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_cover_tail() {
        let windows = sliding_window("abcdefghij", 4, 3);
        let offsets = windows.iter().map(|(idx, _)| *idx).collect::<Vec<_>>();
        assert_eq!(offsets, vec![0, 3, 6]);
        assert_eq!(windows[2].1, "ghij");
    }

    #[test]
    fn windows_respect_multibyte_text() {
        let windows = sliding_window("ééééé", 2, 2);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2].1, "é");
    }

    #[test]
    fn similarity_ignores_case_and_stopwords() {
        let score = title_similarity(
            "Single-cell atlas of the human placenta",
            "single cell atlas of human placenta",
        );
        assert!((score - 1.0).abs() < f64::EPSILON);
        assert_eq!(title_similarity("", "placenta"), 0.0);
    }

    #[test]
    fn unique_is_case_insensitive() {
        assert_eq!(
            unique_preserve_order(["Homo sapiens", "homo sapiens", "", "Mus musculus"]),
            vec!["Homo sapiens", "Mus musculus"]
        );
    }

    #[test]
    fn strip_tags_decodes_entities() {
        assert_eq!(
            clean_text(&strip_tags("<p>a &amp; <i>b</i></p>")),
            "a & b"
        );
    }
}

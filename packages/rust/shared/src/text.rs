//! Text normalisation shared by cache keys, ranking, and extraction.
//!
//! Everything here is pure and allocation-light. Street abbreviations are
//! expanded so that `R. Augusta` and `Rua Augusta` normalise to the same key.

use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Street-type abbreviations and their expansions, matched at word start.
const STREET_ABBREVIATIONS: &[(&str, &str)] = &[
    ("r", "rua"),
    ("av", "avenida"),
    ("trav", "travessa"),
    ("tv", "travessa"),
    ("al", "alameda"),
    ("pc", "praca"),
    ("pca", "praca"),
    ("est", "estrada"),
    ("rod", "rodovia"),
];

/// Street-type words recognised at the start of an address.
pub const STREET_TYPES: &[&str] = &[
    "rua", "avenida", "travessa", "alameda", "praca", "estrada", "rodovia", "largo", "viela",
    "via", "ladeira",
];

static ABBREVIATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(r|av|trav|tv|al|pc|pca|est|rod)\.\s*").expect("valid regex")
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

static TRAILING_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[,\s]+(n[º°o]?\.?\s*)?\d{1,5}\s*$").expect("valid regex")
});

/// Remove diacritics (`São Paulo` → `Sao Paulo`).
pub fn strip_accents(input: &str) -> String {
    input.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn collapse_whitespace(input: &str) -> String {
    WHITESPACE.replace_all(input.trim(), " ").into_owned()
}

/// Expand dotted street abbreviations (`R.` → `Rua`, `Av.` → `Avenida`).
///
/// Case of the expansion follows the abbreviation's first letter.
pub fn expand_abbreviations(input: &str) -> String {
    let expanded = ABBREVIATION.replace_all(input, |caps: &regex::Captures<'_>| {
        let abbr = &caps[1];
        let lower = abbr.to_lowercase();
        let full = STREET_ABBREVIATIONS
            .iter()
            .find(|(short, _)| *short == lower)
            .map(|(_, long)| *long)
            .unwrap_or(abbr);
        let mut out = String::with_capacity(full.len() + 1);
        if abbr.starts_with(|c: char| c.is_uppercase()) {
            let mut chars = full.chars();
            if let Some(first) = chars.next() {
                out.extend(first.to_uppercase());
                out.push_str(chars.as_str());
            }
        } else {
            out.push_str(full);
        }
        out.push(' ');
        out
    });
    collapse_whitespace(&expanded)
}

/// Drop a leading street-type word (`Rua Augusta` → `Augusta`).
pub fn strip_street_type(input: &str) -> String {
    let trimmed = input.trim();
    let folded = strip_accents(trimmed).to_lowercase();
    for street_type in STREET_TYPES {
        let Some(rest) = folded.strip_prefix(street_type) else {
            continue;
        };
        if rest.starts_with(' ') {
            let cut = trimmed
                .char_indices()
                .nth(street_type.chars().count())
                .map(|(i, _)| i)
                .unwrap_or(trimmed.len());
            return trimmed[cut..].trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Drop a trailing house number (`Rua X, 123` → `Rua X`).
pub fn strip_number(input: &str) -> String {
    TRAILING_NUMBER.replace(input.trim(), "").trim().to_string()
}

/// Whether the text starts with a known street-type word (after expansion).
pub fn starts_with_street_type(input: &str) -> bool {
    let folded = strip_accents(&expand_abbreviations(input)).to_lowercase();
    STREET_TYPES
        .iter()
        .any(|t| folded == *t || folded.starts_with(&format!("{t} ")))
}

/// Canonical comparison key: accents stripped, lowercased, abbreviations
/// expanded, punctuation at the edges removed, whitespace collapsed.
pub fn normalize_key(input: &str) -> String {
    let expanded = expand_abbreviations(input);
    let folded = strip_accents(&expanded).to_lowercase();
    let trimmed = folded.trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace());
    collapse_whitespace(trimmed)
}

/// Keep only ASCII digits.
pub fn digits(input: &str) -> String {
    input.chars().filter(char::is_ascii_digit).collect()
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(input: &str, max: usize) -> &str {
    match input.char_indices().nth(max) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

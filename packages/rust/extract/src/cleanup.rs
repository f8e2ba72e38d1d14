//! Cleanup passes applied to raw pattern matches.
//!
//! Each pass is a small pure function; the extractor composes them per field.

use recordfill_shared::FieldKind;
use recordfill_shared::text::{collapse_whitespace, digits, strip_accents, truncate_chars};

/// Maximum stored length per free-text field, in characters.
pub fn max_len(field: FieldKind) -> usize {
    match field {
        FieldKind::Address => 120,
        FieldKind::Complement => 50,
        FieldKind::Neighborhood | FieldKind::City => 60,
        FieldKind::Category => 80,
        FieldKind::Email => 254,
        FieldKind::Number => 8,
        FieldKind::Region => 2,
        FieldKind::PostalCode => 12,
        FieldKind::Phone | FieldKind::Mobile => 16,
        FieldKind::OrgId => 18,
    }
}

// ---------------------------------------------------------------------------
// Pass: boilerplate lead-ins
// ---------------------------------------------------------------------------

/// Strip leading boilerplate phrases such as `Endereço para atendimento:`.
///
/// Matching ignores case and accents; separators after the phrase are dropped.
pub fn strip_boilerplate(value: &str, phrases: &[String]) -> String {
    let mut current = value.trim().to_string();
    loop {
        let folded = strip_accents(&current).to_lowercase();
        let hit = phrases.iter().find_map(|phrase| {
            let phrase = strip_accents(phrase.trim()).to_lowercase();
            if phrase.is_empty() || !folded.starts_with(&phrase) {
                return None;
            }
            Some(phrase.chars().count())
        });
        let Some(chars) = hit else {
            return current;
        };
        let cut = current
            .char_indices()
            .nth(chars)
            .map(|(i, _)| i)
            .unwrap_or(current.len());
        current = current[cut..]
            .trim_start_matches(|c: char| c == ':' || c == '-' || c == '–' || c.is_whitespace())
            .to_string();
    }
}

// ---------------------------------------------------------------------------
// Pass: trim and collapse
// ---------------------------------------------------------------------------

/// Collapse whitespace, trim edge punctuation, and cut to the field's max length.
pub fn tidy(value: &str, field: FieldKind) -> String {
    let collapsed = collapse_whitespace(value);
    let trimmed = collapsed.trim_matches(|c: char| {
        c.is_whitespace() || matches!(c, ',' | ';' | ':' | '-' | '–' | '|' | '.' | '(' | ')')
    });
    truncate_chars(trimmed, max_len(field)).trim_end().to_string()
}

/// Like [`tidy`], but keeps a trailing dot (abbreviations like `Apto.`).
pub fn tidy_keep_dot(value: &str, field: FieldKind) -> String {
    let collapsed = collapse_whitespace(value);
    let trimmed = collapsed.trim_matches(|c: char| {
        c.is_whitespace() || matches!(c, ',' | ';' | ':' | '-' | '–' | '|')
    });
    truncate_chars(trimmed, max_len(field)).trim_end().to_string()
}

// ---------------------------------------------------------------------------
// Pass: phone formatting
// ---------------------------------------------------------------------------

/// Normalise a raw phone number to `(DD) NNNN-NNNN` or `(DD) 9NNNN-NNNN` and
/// classify it. Country code `55` and a trunk `0` prefix are dropped.
pub fn normalize_phone(raw: &str) -> Option<(FieldKind, String)> {
    let mut d = digits(raw);
    if (d.len() == 12 || d.len() == 13) && d.starts_with("55") {
        d.drain(..2);
    }
    if (d.len() == 11 || d.len() == 12) && d.starts_with('0') {
        d.remove(0);
    }
    match d.len() {
        10 => Some((
            FieldKind::Phone,
            format!("({}) {}-{}", &d[..2], &d[2..6], &d[6..]),
        )),
        // Eleven digits are only valid with the mobile 9 prefix.
        11 if d.as_bytes()[2] == b'9' => Some((
            FieldKind::Mobile,
            format!("({}) {}-{}", &d[..2], &d[2..7], &d[7..]),
        )),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Pass: postal code formatting
// ---------------------------------------------------------------------------

/// Normalise an 8-digit postal code to `NNNNN-NNN`.
pub fn normalize_postal_code(raw: &str) -> Option<String> {
    let d = digits(raw);
    (d.len() == 8).then(|| format!("{}-{}", &d[..5], &d[5..]))
}

// ---------------------------------------------------------------------------
// Pass: email
// ---------------------------------------------------------------------------

/// Lowercase, trim, and drop trailing punctuation picked up from prose.
pub fn normalize_email(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ')'))
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Pass: organisation identifier
// ---------------------------------------------------------------------------

/// Format a 14-digit organisation identifier as `NN.NNN.NNN/NNNN-NN`.
pub fn format_org_id(raw: &str) -> Option<String> {
    let d = digits(raw);
    (d.len() == 14).then(|| {
        format!(
            "{}.{}.{}/{}-{}",
            &d[..2],
            &d[2..5],
            &d[5..8],
            &d[8..12],
            &d[12..]
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phrases() -> Vec<String> {
        vec![
            "Endereço para atendimento".into(),
            "Endereço:".into(),
            "Bairro:".into(),
        ]
    }

    #[test]
    fn boilerplate_is_stripped_repeatedly() {
        assert_eq!(
            strip_boilerplate("Endereco para atendimento: Rua X, 10", &phrases()),
            "Rua X, 10"
        );
        assert_eq!(
            strip_boilerplate("ENDEREÇO: Endereço: Av. Brasil 5", &phrases()),
            "Av. Brasil 5"
        );
        assert_eq!(strip_boilerplate("Rua X, 10", &phrases()), "Rua X, 10");
    }

    #[test]
    fn tidy_trims_and_truncates() {
        assert_eq!(tidy("  , Centro ;", FieldKind::Neighborhood), "Centro");
        let long = "a".repeat(200);
        assert_eq!(tidy(&long, FieldKind::Complement).len(), 50);
        assert_eq!(tidy_keep_dot("Apto. ", FieldKind::Complement), "Apto.");
    }

    #[test]
    fn phones_are_formatted_and_classified() {
        assert_eq!(
            normalize_phone("11 3333-4444"),
            Some((FieldKind::Phone, "(11) 3333-4444".to_string()))
        );
        assert_eq!(
            normalize_phone("+55 (21) 98888-7777"),
            Some((FieldKind::Mobile, "(21) 98888-7777".to_string()))
        );
        assert_eq!(
            normalize_phone("(011) 3333-4444"),
            Some((FieldKind::Phone, "(11) 3333-4444".to_string()))
        );
        assert_eq!(normalize_phone("3333-4444"), None);
        assert_eq!(normalize_phone("(11) 83333-4444"), None);
        assert_eq!(normalize_phone("+55 11 2333-44445"), None);
    }

    #[test]
    fn postal_codes_are_formatted() {
        assert_eq!(normalize_postal_code("01310200"), Some("01310-200".into()));
        assert_eq!(normalize_postal_code("01.310-200"), Some("01310-200".into()));
        assert_eq!(normalize_postal_code("1310-200"), None);
    }

    #[test]
    fn emails_and_org_ids() {
        assert_eq!(normalize_email(" Contato@Clinica.com.br. "), "contato@clinica.com.br");
        assert_eq!(
            format_org_id("11222333000181"),
            Some("11.222.333/0001-81".into())
        );
        assert_eq!(format_org_id("123"), None);
    }
}

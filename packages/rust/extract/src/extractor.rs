//! Pattern-based candidate extraction.
//!
//! Each field type has an ordered set of rules. Structured markup (`tel:`,
//! `mailto:`, `itemprop`) is harvested first; when it yields candidates for
//! a field group, free-text matches for that group are skipped on that page.
//! Matches are cleaned and normalised, never invented: every candidate value
//! is a reformatting of text present in the source.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use recordfill_shared::text::strip_accents;
use recordfill_shared::{Candidate, FieldKind, FiltersConfig, Provenance};

use crate::address::COMPLEMENT_RE;
use crate::cleanup::{
    format_org_id, normalize_email, normalize_phone, normalize_postal_code, strip_boilerplate,
    tidy, tidy_keep_dot,
};
use crate::html::{StructuredMarkup, page_text, structured_markup};
use crate::validate::check_org_id;

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:\b(?i:avenida|rua|travessa|alameda|estrada|rodovia|praça|praca|largo)\b|\b(?i:av|r|al|trav|tv)\.)[^,\n]{3,100}?,?\s*(?:n[º°o]?\.?\s*)?\d{1,5}\b",
    )
    .expect("valid regex")
});

static PHONE_PAREN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?55\s*)?\(\s*0?\d{2}\s*\)\s*9?\s?\d{4}[\s.-]?\d{4}\b").expect("valid regex")
});

static PHONE_BARE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?55\s+)?\b\d{2}\s+9?\d{4}-\d{4}\b").expect("valid regex")
});

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid regex")
});

static POSTAL_DASHED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{2}\.?\d{3}-\d{3}\b").expect("valid regex")
});

static POSTAL_LABELED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bCEP[:\s.]*(\d{8})\b").expect("valid regex")
});

static NEIGHBORHOOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbairro\s*[:\-]?\s*([^,\n\-–;]{3,60})").expect("valid regex")
});

static ORG_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{2}\.?\d{3}\.?\d{3}/?\d{4}-?\d{2}\b").expect("valid regex")
});

/// Where the text being extracted came from.
#[derive(Debug, Clone, Copy)]
pub struct ExtractContext<'a> {
    pub source: Provenance,
    /// URL or client name, carried onto each candidate.
    pub origin: &'a str,
    /// Region code that city matches must be bound to.
    pub region: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Turns page bodies and LLM answers into typed candidates.
#[derive(Debug, Clone)]
pub struct Extractor {
    boilerplate: Vec<String>,
    /// (pattern over accent-folded text, canonical spelling)
    categories: Vec<(Regex, String)>,
}

impl Extractor {
    pub fn new(filters: &FiltersConfig) -> Self {
        let categories = filters
            .categories
            .iter()
            .filter(|c| !c.trim().is_empty())
            .filter_map(|canonical| {
                let folded = strip_accents(canonical.trim()).to_lowercase();
                let pattern = format!(r"\b{}\b", regex::escape(&folded));
                match Regex::new(&pattern) {
                    Ok(re) => Some((re, canonical.trim().to_string())),
                    Err(e) => {
                        warn!(category = %canonical, error = %e, "skipping category pattern");
                        None
                    }
                }
            })
            .collect();

        Self {
            boilerplate: filters.boilerplate.clone(),
            categories,
        }
    }

    /// Extract candidates from an HTML page, preferring structured markup.
    pub fn extract_html(
        &self,
        html: &str,
        fields: &[FieldKind],
        ctx: &ExtractContext<'_>,
    ) -> Vec<Candidate> {
        let markup = structured_markup(html);
        let mut out = Vec::new();
        let covered = self.from_markup(&markup, fields, ctx, &mut out);
        let text = page_text(html);
        self.from_text(&text, fields, ctx, &covered, &mut out);
        debug!(
            origin = ctx.origin,
            structured = covered.len(),
            candidates = out.len(),
            "extracted page"
        );
        out
    }

    /// Extract candidates from plain text (snippets, LLM answers).
    pub fn extract_text(
        &self,
        text: &str,
        fields: &[FieldKind],
        ctx: &ExtractContext<'_>,
    ) -> Vec<Candidate> {
        let mut out = Vec::new();
        self.from_text(text, fields, ctx, &HashSet::new(), &mut out);
        out
    }

    /// Returns the field groups that structured markup covered.
    fn from_markup(
        &self,
        markup: &StructuredMarkup,
        fields: &[FieldKind],
        ctx: &ExtractContext<'_>,
        out: &mut Vec<Candidate>,
    ) -> HashSet<FieldKind> {
        let mut covered = HashSet::new();

        if wants_phone(fields) {
            for raw in &markup.phones {
                if let Some((kind, value)) = normalize_phone(raw) {
                    if fields.contains(&kind) {
                        out.push(Candidate::new(kind, value, ctx.source, ctx.origin));
                        covered.insert(kind);
                    }
                }
            }
        }
        if fields.contains(&FieldKind::Email) {
            for raw in &markup.emails {
                let value = normalize_email(raw);
                if EMAIL_RE.is_match(&value) {
                    out.push(Candidate::new(FieldKind::Email, value, ctx.source, ctx.origin));
                    covered.insert(FieldKind::Email);
                }
            }
        }
        if fields.contains(&FieldKind::PostalCode) {
            for raw in &markup.postal_codes {
                if let Some(value) = normalize_postal_code(raw) {
                    out.push(Candidate::new(
                        FieldKind::PostalCode,
                        value,
                        ctx.source,
                        ctx.origin,
                    ));
                    covered.insert(FieldKind::PostalCode);
                }
            }
        }

        covered
    }

    fn from_text(
        &self,
        text: &str,
        fields: &[FieldKind],
        ctx: &ExtractContext<'_>,
        covered: &HashSet<FieldKind>,
        out: &mut Vec<Candidate>,
    ) {
        let want = |f: FieldKind| fields.contains(&f) && !covered.contains(&f);
        let push = |out: &mut Vec<Candidate>, field: FieldKind, value: String| {
            if !value.is_empty() {
                out.push(Candidate::new(field, value, ctx.source, ctx.origin));
            }
        };
        let city_re = match (ctx.region, fields.contains(&FieldKind::City)) {
            (Some(region), true) => city_pattern(region),
            _ => None,
        };

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let stripped = strip_boilerplate(line, &self.boilerplate);

            if want(FieldKind::Address) || want(FieldKind::Complement) {
                for m in ADDRESS_RE.find_iter(&stripped) {
                    if want(FieldKind::Address) {
                        push(out, FieldKind::Address, tidy(m.as_str(), FieldKind::Address));
                    }
                    if want(FieldKind::Complement) {
                        let rest = &stripped[m.end()..];
                        if let Some(c) = COMPLEMENT_RE.find(rest) {
                            push(
                                out,
                                FieldKind::Complement,
                                tidy_keep_dot(c.as_str(), FieldKind::Complement),
                            );
                        }
                    }
                }
            }

            // Markup precedence is per kind: a `tel:` landline does not hide
            // mobiles written in the text.
            if want(FieldKind::Phone) || want(FieldKind::Mobile) {
                let matches = PHONE_PAREN_RE
                    .find_iter(line)
                    .chain(PHONE_BARE_RE.find_iter(line));
                for m in matches {
                    if let Some((kind, value)) = normalize_phone(m.as_str()) {
                        if want(kind) {
                            push(out, kind, value);
                        }
                    }
                }
            }

            if want(FieldKind::Email) {
                for m in EMAIL_RE.find_iter(line) {
                    push(out, FieldKind::Email, normalize_email(m.as_str()));
                }
            }

            if want(FieldKind::PostalCode) {
                for m in POSTAL_DASHED_RE.find_iter(line) {
                    if let Some(value) = normalize_postal_code(m.as_str()) {
                        push(out, FieldKind::PostalCode, value);
                    }
                }
                for caps in POSTAL_LABELED_RE.captures_iter(line) {
                    if let Some(value) = normalize_postal_code(&caps[1]) {
                        push(out, FieldKind::PostalCode, value);
                    }
                }
            }

            if want(FieldKind::Neighborhood) {
                for caps in NEIGHBORHOOD_RE.captures_iter(line) {
                    push(
                        out,
                        FieldKind::Neighborhood,
                        tidy(&caps[1], FieldKind::Neighborhood),
                    );
                }
            }

            if let Some(re) = &city_re {
                if want(FieldKind::City) {
                    for caps in re.captures_iter(line) {
                        push(out, FieldKind::City, tidy(&caps[1], FieldKind::City));
                    }
                }
            }

            if want(FieldKind::OrgId) {
                for m in ORG_ID_RE.find_iter(line) {
                    if check_org_id(m.as_str()).is_ok() {
                        if let Some(value) = format_org_id(m.as_str()) {
                            push(out, FieldKind::OrgId, value);
                        }
                    }
                }
            }

            if want(FieldKind::Category) {
                let folded = strip_accents(line).to_lowercase();
                for (re, canonical) in &self.categories {
                    if re.is_match(&folded) {
                        push(out, FieldKind::Category, canonical.clone());
                    }
                }
            }
        }
    }
}

fn wants_phone(fields: &[FieldKind]) -> bool {
    fields.contains(&FieldKind::Phone) || fields.contains(&FieldKind::Mobile)
}

/// City names followed by the record's region code: `São Paulo - SP`,
/// `Campinas/SP`, `Santos (SP)`, or after `em`.
fn city_pattern(region: &str) -> Option<Regex> {
    let region = region.trim().to_uppercase();
    if region.len() != 2 || !region.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    let pattern = format!(
        r"(?:^|[,;(|]|\s[-–]\s|\bem\s)\s*(\p{{Lu}}[\p{{L}}'.]*(?:\s+(?:d[aeo]s?|\p{{Lu}}[\p{{L}}'.]*))*)\s*(?:[-/–]\s*{region}\b|\(\s*{region}\s*\))"
    );
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(%region, error = %e, "invalid city pattern");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> Extractor {
        Extractor::new(&FiltersConfig::default())
    }

    fn ctx(region: Option<&str>) -> ExtractContext<'_> {
        ExtractContext {
            source: Provenance::Page,
            origin: "https://clinica.example/contato",
            region,
        }
    }

    fn values(candidates: &[Candidate], field: FieldKind) -> Vec<String> {
        candidates
            .iter()
            .filter(|c| c.field == field)
            .map(|c| c.value.clone())
            .collect()
    }

    const ALL: &[FieldKind] = &[
        FieldKind::Address,
        FieldKind::Complement,
        FieldKind::Neighborhood,
        FieldKind::PostalCode,
        FieldKind::City,
        FieldKind::Phone,
        FieldKind::Mobile,
        FieldKind::Email,
        FieldKind::Category,
        FieldKind::OrgId,
    ];

    #[test]
    fn extracts_contact_block() {
        let text = "Endereço para atendimento: Rua Augusta, 1500 - Sala 42\n\
                    Bairro: Consolação, São Paulo - SP\n\
                    CEP 01304-001\n\
                    Tel: (11) 3333-4444 / Cel: (11) 98888-7777\n\
                    contato@clinica.com.br\n\
                    Especialidade: Cardiologia\n\
                    CNPJ 11.222.333/0001-81";
        let out = extractor().extract_text(text, ALL, &ctx(Some("SP")));

        assert_eq!(values(&out, FieldKind::Address), vec!["Rua Augusta, 1500"]);
        assert_eq!(values(&out, FieldKind::Complement), vec!["Sala 42"]);
        assert_eq!(values(&out, FieldKind::Neighborhood), vec!["Consolação"]);
        assert_eq!(values(&out, FieldKind::City), vec!["São Paulo"]);
        assert_eq!(values(&out, FieldKind::PostalCode), vec!["01304-001"]);
        assert_eq!(values(&out, FieldKind::Phone), vec!["(11) 3333-4444"]);
        assert_eq!(values(&out, FieldKind::Mobile), vec!["(11) 98888-7777"]);
        assert_eq!(values(&out, FieldKind::Email), vec!["contato@clinica.com.br"]);
        assert_eq!(values(&out, FieldKind::Category), vec!["Cardiologia"]);
        assert_eq!(values(&out, FieldKind::OrgId), vec!["11.222.333/0001-81"]);
        assert!(out.iter().all(|c| c.source == Provenance::Page));
    }

    #[test]
    fn structured_markup_takes_precedence() {
        let html = r#"<html><body>
            <a href="tel:+551122223333">Ligue</a>
            <p>Fax (11) 5555-6666</p>
            <p>contato@clinica.com.br</p>
        </body></html>"#;
        let out = extractor().extract_html(html, &[FieldKind::Phone, FieldKind::Email], &ctx(None));
        assert_eq!(values(&out, FieldKind::Phone), vec!["(11) 2222-3333"]);
        assert_eq!(values(&out, FieldKind::Email), vec!["contato@clinica.com.br"]);
    }

    #[test]
    fn markup_landline_keeps_text_mobiles() {
        let html = r#"<html><body>
            <a href="tel:+551122223333">Ligue</a>
            <p>WhatsApp (11) 98888-7777</p>
            <p>Fax (11) 5555-6666</p>
        </body></html>"#;
        let out = extractor().extract_html(
            html,
            &[FieldKind::Phone, FieldKind::Mobile],
            &ctx(None),
        );
        assert_eq!(values(&out, FieldKind::Phone), vec!["(11) 2222-3333"]);
        assert_eq!(values(&out, FieldKind::Mobile), vec!["(11) 98888-7777"]);

        let html = r#"<a href="tel:11977776666">Zap</a><p>Tel (11) 3333-4444</p>"#;
        let out = extractor().extract_html(
            html,
            &[FieldKind::Phone, FieldKind::Mobile],
            &ctx(None),
        );
        assert_eq!(values(&out, FieldKind::Mobile), vec!["(11) 97777-6666"]);
        assert_eq!(values(&out, FieldKind::Phone), vec!["(11) 3333-4444"]);
    }

    #[test]
    fn only_requested_fields_are_emitted() {
        let text = "Rua Augusta, 100 (11) 3333-4444";
        let out = extractor().extract_text(text, &[FieldKind::Phone], &ctx(None));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].field, FieldKind::Phone);
    }

    #[test]
    fn city_is_bound_to_region() {
        let text = "Atendimento em Campinas/SP\nFilial: Niterói - RJ";
        let out = extractor().extract_text(text, &[FieldKind::City], &ctx(Some("SP")));
        assert_eq!(values(&out, FieldKind::City), vec!["Campinas"]);
    }

    #[test]
    fn invalid_org_ids_and_plain_numbers_are_ignored() {
        let text = "CNPJ 11.222.333/0001-82 protocolo 12345678";
        let out = extractor().extract_text(
            text,
            &[FieldKind::OrgId, FieldKind::PostalCode],
            &ctx(None),
        );
        assert!(out.is_empty());
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(extractor().extract_text("", ALL, &ctx(Some("SP"))).is_empty());
    }
}

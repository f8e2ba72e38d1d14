//! Per-field acceptance rules.
//!
//! Every predicate is pure. A refused value yields a [`Rejection`] reason,
//! which callers log at debug level and drop; it never becomes a record error.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use recordfill_shared::text::{digits, starts_with_street_type, strip_accents};
use recordfill_shared::{Candidate, FieldKind, FiltersConfig};

use crate::cleanup::max_len;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9._%+-]+@[a-z0-9-]+(?:\.[a-z0-9-]+)*\.[a-z]{2,}$").expect("valid regex")
});

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:\d{1,6}[a-z]?|s/?n)$").expect("valid regex")
});

static REGION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2}$").expect("valid regex"));

/// Why a candidate value was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    TooLong(usize),
    /// Looks like an explanation or refusal rather than data.
    RefusalText,
    Malformed(&'static str),
    DeniedDomain(String),
    DigitCount(usize),
    AreaCode(u32),
    NotMobile,
    MissingStreetType,
    ZeroPostalCode,
    Checksum,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty value"),
            Self::TooLong(n) => write!(f, "too long ({n} chars)"),
            Self::RefusalText => f.write_str("refusal or explanatory text"),
            Self::Malformed(what) => write!(f, "malformed {what}"),
            Self::DeniedDomain(d) => write!(f, "denied domain {d}"),
            Self::DigitCount(n) => write!(f, "{n} digits"),
            Self::AreaCode(code) => write!(f, "area code {code} out of range"),
            Self::NotMobile => f.write_str("subscriber number does not start with 9"),
            Self::MissingStreetType => f.write_str("no street-type prefix"),
            Self::ZeroPostalCode => f.write_str("all-zero postal code"),
            Self::Checksum => f.write_str("check digits do not match"),
        }
    }
}

/// Field validator configured with the run's deny lists.
#[derive(Debug, Clone)]
pub struct Validator {
    email_denylist: Vec<String>,
    refusal_terms: Vec<String>,
    require_street_type: bool,
}

impl Validator {
    pub fn new(filters: &FiltersConfig) -> Self {
        Self {
            email_denylist: filters
                .email_denylist
                .iter()
                .map(|d| d.trim().trim_start_matches('@').to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            refusal_terms: filters
                .refusal_terms
                .iter()
                .map(|t| strip_accents(t).to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            require_street_type: filters.require_street_type,
        }
    }

    /// Check a value for the given field.
    pub fn check(&self, field: FieldKind, value: &str) -> Result<(), Rejection> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Rejection::Empty);
        }
        let chars = value.chars().count();
        if chars > max_len(field) {
            return Err(Rejection::TooLong(chars));
        }
        if self.looks_like_refusal(value) {
            return Err(Rejection::RefusalText);
        }
        match field {
            FieldKind::Email => self.check_email(value),
            FieldKind::Phone => check_phone(value, false),
            FieldKind::Mobile => check_phone(value, true),
            FieldKind::Address => self.check_address(value),
            FieldKind::PostalCode => check_postal_code(value),
            FieldKind::Number => NUMBER_RE
                .is_match(value)
                .then_some(())
                .ok_or(Rejection::Malformed("house number")),
            FieldKind::Region => REGION_RE
                .is_match(value)
                .then_some(())
                .ok_or(Rejection::Malformed("region code")),
            FieldKind::City | FieldKind::Neighborhood => check_place_name(value),
            FieldKind::Complement | FieldKind::Category => Ok(()),
            FieldKind::OrgId => check_org_id(value),
        }
    }

    /// Whether a candidate passes; rejections are logged at debug level.
    pub fn accept(&self, candidate: &Candidate) -> bool {
        match self.check(candidate.field, &candidate.value) {
            Ok(()) => true,
            Err(reason) => {
                debug!(
                    field = %candidate.field,
                    value = %candidate.value,
                    source = %candidate.source,
                    %reason,
                    "candidate rejected"
                );
                false
            }
        }
    }

    fn looks_like_refusal(&self, value: &str) -> bool {
        let folded = strip_accents(value).to_lowercase();
        self.refusal_terms.iter().any(|t| folded.contains(t.as_str()))
    }

    fn check_email(&self, value: &str) -> Result<(), Rejection> {
        let lower = value.to_lowercase();
        if !EMAIL_RE.is_match(&lower) {
            return Err(Rejection::Malformed("email"));
        }
        let domain = lower.rsplit('@').next().unwrap_or_default();
        let denied = self
            .email_denylist
            .iter()
            .find(|d| domain == d.as_str() || domain.ends_with(&format!(".{d}")));
        match denied {
            Some(d) => Err(Rejection::DeniedDomain(d.clone())),
            None => Ok(()),
        }
    }

    fn check_address(&self, value: &str) -> Result<(), Rejection> {
        if !value.chars().any(|c| c.is_ascii_digit()) {
            return Err(Rejection::Malformed("address without a number"));
        }
        let has_word = value
            .split(|c: char| !c.is_alphabetic())
            .any(|w| w.chars().count() >= 4);
        if !has_word {
            return Err(Rejection::Malformed("address without a street name"));
        }
        if self.require_street_type && !starts_with_street_type(value) {
            return Err(Rejection::MissingStreetType);
        }
        Ok(())
    }
}

fn check_phone(value: &str, mobile: bool) -> Result<(), Rejection> {
    let d = digits(value);
    if d.len() != 10 && d.len() != 11 {
        return Err(Rejection::DigitCount(d.len()));
    }
    let area: u32 = d[..2].parse().map_err(|_| Rejection::Malformed("area code"))?;
    if !(11..=99).contains(&area) {
        return Err(Rejection::AreaCode(area));
    }
    if mobile && d.as_bytes()[2] != b'9' {
        return Err(Rejection::NotMobile);
    }
    Ok(())
}

fn check_postal_code(value: &str) -> Result<(), Rejection> {
    if value
        .chars()
        .any(|c| !(c.is_ascii_digit() || matches!(c, '-' | '.' | ' ')))
    {
        return Err(Rejection::Malformed("postal code"));
    }
    let d = digits(value);
    if d.len() != 8 {
        return Err(Rejection::DigitCount(d.len()));
    }
    if d.bytes().all(|b| b == b'0') {
        return Err(Rejection::ZeroPostalCode);
    }
    Ok(())
}

fn check_place_name(value: &str) -> Result<(), Rejection> {
    if value.chars().any(|c| c.is_ascii_digit()) {
        return Err(Rejection::Malformed("place name with digits"));
    }
    if value.chars().filter(|c| c.is_alphabetic()).count() < 2 {
        return Err(Rejection::Malformed("place name"));
    }
    Ok(())
}

/// Validate the two check digits of a 14-digit organisation identifier.
pub fn check_org_id(value: &str) -> Result<(), Rejection> {
    const FIRST: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    const SECOND: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

    let d: Vec<u32> = value.chars().filter_map(|c| c.to_digit(10)).collect();
    if d.len() != 14 {
        return Err(Rejection::DigitCount(d.len()));
    }
    if d.iter().all(|x| *x == d[0]) {
        return Err(Rejection::Checksum);
    }
    let check = |weights: &[u32]| {
        let sum: u32 = weights.iter().zip(&d).map(|(w, x)| w * x).sum();
        match sum % 11 {
            r if r < 2 => 0,
            r => 11 - r,
        }
    };
    if check(&FIRST) == d[12] && check(&SECOND) == d[13] {
        Ok(())
    } else {
        Err(Rejection::Checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordfill_shared::Provenance;

    fn validator() -> Validator {
        Validator::new(&FiltersConfig::default())
    }

    #[test]
    fn emails() {
        let v = validator();
        assert!(v.check(FieldKind::Email, "contato@clinica.com.br").is_ok());
        assert!(v.check(FieldKind::Email, "Dr.Jane@Hospital.ORG").is_ok());
        assert_eq!(
            v.check(FieldKind::Email, "agenda@boaconsulta.com"),
            Err(Rejection::DeniedDomain("boaconsulta.com".into()))
        );
        assert!(v.check(FieldKind::Email, "x@mail.example.com").is_err());
        assert!(v.check(FieldKind::Email, "not an email").is_err());
        assert!(v.check(FieldKind::Email, "a b@c.com").is_err());
        assert_eq!(
            v.check(FieldKind::Email, "exemplo@clinica.com"),
            Err(Rejection::RefusalText)
        );
    }

    #[test]
    fn phones_and_mobiles() {
        let v = validator();
        assert!(v.check(FieldKind::Phone, "(11) 3333-4444").is_ok());
        assert!(v.check(FieldKind::Mobile, "(21) 98888-7777").is_ok());
        assert_eq!(
            v.check(FieldKind::Mobile, "(21) 3888-7777"),
            Err(Rejection::NotMobile)
        );
        assert_eq!(
            v.check(FieldKind::Phone, "(09) 3333-4444"),
            Err(Rejection::AreaCode(9))
        );
        assert_eq!(
            v.check(FieldKind::Phone, "3333-4444"),
            Err(Rejection::DigitCount(8))
        );
    }

    #[test]
    fn addresses() {
        let v = validator();
        assert!(v.check(FieldKind::Address, "Rua Augusta, 100").is_ok());
        assert!(v.check(FieldKind::Address, "Av. Paulista 1000").is_ok());
        assert_eq!(
            v.check(FieldKind::Address, "Edifício Central 10"),
            Err(Rejection::MissingStreetType)
        );
        assert!(v.check(FieldKind::Address, "Rua Augusta").is_err());
        assert!(v.check(FieldKind::Address, "Rua 1 2").is_err());

        let lenient = Validator::new(&FiltersConfig {
            require_street_type: false,
            ..FiltersConfig::default()
        });
        assert!(lenient.check(FieldKind::Address, "Edifício Central 10").is_ok());
    }

    #[test]
    fn postal_codes() {
        let v = validator();
        assert!(v.check(FieldKind::PostalCode, "01310-200").is_ok());
        assert!(v.check(FieldKind::PostalCode, "01310200").is_ok());
        assert_eq!(
            v.check(FieldKind::PostalCode, "00000-000"),
            Err(Rejection::ZeroPostalCode)
        );
        assert!(v.check(FieldKind::PostalCode, "0131-200").is_err());
        assert!(v.check(FieldKind::PostalCode, "CEP 01310-200").is_err());
    }

    #[test]
    fn org_id_check_digits() {
        assert!(check_org_id("11.222.333/0001-81").is_ok());
        assert_eq!(check_org_id("11.222.333/0001-82"), Err(Rejection::Checksum));
        assert_eq!(check_org_id("11111111111111"), Err(Rejection::Checksum));
    }

    #[test]
    fn other_fields() {
        let v = validator();
        assert!(v.check(FieldKind::Number, "100").is_ok());
        assert!(v.check(FieldKind::Number, "S/N").is_ok());
        assert!(v.check(FieldKind::Number, "cem").is_err());
        assert!(v.check(FieldKind::Region, "SP").is_ok());
        assert!(v.check(FieldKind::Region, "sp").is_err());
        assert!(v.check(FieldKind::City, "São Paulo").is_ok());
        assert!(v.check(FieldKind::City, "01310").is_err());
        assert_eq!(
            v.check(FieldKind::City, "Não posso ajudar com isso"),
            Err(Rejection::RefusalText)
        );
    }

    #[test]
    fn accept_drops_rejected_candidates() {
        let v = validator();
        let good = Candidate::new(FieldKind::Phone, "(11) 3333-4444", Provenance::Page, "u");
        let bad = Candidate::new(FieldKind::Phone, "(00) 3333-4444", Provenance::Page, "u");
        assert!(v.accept(&good));
        assert!(!v.accept(&bad));
    }
}

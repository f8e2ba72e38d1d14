//! Core domain types for record enrichment.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RecordfillError, Result};
use crate::text;

// ---------------------------------------------------------------------------
// FieldKind
// ---------------------------------------------------------------------------

/// Every attribute the pipeline knows how to extract, validate, or resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Address,
    Number,
    Complement,
    Neighborhood,
    PostalCode,
    City,
    Region,
    Phone,
    Mobile,
    Email,
    Category,
    /// Organisation tax identifier, only used to seed a second query round.
    OrgId,
}

impl FieldKind {
    /// Attributes stored on a [`ResolvedRecord`], in output order.
    pub const RESOLVABLE: [FieldKind; 11] = [
        FieldKind::Address,
        FieldKind::Number,
        FieldKind::Complement,
        FieldKind::Neighborhood,
        FieldKind::PostalCode,
        FieldKind::City,
        FieldKind::Region,
        FieldKind::Phone,
        FieldKind::Mobile,
        FieldKind::Email,
        FieldKind::Category,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::Number => "number",
            Self::Complement => "complement",
            Self::Neighborhood => "neighborhood",
            Self::PostalCode => "postal_code",
            Self::City => "city",
            Self::Region => "region",
            Self::Phone => "phone",
            Self::Mobile => "mobile",
            Self::Email => "email",
            Self::Category => "category",
            Self::OrgId => "org_id",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Which source or strategy supplied a resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// Present in the input row.
    Input,
    /// Title or snippet of a search result.
    SearchSnippet,
    /// Page fetched over plain HTTP.
    Page,
    /// Page rendered by the headless browser.
    BrowserPage,
    /// LLM disambiguation pass.
    Llm,
    /// Structured postal API, looked up by address.
    StructuredApi,
    /// Structured postal API, looked up by code.
    CodeApi,
    /// Generic search-engine scrape for a postal code.
    SearchScrape,
    /// Government postal portal form.
    Portal,
    /// City-level generic postal code (lower confidence).
    CityDefault,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::SearchSnippet => "search-snippet",
            Self::Page => "page",
            Self::BrowserPage => "browser-page",
            Self::Llm => "llm",
            Self::StructuredApi => "structured-api",
            Self::CodeApi => "code-api",
            Self::SearchScrape => "search-scrape",
            Self::Portal => "portal",
            Self::CityDefault => "city-default",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// An unvalidated value extracted from one page or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub field: FieldKind,
    pub value: String,
    pub source: Provenance,
    /// URL or client name the value came from, for logging.
    pub origin: String,
}

impl Candidate {
    pub fn new(
        field: FieldKind,
        value: impl Into<String>,
        source: Provenance,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            field,
            value: value.into(),
            source,
            origin: origin.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// PartialRecord
// ---------------------------------------------------------------------------

/// One input row: identifying fields plus whatever attributes were already known.
///
/// Never mutated by the pipeline; resolution produces a [`ResolvedRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialRecord {
    /// Zero-based row index in the input table.
    pub row: usize,
    /// Person or organisation name.
    pub name: String,
    pub organization: Option<String>,
    /// Professional registration or organisation identifier.
    pub identifier: Option<String>,
    /// Administrative region code (`SP`, `RJ`, ...).
    pub region: Option<String>,
    pub street: Option<String>,
    pub number: Option<String>,
    pub complement: Option<String>,
    pub neighborhood: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub phone: Option<String>,
    pub mobile: Option<String>,
    pub email: Option<String>,
    pub category: Option<String>,
}

impl PartialRecord {
    /// An already-known attribute value, if present and non-blank.
    pub fn known(&self, field: FieldKind) -> Option<&str> {
        let value = match field {
            FieldKind::Address => &self.street,
            FieldKind::Number => &self.number,
            FieldKind::Complement => &self.complement,
            FieldKind::Neighborhood => &self.neighborhood,
            FieldKind::PostalCode => &self.postal_code,
            FieldKind::City => &self.city,
            FieldKind::Region => &self.region,
            FieldKind::Phone => &self.phone,
            FieldKind::Mobile => &self.mobile,
            FieldKind::Email => &self.email,
            FieldKind::Category => &self.category,
            FieldKind::OrgId => return None,
        };
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    /// Stable SHA-256 over the identifying fields, hex encoded.
    pub fn hash(&self) -> String {
        record_hash(&[
            &self.name,
            self.organization.as_deref().unwrap_or(""),
            self.identifier.as_deref().unwrap_or(""),
            self.region.as_deref().unwrap_or(""),
        ])
    }
}

/// Hash a list of identifying fields. Fields are normalised and
/// separated so that `("ab", "c")` and `("a", "bc")` differ.
pub fn record_hash(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(text::normalize_key(field).as_bytes());
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// ResolvedRecord
// ---------------------------------------------------------------------------

/// A resolved attribute value and the source that supplied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolved {
    pub value: String,
    pub provenance: Provenance,
}

/// Final per-record status written to the output table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Every requested attribute has a value.
    Complete,
    /// Some attributes resolved.
    Partial,
    /// Nothing new was found.
    #[default]
    Unresolved,
    /// An unexpected failure interrupted resolution; fields found so far are kept.
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Unresolved => "unresolved",
            Self::Failed => "failed",
        }
    }
}

/// The input record plus resolved attributes, each with one provenance tag.
///
/// Values must be validated before they are stored; [`ResolvedRecord::set`]
/// is only called by the orchestrator after the validator accepted them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRecord {
    pub input: PartialRecord,
    pub address: Option<Resolved>,
    pub number: Option<Resolved>,
    pub complement: Option<Resolved>,
    pub neighborhood: Option<Resolved>,
    pub postal_code: Option<Resolved>,
    pub city: Option<Resolved>,
    pub region: Option<Resolved>,
    pub phone: Option<Resolved>,
    pub mobile: Option<Resolved>,
    pub email: Option<Resolved>,
    pub category: Option<Resolved>,
    /// Organisation identifier discovered during search, if any.
    pub discovered_id: Option<String>,
    pub status: RecordStatus,
}

impl ResolvedRecord {
    pub fn new(input: PartialRecord) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    fn slot(&self, field: FieldKind) -> Option<&Option<Resolved>> {
        Some(match field {
            FieldKind::Address => &self.address,
            FieldKind::Number => &self.number,
            FieldKind::Complement => &self.complement,
            FieldKind::Neighborhood => &self.neighborhood,
            FieldKind::PostalCode => &self.postal_code,
            FieldKind::City => &self.city,
            FieldKind::Region => &self.region,
            FieldKind::Phone => &self.phone,
            FieldKind::Mobile => &self.mobile,
            FieldKind::Email => &self.email,
            FieldKind::Category => &self.category,
            FieldKind::OrgId => return None,
        })
    }

    fn slot_mut(&mut self, field: FieldKind) -> Option<&mut Option<Resolved>> {
        Some(match field {
            FieldKind::Address => &mut self.address,
            FieldKind::Number => &mut self.number,
            FieldKind::Complement => &mut self.complement,
            FieldKind::Neighborhood => &mut self.neighborhood,
            FieldKind::PostalCode => &mut self.postal_code,
            FieldKind::City => &mut self.city,
            FieldKind::Region => &mut self.region,
            FieldKind::Phone => &mut self.phone,
            FieldKind::Mobile => &mut self.mobile,
            FieldKind::Email => &mut self.email,
            FieldKind::Category => &mut self.category,
            FieldKind::OrgId => return None,
        })
    }

    pub fn get(&self, field: FieldKind) -> Option<&Resolved> {
        self.slot(field).and_then(Option::as_ref)
    }

    pub fn value(&self, field: FieldKind) -> Option<&str> {
        self.get(field).map(|r| r.value.as_str())
    }

    pub fn has(&self, field: FieldKind) -> bool {
        self.get(field).is_some()
    }

    /// Store a validated value, replacing any previous one.
    /// Returns `false` for fields that are not stored on the record.
    pub fn set(&mut self, field: FieldKind, value: impl Into<String>, provenance: Provenance) -> bool {
        match self.slot_mut(field) {
            Some(slot) => {
                *slot = Some(Resolved {
                    value: value.into(),
                    provenance,
                });
                true
            }
            None => false,
        }
    }

    /// Number of attributes resolved by the pipeline (input values excluded).
    pub fn resolved_count(&self) -> usize {
        FieldKind::RESOLVABLE
            .iter()
            .filter_map(|f| self.get(*f))
            .filter(|r| r.provenance != Provenance::Input)
            .count()
    }

    /// Derive the final status from which targets are filled.
    pub fn finalize(&mut self, targets: &[FieldKind]) {
        if self.status == RecordStatus::Failed {
            return;
        }
        let missing = targets.iter().filter(|f| !self.has(**f)).count();
        self.status = if missing == 0 && !targets.is_empty() {
            RecordStatus::Complete
        } else if self.resolved_count() > 0 {
            RecordStatus::Partial
        } else {
            RecordStatus::Unresolved
        };
    }
}

// ---------------------------------------------------------------------------
// Postal payload and cache
// ---------------------------------------------------------------------------

/// Postal lookup result. Field names on the wire follow the Brazilian postal
/// API so the payload deserializes straight from its responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostalPayload {
    #[serde(rename = "cep", default)]
    pub postal_code: String,
    #[serde(rename = "logradouro", default, skip_serializing_if = "String::is_empty")]
    pub street: String,
    #[serde(rename = "complemento", default, skip_serializing_if = "String::is_empty")]
    pub complement: String,
    #[serde(rename = "bairro", default, skip_serializing_if = "String::is_empty")]
    pub neighborhood: String,
    #[serde(rename = "localidade", default, skip_serializing_if = "String::is_empty")]
    pub city: String,
    #[serde(rename = "uf", default, skip_serializing_if = "String::is_empty")]
    pub region: String,
}

impl PostalPayload {
    /// A payload carrying only a postal code.
    pub fn code(postal_code: impl Into<String>) -> Self {
        Self {
            postal_code: postal_code.into(),
            ..Self::default()
        }
    }
}

/// Normalised (street, city, region) cache key.
///
/// Street and city are lowercased, accent-stripped, and abbreviation-expanded;
/// the region code is uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub street: String,
    pub city: String,
    pub region: String,
}

impl CacheKey {
    pub fn new(street: &str, city: &str, region: &str) -> Self {
        Self {
            street: text::normalize_key(street),
            city: text::normalize_key(city),
            region: region.trim().to_uppercase(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.street, self.city, self.region)
    }
}

impl std::str::FromStr for CacheKey {
    type Err = RecordfillError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '|');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(street), Some(city), Some(region)) => Ok(Self {
                street: street.to_string(),
                city: city.to_string(),
                region: region.to_string(),
            }),
            _ => Err(RecordfillError::Cache(format!("malformed cache key: {s}"))),
        }
    }
}

/// Whether a cascade run found a code or exhausted every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStatus {
    Found,
    NotFound,
}

/// Cached outcome of one postal cascade run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: LookupStatus,
    #[serde(default)]
    pub payload: PostalPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn found(payload: PostalPayload, provenance: Provenance) -> Self {
        Self {
            status: LookupStatus::Found,
            payload,
            provenance: Some(provenance),
            stored_at: Utc::now(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: LookupStatus::NotFound,
            payload: PostalPayload::default(),
            provenance: None,
            stored_at: Utc::now(),
        }
    }

    pub fn is_found(&self) -> bool {
        self.status == LookupStatus::Found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_normalizes() {
        let key = CacheKey::new("Rua X", "São Paulo", "sp");
        assert_eq!(key.street, "rua x");
        assert_eq!(key.city, "sao paulo");
        assert_eq!(key.region, "SP");
        assert_eq!(key, CacheKey::new("R. X", "SAO PAULO", "SP"));
    }

    #[test]
    fn cache_key_string_roundtrip() {
        let key = CacheKey::new("Av. Paulista", "São Paulo", "SP");
        let text = key.to_string();
        assert_eq!(text, "avenida paulista|sao paulo|SP");
        let parsed: CacheKey = text.parse().expect("parse key");
        assert_eq!(parsed, key);
        assert!("no separators".parse::<CacheKey>().is_err());
    }

    #[test]
    fn postal_payload_uses_api_field_names() {
        let json = r#"{"cep":"01310-200","bairro":"Bela Vista","localidade":"São Paulo","uf":"SP"}"#;
        let payload: PostalPayload = serde_json::from_str(json).expect("parse payload");
        assert_eq!(payload.postal_code, "01310-200");
        assert_eq!(payload.neighborhood, "Bela Vista");
        assert!(payload.street.is_empty());

        let out = serde_json::to_value(PostalPayload::code("01310-200")).expect("serialize");
        assert_eq!(out, serde_json::json!({"cep": "01310-200"}));
    }

    #[test]
    fn record_hash_is_stable_and_separated() {
        let a = record_hash(&["Jane Doe", "SP"]);
        assert_eq!(a, record_hash(&["  jane   doe ", "sp"]));
        assert_ne!(record_hash(&["ab", "c"]), record_hash(&["a", "bc"]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn resolved_record_status() {
        let mut record = ResolvedRecord::new(PartialRecord {
            name: "Jane Doe".into(),
            ..PartialRecord::default()
        });
        record.finalize(&[FieldKind::Phone, FieldKind::Email]);
        assert_eq!(record.status, RecordStatus::Unresolved);

        assert!(record.set(FieldKind::Phone, "(11) 3333-4444", Provenance::Page));
        assert!(!record.set(FieldKind::OrgId, "x", Provenance::Page));
        record.finalize(&[FieldKind::Phone, FieldKind::Email]);
        assert_eq!(record.status, RecordStatus::Partial);

        record.set(FieldKind::Email, "a@b.com", Provenance::Llm);
        record.finalize(&[FieldKind::Phone, FieldKind::Email]);
        assert_eq!(record.status, RecordStatus::Complete);
        assert_eq!(record.resolved_count(), 2);
    }

    #[test]
    fn known_ignores_blank_values() {
        let record = PartialRecord {
            city: Some("  ".into()),
            region: Some(" SP ".into()),
            ..PartialRecord::default()
        };
        assert_eq!(record.known(FieldKind::City), None);
        assert_eq!(record.known(FieldKind::Region), Some("SP"));
    }
}

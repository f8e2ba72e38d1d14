//! Cross-source aggregation and frequency ranking.
//!
//! Values are counted per field by normalised key; the ranked list is ordered
//! by descending count, ties keeping first-seen order. This is the only
//! consensus mechanism across sources, so it must stay deterministic.

use std::collections::BTreeMap;

use recordfill_shared::text::{digits, normalize_key};
use recordfill_shared::{Candidate, FieldKind, Provenance};

/// One distinct value for a field, with its corroboration count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedValue {
    /// Display form of the first occurrence.
    pub value: String,
    pub count: usize,
    /// Provenance of the first occurrence.
    pub source: Provenance,
    /// Distinct sources that reported the value, in first-seen order.
    pub sources: Vec<Provenance>,
}

/// Ranked candidates for one record, grouped by field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankedCandidates {
    by_field: BTreeMap<FieldKind, Vec<RankedValue>>,
}

impl RankedCandidates {
    pub fn get(&self, field: FieldKind) -> &[RankedValue] {
        self.by_field.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn top(&self, field: FieldKind) -> Option<&RankedValue> {
        self.get(field).first()
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldKind> + '_ {
        self.by_field.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_field.is_empty()
    }
}

/// Key under which two spellings of a value count as the same value.
pub fn rank_key(field: FieldKind, value: &str) -> String {
    match field {
        FieldKind::Phone | FieldKind::Mobile | FieldKind::PostalCode | FieldKind::OrgId => {
            digits(value)
        }
        FieldKind::Email => value.trim().to_lowercase(),
        _ => normalize_key(value),
    }
}

/// Count, deduplicate, and order candidates per field.
pub fn rank<'a>(candidates: impl IntoIterator<Item = &'a Candidate>) -> RankedCandidates {
    let mut by_field: BTreeMap<FieldKind, Vec<(String, RankedValue)>> = BTreeMap::new();

    for candidate in candidates {
        let key = rank_key(candidate.field, &candidate.value);
        if key.is_empty() {
            continue;
        }
        let entries = by_field.entry(candidate.field).or_default();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, ranked)) => {
                ranked.count += 1;
                if !ranked.sources.contains(&candidate.source) {
                    ranked.sources.push(candidate.source);
                }
            }
            None => entries.push((
                key,
                RankedValue {
                    value: candidate.value.clone(),
                    count: 1,
                    source: candidate.source,
                    sources: vec![candidate.source],
                },
            )),
        }
    }

    let by_field = by_field
        .into_iter()
        .map(|(field, entries)| {
            let mut ranked: Vec<RankedValue> = entries.into_iter().map(|(_, v)| v).collect();
            // Stable: equal counts keep first-seen order.
            ranked.sort_by(|a, b| b.count.cmp(&a.count));
            (field, ranked)
        })
        .collect();

    RankedCandidates { by_field }
}

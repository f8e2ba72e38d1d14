//! Search query construction.

use std::collections::HashSet;

use recordfill_shared::PartialRecord;
use recordfill_shared::text::{collapse_whitespace, normalize_key};

/// Ordered, deduplicated queries for a record, most specific first.
///
/// 1. name, organization, labelled identifier, region
/// 2. name and a discovered organisation id
/// 3. name and region
/// 4. name alone
/// 5. labelled identifier and region
///
/// Missing parts are left out; a query that collapses to an earlier one or
/// to nothing is dropped.
pub fn build_queries(
    record: &PartialRecord,
    discovered_id: Option<&str>,
    identifier_label: &str,
) -> Vec<String> {
    let name = clean(Some(&record.name));
    let organization = clean(record.organization.as_deref())
        .filter(|org| name.as_deref().map(normalize_key) != Some(normalize_key(org)));
    let identifier = clean(record.identifier.as_deref()).map(|id| {
        let label = identifier_label.trim();
        if label.is_empty() { id } else { format!("{label} {id}") }
    });
    let region = clean(record.region.as_deref());
    let discovered = clean(discovered_id);

    let candidates = [
        vec![&name, &organization, &identifier, &region],
        if discovered.is_some() {
            vec![&name, &discovered]
        } else {
            Vec::new()
        },
        vec![&name, &region],
        vec![&name],
        vec![&identifier, &region],
    ];

    let mut seen = HashSet::new();
    candidates
        .iter()
        .filter(|parts| !parts.is_empty())
        // A query is anchored on its first part.
        .filter(|parts| parts.iter().take(1).any(|p| p.is_some()))
        .map(|parts| {
            let joined: Vec<&str> = parts.iter().filter_map(|p| p.as_deref()).collect();
            joined.join(" ")
        })
        .filter(|q| !q.is_empty())
        .filter(|q| seen.insert(q.to_lowercase()))
        .collect()
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(collapse_whitespace)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

//! URL filtering and result prioritisation.

use url::Url;

use recordfill_shared::FiltersConfig;
use recordfill_shared::text::{normalize_key, strip_accents};

use crate::SearchHit;

/// Drops URLs on blacklisted domains and non-textual resources.
#[derive(Debug, Clone, Default)]
pub struct UrlFilter {
    domains: Vec<String>,
    extensions: Vec<String>,
}

impl UrlFilter {
    pub fn new(filters: &FiltersConfig) -> Self {
        Self {
            domains: filters
                .domain_blacklist
                .iter()
                .map(|d| d.trim().trim_start_matches("www.").to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            extensions: filters
                .skip_extensions
                .iter()
                .map(|e| {
                    let e = e.trim().to_lowercase();
                    if e.starts_with('.') { e } else { format!(".{e}") }
                })
                .collect(),
        }
    }

    /// Whether `url` may be fetched.
    pub fn allows(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        let host = parsed.host_str().unwrap_or_default().to_lowercase();
        let blocked = self
            .domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")));
        if blocked {
            return false;
        }
        let path = parsed.path().to_lowercase();
        !self.extensions.iter().any(|ext| path.ends_with(ext.as_str()))
    }

    /// Keep only hits whose URL may be fetched.
    pub fn retain(&self, hits: Vec<SearchHit>) -> Vec<SearchHit> {
        hits.into_iter().filter(|h| self.allows(&h.url)).collect()
    }
}

/// Order hits so that URLs containing the entity's name slug come first,
/// deduplicate by URL, and cap the list at `max`.
pub fn prioritize_hits(hits: Vec<SearchHit>, name: &str, max: usize) -> Vec<SearchHit> {
    let parts: Vec<String> = normalize_key(name)
        .split_whitespace()
        .filter(|p| p.len() > 2)
        .map(str::to_string)
        .collect();

    let mut seen = std::collections::HashSet::new();
    let mut unique: Vec<SearchHit> = hits
        .into_iter()
        .filter(|h| seen.insert(h.url.clone()))
        .collect();

    let score = |hit: &SearchHit| {
        let url = strip_accents(&hit.url).to_lowercase();
        parts.iter().filter(|p| url.contains(p.as_str())).count()
    };
    // Stable: equal scores keep search order.
    unique.sort_by_key(|h| std::cmp::Reverse(score(h)));
    unique.truncate(max);
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(url: &str) -> SearchHit {
        SearchHit {
            url: url.to_string(),
            title: String::new(),
            snippet: String::new(),
        }
    }

    #[test]
    fn blocks_blacklisted_domains_and_documents() {
        let filter = UrlFilter::new(&FiltersConfig::default());
        assert!(filter.allows("https://clinica.com.br/contato"));
        assert!(!filter.allows("https://www.facebook.com/janedoe"));
        assert!(!filter.allows("https://m.linkedin.com/in/jane"));
        assert!(!filter.allows("https://site.com.br/curriculo.PDF"));
        assert!(!filter.allows("ftp://site.com.br/"));
        assert!(!filter.allows("not a url"));
        // Substring of a blacklisted domain is not a match.
        assert!(filter.allows("https://notfacebook.com.br/"));
    }

    #[test]
    fn prioritizes_name_slug_and_caps() {
        let hits = vec![
            hit("https://directory.com/list"),
            hit("https://clinica.com/dra-jane-doe"),
            hit("https://directory.com/list"),
            hit("https://other.com/doe"),
            hit("https://another.com/"),
        ];
        let ordered = prioritize_hits(hits, "Jane Doe", 3);
        let urls: Vec<&str> = ordered.iter().map(|h| h.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://clinica.com/dra-jane-doe",
                "https://other.com/doe",
                "https://directory.com/list",
            ]
        );
    }
}

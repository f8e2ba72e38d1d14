//! Call-counting source doubles for pipeline tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use recordfill_shared::{PostalPayload, RecordfillError, Result};
use recordfill_sources::{Fetch, Llm, PostalApi, PostalPortal, SearchBackend, SearchHit, SessionControl};

fn down(source: &str) -> RecordfillError {
    RecordfillError::source(source, "HTTP 503")
}

pub struct MockLlm {
    answer: Option<String>,
    calls: AtomicUsize,
}

impl MockLlm {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: Some(answer.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Llm for MockLlm {
    async fn infer(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().ok_or_else(|| down("llm"))
    }
}

/// Postal API answering every address lookup with `entries` (or failing
/// when `None`) and code lookups from `codes`. Panics on streets containing
/// `panic_on`.
#[derive(Default)]
pub struct MockPostalApi {
    pub entries: Option<Vec<PostalPayload>>,
    pub codes: HashMap<String, PostalPayload>,
    pub panic_on: Option<String>,
    pub(crate) lookups: AtomicUsize,
    pub(crate) code_lookups: AtomicUsize,
}

impl MockPostalApi {
    pub fn returning(entries: Vec<PostalPayload>) -> Self {
        Self {
            entries: Some(entries),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn code_lookups(&self) -> usize {
        self.code_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PostalApi for MockPostalApi {
    async fn lookup(&self, street: &str, _city: &str, _region: &str) -> Result<Vec<PostalPayload>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(needle) = &self.panic_on {
            if street.contains(needle.as_str()) {
                panic!("postal API blew up on {street}");
            }
        }
        self.entries.clone().ok_or_else(|| down("postal-api"))
    }

    async fn lookup_code(&self, code: &str) -> Result<Option<PostalPayload>> {
        self.code_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.codes.get(code).cloned())
    }
}

pub struct MockSearch {
    name: String,
    hits: Option<Vec<SearchHit>>,
    calls: AtomicUsize,
}

impl MockSearch {
    pub fn returning(name: &str, hits: Vec<SearchHit>) -> Self {
        Self {
            name: name.to_string(),
            hits: Some(hits),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            hits: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchBackend for MockSearch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut hits = self.hits.clone().ok_or_else(|| down(&self.name))?;
        hits.truncate(limit);
        Ok(hits)
    }
}

pub fn hit(url: &str, snippet: &str) -> SearchHit {
    SearchHit {
        url: url.to_string(),
        title: String::new(),
        snippet: snippet.to_string(),
    }
}

pub struct MockPortal {
    rows: Option<Vec<PostalPayload>>,
    calls: AtomicUsize,
}

impl MockPortal {
    pub fn returning(rows: Vec<PostalPayload>) -> Self {
        Self {
            rows: Some(rows),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            rows: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PostalPortal for MockPortal {
    async fn search(&self, _address: &str) -> Result<Vec<PostalPayload>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rows.clone().ok_or_else(|| down("portal"))
    }
}

/// Serves fixed pages by URL; anything else is unavailable.
#[derive(Default)]
pub struct MockFetch {
    pub pages: HashMap<String, String>,
    calls: AtomicUsize,
    browser_calls: AtomicUsize,
}

impl MockFetch {
    pub fn with_page(url: &str, html: &str) -> Self {
        let mut fetch = Self::default();
        fetch.pages.insert(url.to_string(), html.to_string());
        fetch
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn browser_calls(&self) -> usize {
        self.browser_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for MockFetch {
    async fn fetch(&self, url: &str, use_browser: bool) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if use_browser {
            self.browser_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.pages.get(url).cloned().ok_or_else(|| down("http"))
    }
}

#[derive(Default)]
pub struct MockSession {
    releases: AtomicUsize,
}

impl MockSession {
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionControl for MockSession {
    async fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

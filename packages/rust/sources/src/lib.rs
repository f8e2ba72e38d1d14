//! Source clients for recordfill.
//!
//! Every external collaborator sits behind a small async trait so the
//! resolution pipeline can swap in mocks:
//! - [`Fetch`]: page text for a URL, over HTTP or the headless browser
//! - [`SearchBackend`]: result URLs and snippets for a query
//! - [`Llm`]: raw completion text for a prompt
//! - [`PostalApi`]: structured postal lookups by address or by code
//! - [`PostalPortal`]: form-driven postal portal lookup
//! - [`SessionControl`]: lifecycle of a worker-owned browser
//!
//! Clients apply bounded, source-specific timeouts and report any network
//! failure, timeout, non-2xx status, or unreadable body as
//! [`RecordfillError::SourceUnavailable`]; nothing panics across the boundary.

pub mod browser;
mod filter;
mod http;
mod ollama;
mod searx;
mod viacep;
pub mod webdriver;

use std::future::Future;

use async_trait::async_trait;
use tracing::warn;

use recordfill_shared::{PostalPayload, RecordfillError, Result};

pub use browser::{BrowserOptions, BrowserSession};
pub use filter::{UrlFilter, prioritize_hits};
pub use http::{HttpFetcher, RoutedFetcher};
pub use ollama::OllamaClient;
pub use searx::SearxClient;
pub use viacep::ViaCepClient;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Fetch a page's HTML.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Fetch `url`, rendering it in the browser when `use_browser` is set
    /// and a browser is available.
    async fn fetch(&self, url: &str, use_browser: bool) -> Result<String>;
}

/// A search engine or aggregator.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Short name used in logs and candidate origins.
    fn name(&self) -> &str;

    /// Up to `limit` results for `query`, blacklisted URLs already removed.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;
}

/// An LLM inference endpoint.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Raw completion text for `prompt`; expected (not guaranteed) to be JSON.
    async fn infer(&self, prompt: &str) -> Result<String>;
}

/// A structured postal directory.
#[async_trait]
pub trait PostalApi: Send + Sync {
    /// Postal entries matching a street in a city and region.
    async fn lookup(&self, street: &str, city: &str, region: &str) -> Result<Vec<PostalPayload>>;

    /// Details for one postal code; `None` when the code does not exist.
    async fn lookup_code(&self, code: &str) -> Result<Option<PostalPayload>>;
}

/// A postal lookup portal driven through its search form.
#[async_trait]
pub trait PostalPortal: Send + Sync {
    /// Entries the portal lists for a free-text address; empty when the
    /// portal reports no match.
    async fn search(&self, address: &str) -> Result<Vec<PostalPayload>>;
}

/// Lifecycle control for a worker-owned browser.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Tear down the browser, if one is running. The next use starts a fresh one.
    async fn release(&self);
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Run `call`, retrying exactly once when the source is unavailable.
///
/// Other errors are returned as-is.
pub async fn retry_once<T, F, Fut>(source: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match call().await {
        Err(e) if e.is_source_unavailable() => {
            warn!(source, error = %e, "source unavailable, retrying once");
            call().await
        }
        other => other,
    }
}

/// Map a reqwest failure to a source error.
pub(crate) fn transport_error(source: &str, url: &str, e: reqwest::Error) -> RecordfillError {
    let kind = if e.is_timeout() { "timed out" } else { "request failed" };
    RecordfillError::source(source, format!("{url}: {kind}: {e}"))
}

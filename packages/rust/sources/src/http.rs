//! Plain HTTP page fetching, and routing between HTTP and the browser.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::Client;
use tracing::debug;

use recordfill_shared::{RecordfillError, Result};

use crate::browser::BrowserSession;
use crate::filter::UrlFilter;
use crate::{Fetch, transport_error};

const SOURCE: &str = "http";

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// Maximum response size we read (5 MB).
const MAX_RESPONSE_SIZE: u64 = 5 * 1024 * 1024;

/// Fetches pages over plain HTTP with a rotating user agent.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    user_agents: Vec<String>,
    filter: UrlFilter,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agents: Vec<String>, filter: UrlFilter) -> Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .build()
            .map_err(|e| RecordfillError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            user_agents,
            filter,
        })
    }

    /// Fetch a page's body as text.
    pub async fn get(&self, url: &str) -> Result<String> {
        if !self.filter.allows(url) {
            return Err(RecordfillError::validation(format!("{url}: filtered")));
        }
        debug!(%url, "fetching page");

        let mut request = self.client.get(url);
        if let Some(agent) = pick_user_agent(&self.user_agents) {
            request = request.header(reqwest::header::USER_AGENT, agent);
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(SOURCE, url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecordfillError::source(SOURCE, format!("{url}: HTTP {status}")));
        }

        if let Some(len) = response.content_length() {
            if len > MAX_RESPONSE_SIZE {
                return Err(RecordfillError::source(
                    SOURCE,
                    format!("{url}: response too large ({len} bytes)"),
                ));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_lowercase();
        if !is_textual(&content_type) {
            return Err(RecordfillError::source(
                SOURCE,
                format!("{url}: non-textual content type {content_type}"),
            ));
        }

        response
            .text()
            .await
            .map_err(|e| RecordfillError::source(SOURCE, format!("{url}: body read failed: {e}")))
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str, _use_browser: bool) -> Result<String> {
        self.get(url).await
    }
}

fn is_textual(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || content_type.contains("html")
        || content_type.contains("xml")
        || content_type.contains("json")
}

/// Pick a random user agent from the configured list.
pub(crate) fn pick_user_agent(agents: &[String]) -> Option<String> {
    agents.choose(&mut rand::thread_rng()).cloned()
}

// ---------------------------------------------------------------------------
// RoutedFetcher
// ---------------------------------------------------------------------------

/// Sends browser requests to the worker's browser session and everything
/// else over plain HTTP.
pub struct RoutedFetcher {
    http: HttpFetcher,
    browser: Option<Arc<BrowserSession>>,
}

impl RoutedFetcher {
    pub fn new(http: HttpFetcher, browser: Option<Arc<BrowserSession>>) -> Self {
        Self { http, browser }
    }
}

#[async_trait]
impl Fetch for RoutedFetcher {
    async fn fetch(&self, url: &str, use_browser: bool) -> Result<String> {
        match (&self.browser, use_browser) {
            (Some(browser), true) => {
                if !self.http.filter.allows(url) {
                    return Err(RecordfillError::validation(format!("{url}: filtered")));
                }
                browser.page_source(url).await
            }
            _ => self.http.get(url).await,
        }
    }
}

//! Worker-owned headless browser session.
//!
//! One [`BrowserSession`] belongs to exactly one batch worker. The underlying
//! WebDriver session is started lazily on first use, and torn down and
//! replaced once it has served `recycle_after` navigations. The session
//! backs three roles:
//! - page fetching ([`BrowserSession::page_source`])
//! - a results-page [`SearchBackend`]
//! - the form-driven [`PostalPortal`]

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use recordfill_shared::text::collapse_whitespace;
use recordfill_shared::{PostalPayload, RecordfillError, Result};

use crate::filter::UrlFilter;
use crate::http::pick_user_agent;
use crate::webdriver::{SessionId, SessionSpec, WebDriverClient};
use crate::{PostalPortal, SearchBackend, SearchHit, SessionControl};

const SEARCH_SOURCE: &str = "browser-search";

/// Portal form field and submit button.
const PORTAL_INPUT: &str = "#endereco";
const PORTAL_SUBMIT: &str = "#btn_pesquisar";

/// Settings for one browser session.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub webdriver_url: String,
    /// Results-page search URL; the query goes in `?q=`.
    pub search_url: String,
    pub portal_url: String,
    pub timeout: Duration,
    /// Navigations served before the browser is replaced.
    pub recycle_after: usize,
    pub user_agents: Vec<String>,
    /// How many times to poll the portal for its results table.
    pub portal_polls: usize,
    pub portal_poll_interval: Duration,
}

impl BrowserOptions {
    pub fn new(webdriver_url: &str, search_url: &str, portal_url: &str, timeout: Duration) -> Self {
        Self {
            webdriver_url: webdriver_url.to_string(),
            search_url: search_url.to_string(),
            portal_url: portal_url.to_string(),
            timeout,
            recycle_after: 5,
            user_agents: Vec::new(),
            portal_polls: 10,
            portal_poll_interval: Duration::from_secs(1),
        }
    }
}

struct ActiveSession {
    id: SessionId,
    navigations: usize,
}

/// Lazily started, periodically recycled WebDriver session.
pub struct BrowserSession {
    driver: WebDriverClient,
    options: BrowserOptions,
    filter: UrlFilter,
    state: Mutex<Option<ActiveSession>>,
}

impl BrowserSession {
    pub fn new(options: BrowserOptions, filter: UrlFilter) -> Result<Self> {
        // Commands get extra headroom over the page-load timeout.
        let driver = WebDriverClient::new(&options.webdriver_url, options.timeout * 2)?;
        Ok(Self {
            driver,
            options,
            filter,
            state: Mutex::new(None),
        })
    }

    /// Navigate to `url` and return the rendered DOM.
    pub async fn page_source(&self, url: &str) -> Result<String> {
        let (_guard, id) = self.open(url).await?;
        self.driver.page_source(&id).await
    }

    /// Navigations served by the current browser, if one is running.
    pub async fn navigations(&self) -> Option<usize> {
        self.state.lock().await.as_ref().map(|s| s.navigations)
    }

    /// Start or recycle the browser as needed, then navigate.
    ///
    /// The returned guard keeps the session exclusive until the caller is
    /// done reading from the page.
    async fn open(&self, url: &str) -> Result<(MutexGuard<'_, Option<ActiveSession>>, SessionId)> {
        let mut guard = self.state.lock().await;

        let exhausted = guard
            .as_ref()
            .is_some_and(|s| s.navigations >= self.options.recycle_after.max(1));
        if exhausted {
            if let Some(old) = guard.take() {
                info!(navigations = old.navigations, "recycling browser");
                self.close(&old.id).await;
            }
        }

        let mut active = match guard.take() {
            Some(active) => active,
            None => {
                let spec = SessionSpec {
                    user_agent: pick_user_agent(&self.options.user_agents),
                    page_load_timeout: self.options.timeout,
                };
                ActiveSession {
                    id: self.driver.new_session(&spec).await?,
                    navigations: 0,
                }
            }
        };
        active.navigations += 1;
        let id = active.id.clone();
        *guard = Some(active);

        debug!(%url, "browser navigate");
        if let Err(e) = self.driver.navigate(&id, url).await {
            // A session that failed to navigate is not reused.
            if let Some(old) = guard.take() {
                self.close(&old.id).await;
            }
            return Err(e);
        }
        Ok((guard, id))
    }

    async fn close(&self, id: &SessionId) {
        if let Err(e) = self.driver.delete_session(id).await {
            warn!(error = %e, "failed to close browser session");
        }
    }

    async fn submit_portal_form(&self, address: &str) -> Result<String> {
        let (_guard, id) = self.open(&self.options.portal_url).await?;

        let input = self.driver.find_element(&id, PORTAL_INPUT).await?;
        self.driver.clear(&id, &input).await?;
        self.driver.send_keys(&id, &input, address).await?;
        let submit = self.driver.find_element(&id, PORTAL_SUBMIT).await?;
        self.driver.click(&id, &submit).await?;

        for attempt in 0..self.options.portal_polls.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.options.portal_poll_interval).await;
            }
            let html = self.driver.page_source(&id).await?;
            if portal_settled(&html) {
                return Ok(html);
            }
        }
        Err(RecordfillError::source(
            "portal",
            "results did not appear before the poll limit",
        ))
    }
}

#[async_trait]
impl SearchBackend for BrowserSession {
    fn name(&self) -> &str {
        SEARCH_SOURCE
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let url = Url::parse_with_params(&self.options.search_url, &[("q", query)])
            .map_err(|e| RecordfillError::config(format!("invalid browser search URL: {e}")))?;
        let html = self.page_source(url.as_str()).await?;
        let mut hits = self.filter.retain(parse_result_page(&html));
        hits.truncate(limit);
        Ok(hits)
    }
}

#[async_trait]
impl PostalPortal for BrowserSession {
    async fn search(&self, address: &str) -> Result<Vec<PostalPayload>> {
        let html = self.submit_portal_form(address).await?;
        Ok(parse_portal_results(&html))
    }
}

#[async_trait]
impl SessionControl for BrowserSession {
    async fn release(&self) {
        let mut guard = self.state.lock().await;
        if let Some(old) = guard.take() {
            debug!(navigations = old.navigations, "releasing browser");
            self.close(&old.id).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Page parsing
// ---------------------------------------------------------------------------

/// Organic results from a results page (`li.b_algo`).
pub fn parse_result_page(html: &str) -> Vec<SearchHit> {
    let doc = Html::parse_document(html);
    let (Ok(item_sel), Ok(link_sel), Ok(snippet_sel)) = (
        Selector::parse("li.b_algo"),
        Selector::parse("h2 a"),
        Selector::parse(".b_caption p, p"),
    ) else {
        return Vec::new();
    };

    doc.select(&item_sel)
        .filter_map(|item| {
            let link = item.select(&link_sel).next()?;
            let url = link.value().attr("href")?.trim().to_string();
            let title = collapse_whitespace(&link.text().collect::<String>());
            let snippet = item
                .select(&snippet_sel)
                .next()
                .map(|p| collapse_whitespace(&p.text().collect::<String>()))
                .unwrap_or_default();
            Some(SearchHit {
                url,
                title,
                snippet,
            })
        })
        .collect()
}

/// Whether the portal page shows either its results table or its
/// "not found" message.
fn portal_settled(html: &str) -> bool {
    let doc = Html::parse_document(html);
    ["table#resultado-DNEC tbody tr", "div.mensagem.alert.alert-danger"]
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .any(|sel| doc.select(&sel).next().is_some())
}

/// Rows of the portal results table: street, neighborhood, `City/UF`, code.
///
/// An explicit "not found" page yields an empty list.
pub fn parse_portal_results(html: &str) -> Vec<PostalPayload> {
    let doc = Html::parse_document(html);
    let (Ok(row_sel), Ok(cell_sel)) = (
        Selector::parse("table#resultado-DNEC tbody tr"),
        Selector::parse("td"),
    ) else {
        return Vec::new();
    };

    doc.select(&row_sel)
        .filter_map(|row| {
            let cells: Vec<String> = row
                .select(&cell_sel)
                .map(|c| collapse_whitespace(&c.text().collect::<String>()))
                .collect();
            if cells.len() < 4 || cells[3].is_empty() {
                return None;
            }
            let (city, region) = match cells[2].rsplit_once('/') {
                Some((city, region)) => (city.trim().to_string(), region.trim().to_string()),
                None => (cells[2].clone(), String::new()),
            };
            Some(PostalPayload {
                postal_code: cells[3].clone(),
                street: cells[0].clone(),
                complement: String::new(),
                neighborhood: cells[1].clone(),
                city,
                region,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordfill_shared::FiltersConfig;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PORTAL_HTML: &str = r#"
        <html><body>
        <table id="resultado-DNEC"><thead><tr><th>Logradouro</th></tr></thead>
        <tbody>
          <tr><td>Avenida Paulista - de 1047 a 1865 - lado ímpar</td><td>Bela Vista</td>
              <td>São Paulo/SP</td><td>01310-200</td></tr>
        </tbody></table>
        </body></html>"#;

    fn options(uri: &str, recycle_after: usize) -> BrowserOptions {
        BrowserOptions {
            recycle_after,
            portal_poll_interval: Duration::from_millis(10),
            ..BrowserOptions::new(
                uri,
                &format!("{uri}/search"),
                &format!("{uri}/portal"),
                Duration::from_secs(5),
            )
        }
    }

    async fn mount_driver(server: &MockServer, source: &str, sessions: u64) {
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "sessionId": "s1", "capabilities": {} }
            })))
            .expect(sessions)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/url"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/s1/source"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": source })))
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/session/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .mount(server)
            .await;
    }

    #[test]
    fn parses_result_page() {
        let html = r#"
            <ol id="b_results">
              <li class="b_algo"><h2><a href="https://clinica.com.br/jane">Dra. Jane Doe</a></h2>
                <div class="b_caption"><p>Rua X, 10 - São Paulo/SP</p></div></li>
              <li class="b_ad"><h2><a href="https://ads.test/">Ad</a></h2></li>
              <li class="b_algo"><h2>No link</h2></li>
            </ol>"#;
        let hits = parse_result_page(html);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://clinica.com.br/jane");
        assert_eq!(hits[0].title, "Dra. Jane Doe");
        assert_eq!(hits[0].snippet, "Rua X, 10 - São Paulo/SP");
    }

    #[test]
    fn parses_portal_table_and_not_found() {
        let rows = parse_portal_results(PORTAL_HTML);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].postal_code, "01310-200");
        assert_eq!(rows[0].neighborhood, "Bela Vista");
        assert_eq!(rows[0].city, "São Paulo");
        assert_eq!(rows[0].region, "SP");
        assert!(portal_settled(PORTAL_HTML));

        let missing = r#"<div class="mensagem alert alert-danger">Dados não encontrado</div>"#;
        assert!(portal_settled(missing));
        assert!(parse_portal_results(missing).is_empty());
        assert!(!portal_settled("<form id='formulario'></form>"));
    }

    #[tokio::test]
    async fn recycles_after_configured_navigations() {
        let server = MockServer::start().await;
        mount_driver(&server, "<p>page</p>", 2).await;

        let browser =
            BrowserSession::new(options(&server.uri(), 2), UrlFilter::default()).unwrap();
        for _ in 0..3 {
            assert_eq!(browser.page_source("https://a.test/").await.unwrap(), "<p>page</p>");
        }
        // Third navigation ran on a fresh browser.
        assert_eq!(browser.navigations().await, Some(1));

        browser.release().await;
        assert_eq!(browser.navigations().await, None);
    }

    #[tokio::test]
    async fn browser_search_filters_hits() {
        let server = MockServer::start().await;
        let page = r#"<ol>
            <li class="b_algo"><h2><a href="https://www.facebook.com/jane">Jane</a></h2></li>
            <li class="b_algo"><h2><a href="https://clinica.com.br/">Clinica</a></h2></li>
        </ol>"#;
        mount_driver(&server, page, 1).await;

        let filters = FiltersConfig::default();
        let browser =
            BrowserSession::new(options(&server.uri(), 5), UrlFilter::new(&filters)).unwrap();
        let hits = SearchBackend::search(&browser, "jane doe", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://clinica.com.br/");
    }

    #[tokio::test]
    async fn portal_form_submission() {
        let server = MockServer::start().await;
        mount_driver(&server, PORTAL_HTML, 1).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/element"))
            .and(body_partial_json(json!({ "using": "css selector", "value": "#endereco" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "element-6066-11e4-a52e-4f735466cecf": "input-1" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/element"))
            .and(body_partial_json(json!({ "value": "#btn_pesquisar" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "element-6066-11e4-a52e-4f735466cecf": "button-1" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/element/input-1/value"))
            .and(body_partial_json(json!({ "text": "Avenida Paulista 1578 São Paulo SP" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/session/s1/element/[a-z0-9-]+/(clear|click)$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .mount(&server)
            .await;

        let browser =
            BrowserSession::new(options(&server.uri(), 5), UrlFilter::default()).unwrap();
        let rows = PostalPortal::search(&browser, "Avenida Paulista 1578 São Paulo SP")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].postal_code, "01310-200");
    }
}

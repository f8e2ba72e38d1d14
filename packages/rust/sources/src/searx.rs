//! Search-aggregator client (SearXNG JSON API).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use recordfill_shared::{RecordfillError, Result};

use crate::filter::UrlFilter;
use crate::{SearchBackend, SearchHit, transport_error};

const SOURCE: &str = "searx";

#[derive(Debug, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxResult>,
    #[serde(default)]
    infoboxes: Vec<SearxInfobox>,
}

#[derive(Debug, Deserialize)]
struct SearxResult {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

/// Knowledge-panel block. Often carries an address or phone for businesses.
#[derive(Debug, Deserialize)]
struct SearxInfobox {
    #[serde(default)]
    infobox: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    urls: Vec<SearxLink>,
}

#[derive(Debug, Deserialize)]
struct SearxLink {
    #[serde(default)]
    url: String,
}

/// Queries a SearXNG instance and returns filtered hits.
#[derive(Debug, Clone)]
pub struct SearxClient {
    client: Client,
    base_url: String,
    engines: String,
    language: String,
    filter: UrlFilter,
}

impl SearxClient {
    pub fn new(
        base_url: &str,
        engines: &str,
        language: &str,
        timeout: Duration,
        filter: UrlFilter,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecordfillError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            engines: engines.to_string(),
            language: language.to_string(),
            filter,
        })
    }
}

#[async_trait]
impl SearchBackend for SearxClient {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let url = format!("{}/search", self.base_url);
        debug!(query, "searx search");

        let mut params = vec![("q", query), ("format", "json")];
        if !self.engines.is_empty() {
            params.push(("engines", self.engines.as_str()));
        }
        if !self.language.is_empty() {
            params.push(("language", self.language.as_str()));
        }

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| transport_error(SOURCE, &url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecordfillError::source(SOURCE, format!("{url}: HTTP {status}")));
        }

        let body: SearxResponse = response
            .json()
            .await
            .map_err(|e| RecordfillError::source(SOURCE, format!("{url}: bad JSON: {e}")))?;

        let infoboxes = body.infoboxes.into_iter().map(|b| {
            let link = b.urls.into_iter().map(|l| l.url).find(|u| !u.is_empty());
            SearchHit {
                url: link.unwrap_or(b.id),
                title: b.infobox,
                snippet: b.content,
            }
        });
        let results = body.results.into_iter().map(|r| SearchHit {
            url: r.url,
            title: r.title,
            snippet: r.content,
        });

        let mut hits = self.filter.retain(infoboxes.chain(results).collect());
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordfill_shared::FiltersConfig;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(uri: &str) -> SearxClient {
        SearxClient::new(
            uri,
            "bing",
            "pt-BR",
            Duration::from_secs(5),
            UrlFilter::new(&FiltersConfig::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn parses_results_and_infoboxes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "Jane Doe SP"))
            .and(query_param("format", "json"))
            .and(query_param("engines", "bing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    { "url": "https://clinica.com.br/jane", "title": "Dra. Jane", "content": "Rua X, 10" },
                    { "url": "https://www.facebook.com/jane", "title": "Jane", "content": "" },
                    { "url": "https://site.com.br/cv.pdf", "title": "CV", "content": "" }
                ],
                "infoboxes": [
                    { "infobox": "Clínica Jane", "content": "Tel (11) 3333-4444", "id": "https://maps.test/x",
                      "urls": [{ "title": "site", "url": "https://clinicajane.com.br" }] }
                ]
            })))
            .mount(&server)
            .await;

        let hits = client(&server.uri()).search("Jane Doe SP", 10).await.unwrap();
        let urls: Vec<&str> = hits.iter().map(|h| h.url.as_str()).collect();
        assert_eq!(urls, vec!["https://clinicajane.com.br", "https://clinica.com.br/jane"]);
        assert_eq!(hits[0].snippet, "Tel (11) 3333-4444");
        assert_eq!(hits[1].title, "Dra. Jane");
    }

    #[tokio::test]
    async fn respects_limit() {
        let server = MockServer::start().await;
        let results: Vec<_> = (0..5)
            .map(|i| json!({ "url": format!("https://s{i}.com.br/"), "title": "", "content": "" }))
            .collect();
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": results })))
            .mount(&server)
            .await;

        let hits = client(&server.uri()).search("q", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn server_errors_and_garbage_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let c = client(&server.uri());
        assert!(c.search("down", 5).await.unwrap_err().is_source_unavailable());
        assert!(c.search("garbage", 5).await.unwrap_err().is_source_unavailable());
    }
}

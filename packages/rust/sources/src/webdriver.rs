//! Minimal W3C WebDriver client.
//!
//! Speaks the JSON wire protocol of any WebDriver server (chromedriver,
//! geckodriver, selenium) over `reqwest`. Only the commands the browser
//! session needs are implemented.

use std::time::Duration;

use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use recordfill_shared::{RecordfillError, Result};

use crate::transport_error;

const SOURCE: &str = "webdriver";

/// Key under which WebDriver returns element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Capabilities for a new headless session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub user_agent: Option<String>,
    pub page_load_timeout: Duration,
}

/// Body of every WebDriver response.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    value: Value,
}

/// Handle to one live browser session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

/// Reference to an element inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementId(pub String);

/// WebDriver protocol client bound to one server URL.
#[derive(Debug, Clone)]
pub struct WebDriverClient {
    client: Client,
    base_url: String,
}

impl WebDriverClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecordfillError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Start a headless session with images disabled.
    pub async fn new_session(&self, spec: &SessionSpec) -> Result<SessionId> {
        let mut args = vec![
            "--headless=new".to_string(),
            "--no-sandbox".to_string(),
            "--disable-gpu".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--blink-settings=imagesEnabled=false".to_string(),
        ];
        if let Some(agent) = &spec.user_agent {
            args.push(format!("--user-agent={agent}"));
        }
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "pageLoadStrategy": "normal",
                    "timeouts": { "pageLoad": spec.page_load_timeout.as_millis() as u64 },
                    "goog:chromeOptions": {
                        "args": args,
                        "prefs": { "profile.default_content_setting_values.images": 2 }
                    }
                }
            }
        });

        let value = self.command(Method::POST, "/session", Some(body)).await?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| RecordfillError::parse("new session response has no sessionId"))?;
        debug!(session = id, "browser session started");
        Ok(SessionId(id.to_string()))
    }

    pub async fn delete_session(&self, session: &SessionId) -> Result<()> {
        self.command(Method::DELETE, &format!("/session/{}", session.0), None)
            .await
            .map(|_| ())
    }

    pub async fn navigate(&self, session: &SessionId, url: &str) -> Result<()> {
        self.command(
            Method::POST,
            &format!("/session/{}/url", session.0),
            Some(json!({ "url": url })),
        )
        .await
        .map(|_| ())
    }

    /// Current page's serialized DOM.
    pub async fn page_source(&self, session: &SessionId) -> Result<String> {
        let value = self
            .command(Method::GET, &format!("/session/{}/source", session.0), None)
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RecordfillError::parse("page source is not a string"))
    }

    /// First element matching a CSS selector.
    pub async fn find_element(&self, session: &SessionId, css: &str) -> Result<ElementId> {
        let value = self
            .command(
                Method::POST,
                &format!("/session/{}/element", session.0),
                Some(json!({ "using": "css selector", "value": css })),
            )
            .await?;
        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(|id| ElementId(id.to_string()))
            .ok_or_else(|| RecordfillError::parse(format!("no element reference for {css}")))
    }

    pub async fn clear(&self, session: &SessionId, element: &ElementId) -> Result<()> {
        self.command(
            Method::POST,
            &format!("/session/{}/element/{}/clear", session.0, element.0),
            Some(json!({})),
        )
        .await
        .map(|_| ())
    }

    pub async fn send_keys(&self, session: &SessionId, element: &ElementId, text: &str) -> Result<()> {
        self.command(
            Method::POST,
            &format!("/session/{}/element/{}/value", session.0, element.0),
            Some(json!({ "text": text })),
        )
        .await
        .map(|_| ())
    }

    pub async fn click(&self, session: &SessionId, element: &ElementId) -> Result<()> {
        self.command(
            Method::POST,
            &format!("/session/{}/element/{}/click", session.0, element.0),
            Some(json!({})),
        )
        .await
        .map(|_| ())
    }

    /// Send one command and unwrap the `value` envelope.
    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(SOURCE, &url, e))?;

        let status = response.status();
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| RecordfillError::source(SOURCE, format!("{url}: bad response: {e}")))?;

        if !status.is_success() {
            let error = envelope
                .value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            let message = envelope
                .value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Err(RecordfillError::source(
                SOURCE,
                format!("{url}: HTTP {status}: {error}: {message}"),
            ));
        }
        Ok(envelope.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn session_lifecycle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .and(body_partial_json(json!({
                "capabilities": { "alwaysMatch": { "goog:chromeOptions": {
                    "prefs": { "profile.default_content_setting_values.images": 2 }
                }}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "sessionId": "abc", "capabilities": {} }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/abc/url"))
            .and(body_partial_json(json!({ "url": "https://site.test/" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/abc/source"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "value": "<html>ok</html>" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/session/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;

        let client = WebDriverClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let spec = SessionSpec {
            user_agent: Some("agent".into()),
            page_load_timeout: Duration::from_secs(10),
        };
        let session = client.new_session(&spec).await.unwrap();
        assert_eq!(session, SessionId("abc".into()));
        client.navigate(&session, "https://site.test/").await.unwrap();
        assert_eq!(client.page_source(&session).await.unwrap(), "<html>ok</html>");
        client.delete_session(&session).await.unwrap();
    }

    #[tokio::test]
    async fn protocol_errors_are_source_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/abc/element"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "value": { "error": "no such element", "message": "#missing" }
            })))
            .mount(&server)
            .await;

        let client = WebDriverClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let err = client
            .find_element(&SessionId("abc".into()), "#missing")
            .await
            .unwrap_err();
        assert!(err.is_source_unavailable());
        assert!(err.to_string().contains("no such element"));
    }
}

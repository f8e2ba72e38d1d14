//! Structured postal directory client (ViaCEP).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use recordfill_shared::text::{digits, strip_accents};
use recordfill_shared::{PostalPayload, RecordfillError, Result};

use crate::{PostalApi, transport_error};

const SOURCE: &str = "viacep";

/// The directory refuses street queries shorter than this.
const MIN_STREET_CHARS: usize = 3;

/// Address and code lookups against a ViaCEP-compatible API.
#[derive(Debug, Clone)]
pub struct ViaCepClient {
    client: Client,
    base_url: Url,
}

impl ViaCepClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RecordfillError::config(format!("invalid postal API URL {base_url}: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecordfillError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }

    /// `{base}/ws/<segments...>/json/`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| RecordfillError::config("postal API URL cannot be a base"))?;
            path.pop_if_empty().push("ws");
            path.extend(segments);
            path.push("json").push("");
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let shown = url.to_string();
        debug!(url = %shown, "postal API request");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(SOURCE, &shown, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecordfillError::source(SOURCE, format!("{shown}: HTTP {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| RecordfillError::source(SOURCE, format!("{shown}: bad JSON: {e}")))
    }
}

#[async_trait]
impl PostalApi for ViaCepClient {
    async fn lookup(&self, street: &str, city: &str, region: &str) -> Result<Vec<PostalPayload>> {
        let street = strip_accents(street.trim());
        let city = strip_accents(city.trim());
        let region = region.trim().to_uppercase();
        if street.chars().count() < MIN_STREET_CHARS || city.is_empty() || region.len() != 2 {
            return Ok(Vec::new());
        }

        let url = self.endpoint(&[&region, &city, &street])?;
        let entries: Vec<PostalPayload> = self.get_json(url).await?;
        Ok(entries
            .into_iter()
            .filter(|e| !e.postal_code.is_empty())
            .collect())
    }

    async fn lookup_code(&self, code: &str) -> Result<Option<PostalPayload>> {
        let code = digits(code);
        if code.len() != 8 {
            return Ok(None);
        }

        let url = self.endpoint(&[&code])?;
        let body: Value = self.get_json(url).await?;
        // Unknown codes come back as 200 {"erro": true}.
        if body.get("erro").is_some() {
            return Ok(None);
        }
        let payload: PostalPayload = serde_json::from_value(body)
            .map_err(|e| RecordfillError::source(SOURCE, format!("unexpected payload: {e}")))?;
        Ok(Some(payload).filter(|p| !p.postal_code.is_empty()))
    }
}

//! Google Cloud Translation (v2 REST).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use digitizer_core::{Error, Result, Translation, Translator};

use crate::config::GoogleConfig;
use crate::http;

const SERVICE: &str = "Google Translate";

/// Translator backed by the v2 `translate` endpoint.
pub struct GoogleTranslator {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl GoogleTranslator {
    pub fn new(config: &GoogleConfig) -> Result<Self> {
        Ok(Self {
            client: http::client(config.translation_timeout)?,
            url: config.translate_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    target: &'a str,
    format: &'static str,
}

#[derive(Deserialize)]
struct TranslateResponse {
    data: TranslateData,
}

#[derive(Deserialize)]
struct TranslateData {
    #[serde(default)]
    translations: Vec<TranslationItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslationItem {
    #[serde(default)]
    translated_text: String,
    detected_source_language: Option<String>,
}

#[async_trait]
impl Translator for GoogleTranslator {
    async fn translate(&self, text: &str, target_language: &str) -> Result<Translation> {
        let request = TranslateRequest {
            q: text,
            target: target_language,
            format: "text",
        };

        let response = self
            .client
            .post(&self.url)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| http::request_error(SERVICE, e))?;

        let response = http::check_status(SERVICE, response).await?;
        let body: TranslateResponse = response
            .json()
            .await
            .map_err(|e| Error::external(SERVICE, format!("malformed response: {}", e)))?;

        let item = body
            .data
            .translations
            .into_iter()
            .next()
            .filter(|t| !t.translated_text.trim().is_empty())
            .ok_or_else(|| Error::external(SERVICE, "Received an empty translation result"))?;

        debug!(
            subsystem = "providers",
            component = "translate",
            op = "translate",
            target_language,
            detected = item.detected_source_language.as_deref().unwrap_or("-"),
            "Text translated"
        );

        Ok(Translation {
            translated_text: item.translated_text,
            detected_language_code: item.detected_source_language,
        })
    }
}

//! Google Cloud Vision text recognition.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use digitizer_core::{Error, Result, TextRecognizer};

use crate::config::GoogleConfig;
use crate::http;

const SERVICE: &str = "Google Vision";

/// Recognizer calling `images:annotate` with `DOCUMENT_TEXT_DETECTION`.
pub struct GoogleVisionRecognizer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    default_hints: Vec<String>,
}

impl GoogleVisionRecognizer {
    pub fn new(config: &GoogleConfig) -> Result<Self> {
        Ok(Self {
            client: http::client(config.recognition_timeout)?,
            base_url: config.vision_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            default_hints: config.language_hints.clone(),
        })
    }

    fn build_request<'a>(image_uri: &'a str, hints: &'a [String]) -> AnnotateRequest<'a> {
        AnnotateRequest {
            requests: vec![AnnotateImageRequest {
                image: Image {
                    source: ImageSource { image_uri },
                },
                features: vec![Feature {
                    kind: "DOCUMENT_TEXT_DETECTION",
                }],
                image_context: ImageContext {
                    language_hints: hints,
                },
            }],
        }
    }
}

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    requests: Vec<AnnotateImageRequest<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageRequest<'a> {
    image: Image<'a>,
    features: Vec<Feature>,
    image_context: ImageContext<'a>,
}

#[derive(Serialize)]
struct Image<'a> {
    source: ImageSource<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageSource<'a> {
    image_uri: &'a str,
}

#[derive(Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext<'a> {
    language_hints: &'a [String],
}

#[derive(Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<Status>,
}

#[derive(Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

#[async_trait]
impl TextRecognizer for GoogleVisionRecognizer {
    async fn recognize(&self, image_uri: &str, language_hints: &[String]) -> Result<String> {
        let start = Instant::now();
        let hints = if language_hints.is_empty() {
            &self.default_hints[..]
        } else {
            language_hints
        };

        let url = format!("{}/images:annotate", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&Self::build_request(image_uri, hints))
            .send()
            .await
            .map_err(|e| http::request_error(SERVICE, e))?;

        let response = http::check_status(SERVICE, response).await?;
        let body: AnnotateResponse = response
            .json()
            .await
            .map_err(|e| Error::external(SERVICE, format!("malformed response: {}", e)))?;

        let first = body
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| Error::external(SERVICE, "empty response"))?;

        if let Some(status) = first.error {
            return Err(Error::external(SERVICE, status.message));
        }

        let text = first
            .full_text_annotation
            .map(|a| a.text.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            warn!(
                subsystem = "providers",
                component = "vision",
                image_uri,
                "No text found in image"
            );
            return Err(Error::external(SERVICE, "No text found in image"));
        }

        debug!(
            subsystem = "providers",
            component = "vision",
            op = "recognize",
            chars = text.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Text recognized"
        );
        Ok(text)
    }
}

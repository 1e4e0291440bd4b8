//! Scriptable mock providers for deterministic testing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use digitizer_providers::mock::{MockRecognizer, MockTranslator};
//!
//! let recognizer = MockRecognizer::new("Hello").failing_first(2);
//! let translator = MockTranslator::new("Bonjour").with_detected_language("en");
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use digitizer_core::{
    BlobUploader, Error, ImageDownloader, Result, TextRecognizer, Translation, Translator,
};

use crate::storage::compute_public_id;

/// Failure script shared by the mocks.
#[derive(Debug, Clone, Default)]
struct Script {
    /// Calls numbered below this fail.
    fail_first: usize,
    always_fail: bool,
    latency: Duration,
    calls: Arc<AtomicUsize>,
}

impl Script {
    /// Register a call and return whether it should fail.
    async fn call(&self) -> bool {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.always_fail || n < self.fail_first
    }

    fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Mock text recognizer returning fixed text.
#[derive(Debug, Clone)]
pub struct MockRecognizer {
    text: String,
    script: Script,
}

impl MockRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            script: Script::default(),
        }
    }

    /// Fail the first `n` calls, then succeed.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.script.fail_first = n;
        self
    }

    /// Fail every call.
    pub fn always_failing(mut self) -> Self {
        self.script.always_fail = true;
        self
    }

    /// Sleep before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.script.latency = latency;
        self
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.script.count()
    }
}

#[async_trait]
impl TextRecognizer for MockRecognizer {
    async fn recognize(&self, _image_uri: &str, _language_hints: &[String]) -> Result<String> {
        if self.script.call().await {
            return Err(Error::external("Google Vision", "mock recognition failure"));
        }
        if self.text.is_empty() {
            return Err(Error::external("Google Vision", "No text found in image"));
        }
        Ok(self.text.clone())
    }
}

/// Mock translator returning fixed text.
#[derive(Debug, Clone)]
pub struct MockTranslator {
    text: String,
    detected_language: Option<String>,
    script: Script,
}

impl MockTranslator {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            detected_language: None,
            script: Script::default(),
        }
    }

    pub fn with_detected_language(mut self, code: impl Into<String>) -> Self {
        self.detected_language = Some(code.into());
        self
    }

    pub fn failing_first(mut self, n: usize) -> Self {
        self.script.fail_first = n;
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.script.always_fail = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.script.count()
    }
}

#[async_trait]
impl Translator for MockTranslator {
    async fn translate(&self, _text: &str, _target_language: &str) -> Result<Translation> {
        if self.script.call().await {
            return Err(Error::external("Google Translate", "mock translation failure"));
        }
        if self.text.is_empty() {
            return Err(Error::external(
                "Google Translate",
                "Received an empty translation result",
            ));
        }
        Ok(Translation {
            translated_text: self.text.clone(),
            detected_language_code: self.detected_language.clone(),
        })
    }
}

/// Mock uploader returning a content-addressed fake URL.
#[derive(Debug, Clone, Default)]
pub struct MockUploader {
    script: Script,
}

impl MockUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_failing(mut self) -> Self {
        self.script.always_fail = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.script.count()
    }
}

#[async_trait]
impl BlobUploader for MockUploader {
    async fn upload(&self, image: &[u8], folder: &str) -> Result<String> {
        if self.script.call().await {
            return Err(Error::external("Cloudinary", "mock upload failure"));
        }
        Ok(format!(
            "https://cdn.mock/digitizer-app/{}/{}",
            folder,
            compute_public_id(image)
        ))
    }
}

/// Mock downloader returning fixed bytes.
#[derive(Debug, Clone)]
pub struct MockDownloader {
    body: Vec<u8>,
    script: Script,
}

impl MockDownloader {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            script: Script::default(),
        }
    }

    pub fn always_failing(mut self) -> Self {
        self.script.always_fail = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.script.count()
    }
}

#[async_trait]
impl ImageDownloader for MockDownloader {
    async fn download(&self, _url: &str) -> Result<Vec<u8>> {
        if self.script.call().await {
            return Err(Error::external("Download", "mock download failure"));
        }
        Ok(self.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recognizer_fails_first_then_succeeds() {
        let recognizer = MockRecognizer::new("text").failing_first(2);
        assert!(recognizer.recognize("u", &[]).await.is_err());
        assert!(recognizer.recognize("u", &[]).await.is_err());
        assert_eq!(recognizer.recognize("u", &[]).await.unwrap(), "text");
        assert_eq!(recognizer.call_count(), 3);
    }

    #[tokio::test]
    async fn test_clones_share_call_count() {
        let translator = MockTranslator::new("hola").with_detected_language("en");
        let clone = translator.clone();
        let t = clone.translate("hello", "es").await.unwrap();
        assert_eq!(t.detected_language_code.as_deref(), Some("en"));
        assert_eq!(translator.call_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_text_is_external_failure() {
        let err = MockRecognizer::new("").recognize("u", &[]).await.unwrap_err();
        assert_eq!(err.to_string(), "[Google Vision]: No text found in image");
    }
}

//! Remote image download and image sniffing.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use digitizer_core::{defaults, Error, ImageDownloader, Result};

use crate::http;

const SERVICE: &str = "Download";

/// Detect the image type from magic bytes.
///
/// Fails with `Validation` when the bytes are not a recognizable image.
pub fn detect_image_type(data: &[u8]) -> Result<infer::Type> {
    match infer::get(data) {
        Some(kind) if kind.matcher_type() == infer::MatcherType::Image => Ok(kind),
        Some(kind) => Err(Error::Validation(format!(
            "Expected an image, got {}",
            kind.mime_type()
        ))),
        None => Err(Error::Validation(
            "Content is not a recognizable image".to_string(),
        )),
    }
}

/// Downloads images over HTTP with a size cap.
pub struct HttpImageDownloader {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpImageDownloader {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self> {
        Ok(Self {
            client: http::client(timeout)?,
            max_bytes,
        })
    }

    /// Downloader with default timeout and size cap.
    pub fn with_defaults() -> Result<Self> {
        Self::new(
            Duration::from_secs(defaults::DOWNLOAD_TIMEOUT_SECS),
            defaults::MAX_IMAGE_BYTES,
        )
    }

    fn too_large(&self) -> Error {
        Error::Validation(format!("Image exceeds {} bytes", self.max_bytes))
    }
}

#[async_trait]
impl ImageDownloader for HttpImageDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| http::request_error(SERVICE, e))?;
        response = http::check_status(SERVICE, response).await?;

        if response
            .content_length()
            .is_some_and(|len| len > self.max_bytes as u64)
        {
            return Err(self.too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| http::request_error(SERVICE, e))?
        {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(self.too_large());
            }
            body.extend_from_slice(&chunk);
        }

        debug!(
            subsystem = "providers",
            component = "download",
            op = "download",
            bytes = body.len(),
            "Image downloaded"
        );
        Ok(body)
    }
}

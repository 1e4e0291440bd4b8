//! # digitizer-providers
//!
//! HTTP adapters for the external services the digitizer depends on.
//!
//! This crate provides:
//! - Google Vision text recognition (`DOCUMENT_TEXT_DETECTION`)
//! - Google Translate v2 translation
//! - Cloudinary unsigned image uploads
//! - Size-capped image downloads and image sniffing
//!
//! # Feature Flags
//!
//! - `mock`: scriptable in-process providers for tests

pub mod config;
pub mod download;
mod http;
pub mod storage;
pub mod translate;
pub mod vision;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::sync::Arc;

use digitizer_core::{BlobUploader, ImageDownloader, Result, TextRecognizer, Translator};

pub use config::{CloudinaryConfig, GoogleConfig};
pub use download::{detect_image_type, HttpImageDownloader};
pub use storage::{compute_public_id, CloudinaryUploader};
pub use translate::GoogleTranslator;
pub use vision::GoogleVisionRecognizer;

/// The set of providers the pipeline is wired with.
#[derive(Clone)]
pub struct Providers {
    pub recognizer: Arc<dyn TextRecognizer>,
    pub translator: Arc<dyn Translator>,
    pub uploader: Arc<dyn BlobUploader>,
    pub downloader: Arc<dyn ImageDownloader>,
}

impl Providers {
    /// Build the HTTP providers from environment configuration.
    ///
    /// Fails with `Config` when a required variable is missing.
    pub fn from_env() -> Result<Self> {
        let google = GoogleConfig::from_env()?;
        let cloudinary = CloudinaryConfig::from_env()?;
        Ok(Self {
            recognizer: Arc::new(GoogleVisionRecognizer::new(&google)?),
            translator: Arc::new(GoogleTranslator::new(&google)?),
            uploader: Arc::new(CloudinaryUploader::new(&cloudinary)?),
            downloader: Arc::new(HttpImageDownloader::with_defaults()?),
        })
    }
}

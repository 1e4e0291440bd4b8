//! Provider configuration loaded from the environment.

use std::time::Duration;

use digitizer_core::{defaults, Error, Result};

/// Settings for the Google Vision and Translate clients.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub api_key: String,
    pub vision_url: String,
    pub translate_url: String,
    pub recognition_timeout: Duration,
    pub translation_timeout: Duration,
    pub language_hints: Vec<String>,
}

impl GoogleConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            vision_url: defaults::GOOGLE_VISION_URL.to_string(),
            translate_url: defaults::GOOGLE_TRANSLATE_URL.to_string(),
            recognition_timeout: Duration::from_secs(defaults::RECOGNITION_TIMEOUT_SECS),
            translation_timeout: Duration::from_secs(defaults::TRANSLATION_TIMEOUT_SECS),
            language_hints: defaults::DEFAULT_LANGUAGE_HINTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Load from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `GOOGLE_API_KEY` | required |
    /// | `GOOGLE_VISION_URL` | `https://vision.googleapis.com/v1` |
    /// | `GOOGLE_TRANSLATE_URL` | `https://translation.googleapis.com/language/translate/v2` |
    /// | `OCR_LANGUAGE_HINTS` | `en,hi,kn` |
    pub fn from_env() -> Result<Self> {
        let api_key = required_env("GOOGLE_API_KEY")?;
        let mut config = Self::new(api_key);
        if let Ok(url) = std::env::var("GOOGLE_VISION_URL") {
            config.vision_url = url;
        }
        if let Ok(url) = std::env::var("GOOGLE_TRANSLATE_URL") {
            config.translate_url = url;
        }
        if let Ok(hints) = std::env::var("OCR_LANGUAGE_HINTS") {
            config.language_hints = parse_list(&hints);
        }
        Ok(config)
    }

    pub fn with_vision_url(mut self, url: impl Into<String>) -> Self {
        self.vision_url = url.into();
        self
    }

    pub fn with_translate_url(mut self, url: impl Into<String>) -> Self {
        self.translate_url = url.into();
        self
    }
}

/// Settings for Cloudinary unsigned uploads.
#[derive(Debug, Clone)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub upload_preset: String,
    pub base_url: String,
    pub root_folder: String,
    pub timeout: Duration,
}

impl CloudinaryConfig {
    pub fn new(cloud_name: impl Into<String>, upload_preset: impl Into<String>) -> Self {
        Self {
            cloud_name: cloud_name.into(),
            upload_preset: upload_preset.into(),
            base_url: defaults::CLOUDINARY_URL.to_string(),
            root_folder: defaults::UPLOAD_ROOT_FOLDER.to_string(),
            timeout: Duration::from_secs(defaults::UPLOAD_TIMEOUT_SECS),
        }
    }

    /// Load from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CLOUDINARY_CLOUD_NAME` | required |
    /// | `CLOUDINARY_UPLOAD_PRESET` | required |
    /// | `CLOUDINARY_BASE_URL` | `https://api.cloudinary.com/v1_1` |
    /// | `UPLOAD_TIMEOUT_SECS` | `60` |
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(
            required_env("CLOUDINARY_CLOUD_NAME")?,
            required_env("CLOUDINARY_UPLOAD_PRESET")?,
        );
        if let Ok(url) = std::env::var("CLOUDINARY_BASE_URL") {
            config.base_url = url;
        }
        if let Some(secs) = std::env::var("UPLOAD_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.timeout = Duration::from_secs(secs.max(1));
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn required_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::Config(format!("{} must be set", name))),
    }
}

fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

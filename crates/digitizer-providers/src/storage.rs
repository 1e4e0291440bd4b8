//! Cloudinary blob storage.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::info;

use digitizer_core::{BlobUploader, Error, Result};

use crate::config::CloudinaryConfig;
use crate::download::detect_image_type;
use crate::http;

const SERVICE: &str = "Cloudinary";

/// Public id derived from the first 32 hex chars of the SHA-256 of the bytes.
///
/// Uploading the same image twice yields the same public id.
pub fn compute_public_id(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(digest)[..32].to_string()
}

/// Uploader using Cloudinary's unsigned upload endpoint.
///
/// The whole upload is bounded by the client timeout; exceeding it is an
/// external-service failure.
pub struct CloudinaryUploader {
    client: reqwest::Client,
    endpoint: String,
    upload_preset: String,
    root_folder: String,
}

impl CloudinaryUploader {
    pub fn new(config: &CloudinaryConfig) -> Result<Self> {
        Ok(Self {
            client: http::client(config.timeout)?,
            endpoint: format!(
                "{}/{}/image/upload",
                config.base_url.trim_end_matches('/'),
                config.cloud_name
            ),
            upload_preset: config.upload_preset.clone(),
            root_folder: config.root_folder.clone(),
        })
    }

    fn folder_path(&self, folder: &str) -> String {
        let folder = folder.trim_matches('/');
        if folder.is_empty() {
            self.root_folder.clone()
        } else {
            format!("{}/{}", self.root_folder, folder)
        }
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
    url: Option<String>,
}

#[async_trait]
impl BlobUploader for CloudinaryUploader {
    async fn upload(&self, image: &[u8], folder: &str) -> Result<String> {
        let kind = detect_image_type(image)?;
        let public_id = compute_public_id(image);
        let folder = self.folder_path(folder);

        let part = reqwest::multipart::Part::bytes(image.to_vec())
            .file_name(format!("{}.{}", public_id, kind.extension()))
            .mime_str(kind.mime_type())
            .map_err(|e| Error::Internal(format!("Invalid MIME type: {}", e)))?;

        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("upload_preset", self.upload_preset.clone())
            .text("folder", folder.clone())
            .text("public_id", public_id.clone());

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| http::request_error(SERVICE, e))?;

        let response = http::check_status(SERVICE, response).await?;
        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| Error::external(SERVICE, format!("malformed response: {}", e)))?;

        let url = body
            .secure_url
            .or(body.url)
            .ok_or_else(|| Error::external(SERVICE, "response carried no URL"))?;

        info!(
            subsystem = "providers",
            component = "storage",
            op = "upload",
            folder = %folder,
            bytes = image.len(),
            "Image uploaded"
        );
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_id_is_stable() {
        let a = compute_public_id(b"same bytes");
        assert_eq!(a, compute_public_id(b"same bytes"));
        assert_ne!(a, compute_public_id(b"other bytes"));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_folder_path() {
        let uploader = CloudinaryUploader::new(&CloudinaryConfig::new("demo", "p")).unwrap();
        assert_eq!(uploader.folder_path("url-uploads"), "digitizer-app/url-uploads");
        assert_eq!(uploader.folder_path(""), "digitizer-app");
        assert_eq!(
            uploader.endpoint,
            "https://api.cloudinary.com/v1_1/demo/image/upload"
        );
    }
}

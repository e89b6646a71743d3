//! Generic REST media platform.
//!
//! Endpoints, relative to the configured base URL:
//! - `POST /medias` (multipart `file`) -> `{"id": "..."}`
//! - `GET /medias/{id}?quality=...` -> `{"id", "available", "sources": [{"quality", "url"}]}`
//! - `DELETE /medias/{id}`
//! - `PATCH /medias/{id}` with a JSON body of [`MediaFields`]

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{multipart, Body, Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::PlatformConfig;
use crate::metrics;

use super::{MediaFields, MediaSource, MediaStatus, Platform, PlatformError};

/// HTTP media platform client.
pub struct HttpPlatform {
    client: Client,
    config: PlatformConfig,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MediaResponse {
    #[serde(default)]
    available: bool,
    #[serde(default)]
    sources: Vec<SourceResponse>,
}

#[derive(Debug, Deserialize)]
struct SourceResponse {
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl HttpPlatform {
    /// Create a new client for the configured platform.
    pub fn new(config: PlatformConfig) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()
            .map_err(|e| PlatformError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Get the base URL without trailing slash.
    fn base_url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    fn media_url(&self, media_id: &str) -> String {
        format!(
            "{}/medias/{}",
            self.base_url(),
            urlencoding::encode(media_id)
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request, timing it and mapping transport and HTTP errors.
    async fn send(
        &self,
        operation: &str,
        media_id: Option<&str>,
        builder: RequestBuilder,
    ) -> Result<Response, PlatformError> {
        let started = Instant::now();
        let result = builder.send().await;

        let outcome = match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Ok(response)
                } else if let (StatusCode::NOT_FOUND, Some(id)) = (status, media_id) {
                    Err(PlatformError::MediaNotFound(id.to_string()))
                } else {
                    let body = response.text().await.unwrap_or_default();
                    Err(PlatformError::ApiError(format!("HTTP {}: {}", status, body)))
                }
            }
            Err(e) if e.is_timeout() => Err(PlatformError::Timeout),
            Err(e) if e.is_connect() => Err(PlatformError::ConnectionFailed(e.to_string())),
            Err(e) => Err(PlatformError::ApiError(e.to_string())),
        };

        let status = if outcome.is_ok() { "success" } else { "error" };
        metrics::PLATFORM_REQUEST_DURATION
            .with_label_values(&[self.config.name.as_str(), operation, status])
            .observe(started.elapsed().as_secs_f64());

        outcome
    }
}

#[async_trait]
impl Platform for HttpPlatform {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn upload(&self, file: &Path) -> Result<String, PlatformError> {
        let handle = tokio::fs::File::open(file).await?;
        let length = handle.metadata().await?.len();
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".to_string());

        debug!(
            platform = %self.config.name,
            file = %file.display(),
            bytes = length,
            "Uploading media"
        );

        let body = Body::wrap_stream(ReaderStream::new(handle));
        let part = multipart::Part::stream_with_length(body, length).file_name(file_name);
        let form = multipart::Form::new().part("file", part);

        let url = format!("{}/medias", self.base_url());
        let response = self
            .send("upload", None, self.request(Method::POST, &url).multipart(form))
            .await?;

        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::ApiError(format!("Failed to parse response: {}", e)))?;

        Ok(uploaded.id)
    }

    async fn status(
        &self,
        media_ids: &[String],
        expected_quality: Option<&str>,
    ) -> Result<MediaStatus, PlatformError> {
        let mut status = MediaStatus {
            available: true,
            sources: Vec::new(),
        };

        for media_id in media_ids {
            let mut url = self.media_url(media_id);
            if let Some(quality) = expected_quality {
                url.push_str("?quality=");
                url.push_str(&urlencoding::encode(quality));
            }

            let response = self
                .send("status", Some(media_id), self.request(Method::GET, &url))
                .await?;
            let media: MediaResponse = response.json().await.map_err(|e| {
                PlatformError::ApiError(format!("Failed to parse response: {}", e))
            })?;

            status.available &= media.available;
            status
                .sources
                .extend(media.sources.into_iter().map(|s| MediaSource {
                    media_id: media_id.clone(),
                    quality: s.quality,
                    url: s.url,
                }));
        }

        Ok(status)
    }

    async fn remove(&self, media_ids: &[String]) -> Result<(), PlatformError> {
        for media_id in media_ids {
            let url = self.media_url(media_id);
            match self
                .send("remove", Some(media_id), self.request(Method::DELETE, &url))
                .await
            {
                Ok(_) | Err(PlatformError::MediaNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn update(&self, media_id: &str, fields: &MediaFields) -> Result<(), PlatformError> {
        let url = self.media_url(media_id);
        self.send(
            "update",
            Some(media_id),
            self.request(Method::PATCH, &url).json(fields),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> PlatformConfig {
        PlatformConfig {
            name: "main".to_string(),
            url: url.to_string(),
            token: None,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_media_url_trims_and_encodes() {
        let platform = HttpPlatform::new(config("http://media.local/api/")).unwrap();
        assert_eq!(platform.name(), "main");
        assert_eq!(
            platform.media_url("a b/c"),
            "http://media.local/api/medias/a%20b%2Fc"
        );
    }

    #[tokio::test]
    async fn test_upload_missing_file_is_io_error() {
        let platform = HttpPlatform::new(config("http://127.0.0.1:1")).unwrap();
        let err = platform
            .upload(Path::new("/nonexistent/clip.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Io(_)));
    }

    #[tokio::test]
    async fn test_status_of_nothing_is_available() {
        let platform = HttpPlatform::new(config("http://127.0.0.1:1")).unwrap();
        let status = platform.status(&[], None).await.unwrap();
        assert!(status.available);
        assert!(status.sources.is_empty());
    }
}

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{EngineDescriptor, EngineRequest, EngineResponse, Feature, ScrapeEngine};
use crate::error::ScrapeError;

const ENGINE_NAME: &str = "document";

#[derive(Debug, Deserialize)]
struct ConverterOutput {
    html: String,
    #[serde(default)]
    error: Option<String>,
}

/// PDF/DOCX engine.
///
/// Downloads the target into a temp file (or reuses the prefetch artifact
/// another engine already spilled) and posts it to the converter service,
/// which returns HTML for the normal transform path. Temp files are deleted
/// on every exit path.
pub struct DocumentEngine {
    client: reqwest::Client,
    converter_url: String,
}

impl DocumentEngine {
    pub fn new(converter_url: String, user_agent: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .expect("Failed to build HTTP client");
        DocumentEngine {
            client,
            converter_url,
        }
    }

    async fn download(
        &self,
        request: &EngineRequest,
    ) -> Result<(tempfile::TempPath, u16, String), ScrapeError> {
        let response = self
            .client
            .get(&request.url)
            .timeout(request.time_budget.max(Duration::from_millis(1)))
            .send()
            .await
            .map_err(|e| ScrapeError::Engine {
                engine: ENGINE_NAME.to_string(),
                message: e.to_string(),
            })?;

        let status_code = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let body = response.bytes().await.map_err(|e| ScrapeError::Engine {
            engine: ENGINE_NAME.to_string(),
            message: e.to_string(),
        })?;

        let mut file = tempfile::NamedTempFile::new().map_err(|e| ScrapeError::Engine {
            engine: ENGINE_NAME.to_string(),
            message: format!("temp file: {e}"),
        })?;
        file.write_all(&body).map_err(|e| ScrapeError::Engine {
            engine: ENGINE_NAME.to_string(),
            message: format!("temp file: {e}"),
        })?;

        Ok((file.into_temp_path(), status_code, content_type))
    }
}

#[async_trait]
impl ScrapeEngine for DocumentEngine {
    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            name: ENGINE_NAME,
            capabilities: Feature::PDF | Feature::DOCX,
            quality: 5,
        }
    }

    async fn scrape(&self, request: &EngineRequest) -> Result<EngineResponse, ScrapeError> {
        // The converter service keeps uploads around for its own cache, which
        // zero-data-retention forbids.
        if request.zero_data_retention {
            return Err(ScrapeError::ZeroDataRetention {
                engine: ENGINE_NAME.to_string(),
            });
        }

        let (path, status_code, content_type) = match &request.prefetch {
            Some(artifact) => {
                // Reuse the body the sniffing engine already downloaded.
                let bytes =
                    tokio::fs::read(&artifact.path)
                        .await
                        .map_err(|e| ScrapeError::Engine {
                            engine: ENGINE_NAME.to_string(),
                            message: format!("prefetch read: {e}"),
                        })?;
                let mut file = tempfile::NamedTempFile::new().map_err(|e| ScrapeError::Engine {
                    engine: ENGINE_NAME.to_string(),
                    message: format!("temp file: {e}"),
                })?;
                file.write_all(&bytes).map_err(|e| ScrapeError::Engine {
                    engine: ENGINE_NAME.to_string(),
                    message: format!("temp file: {e}"),
                })?;
                (
                    file.into_temp_path(),
                    artifact.status_code,
                    artifact.content_type.clone(),
                )
            }
            None => self.download(request).await?,
        };

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ScrapeError::Engine {
                engine: ENGINE_NAME.to_string(),
                message: format!("temp file read: {e}"),
            })?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name("document")
            .mime_str(&content_type)
            .map_err(|e| ScrapeError::Engine {
                engine: ENGINE_NAME.to_string(),
                message: e.to_string(),
            })?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let converted = self
            .client
            .post(&self.converter_url)
            .multipart(form)
            .timeout(request.time_budget.max(Duration::from_millis(1)))
            .send()
            .await
            .map_err(|e| ScrapeError::Engine {
                engine: ENGINE_NAME.to_string(),
                message: format!("converter: {e}"),
            })?;

        // `path` has served its purpose; drop it explicitly before parsing so
        // the file is gone even if decoding fails below.
        drop(path);

        let output: ConverterOutput =
            converted.json().await.map_err(|e| ScrapeError::Engine {
                engine: ENGINE_NAME.to_string(),
                message: format!("converter response: {e}"),
            })?;

        if let Some(error) = output.error {
            return Err(ScrapeError::UnsupportedFile { reason: error });
        }

        Ok(EngineResponse {
            url: request.url.clone(),
            status_code,
            html: Some(output.html),
            content_type: Some(content_type),
            screenshot: None,
            error: None,
        })
    }
}

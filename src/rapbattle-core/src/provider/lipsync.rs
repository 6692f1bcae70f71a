//! Hosted lip-sync provider (sync.so-compatible job API).
//!
//! A job is created with a face video and an audio URL, then polled until it
//! reaches a terminal status. The caller bounds total wait with a timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::LipSyncProvider;
use crate::config::VideoConfig;
use crate::error::ProviderError;

const PROVIDER_NAME: &str = "lipsync";

#[derive(Debug, Deserialize)]
struct CreatedJob {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    status: String,
    output_url: Option<String>,
    error: Option<String>,
}

/// Talking-head renderer backed by a hosted lip-sync service.
pub struct HostedLipSync {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    poll_interval: Duration,
}

impl HostedLipSync {
    pub fn new(config: &VideoConfig, api_key: Option<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        }
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Unavailable {
                provider: PROVIDER_NAME.to_string(),
                reason: "LIPSYNC_API_KEY is not set".to_string(),
            })
    }

    fn failed(detail: impl Into<String>) -> ProviderError {
        ProviderError::GenerationFailed {
            provider: PROVIDER_NAME.to_string(),
            detail: detail.into(),
        }
    }

    async fn create_job(&self, face_url: &str, audio_url: &str) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "input": [
                {"type": "video", "url": face_url},
                {"type": "audio", "url": audio_url},
            ],
            "options": {"sync_mode": "loop"},
        });

        let response = self
            .client
            .post(format!("{}/generate", self.base_url))
            .header("x-api-key", self.api_key()?)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::failed(format!("HTTP {}: {}", status, text)));
        }

        let job: CreatedJob = response.json().await?;
        job.id.ok_or_else(|| Self::failed("no job id in response"))
    }

    async fn poll_job(&self, job_id: &str) -> Result<JobStatus, ProviderError> {
        let response = self
            .client
            .get(format!("{}/generate/{}", self.base_url, job_id))
            .header("x-api-key", self.api_key()?)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl LipSyncProvider for HostedLipSync {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn lipsync(&self, face_url: &str, audio_url: &str) -> Result<String, ProviderError> {
        let job_id = self.create_job(face_url, audio_url).await?;
        debug!(%job_id, "lip-sync job created");

        loop {
            let job = self.poll_job(&job_id).await?;
            match job.status.as_str() {
                "COMPLETED" => {
                    return job
                        .output_url
                        .ok_or_else(|| Self::failed("completed without an output URL"));
                }
                "FAILED" => {
                    return Err(Self::failed(
                        job.error.unwrap_or_else(|| "unknown error".to_string()),
                    ));
                }
                "REJECTED" => return Err(Self::failed("job was rejected")),
                "PENDING" | "PROCESSING" => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                other => return Err(Self::failed(format!("unknown job status '{}'", other))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;

    #[test]
    fn test_job_status_parses_camel_case() {
        let job: JobStatus = serde_json::from_str(
            r#"{"status":"COMPLETED","outputUrl":"https://cdn.example/v.mp4","id":"abc"}"#,
        )
        .unwrap();
        assert_eq!(job.status, "COMPLETED");
        assert_eq!(job.output_url.as_deref(), Some("https://cdn.example/v.mp4"));
        assert!(job.error.is_none());
    }

    #[test]
    fn test_unavailable_without_key() {
        let config = default_config();
        let provider = HostedLipSync::new(&config.video, None, reqwest::Client::new());
        assert!(!provider.is_available());
        assert!(matches!(
            provider.api_key(),
            Err(ProviderError::Unavailable { .. })
        ));
    }
}

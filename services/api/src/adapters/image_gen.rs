//! services/api/src/adapters/image_gen.rs
//!
//! This module contains the adapter for the Stable Diffusion image API.
//! It implements the `ImageGenerationService` port from the `core` crate.
//!
//! The API either answers with the finished image or queues the job and hands
//! back an id plus an estimated wait. The `status` field of every response is
//! decoded as a tag, so a body that is neither finished nor queued is an error
//! rather than something guessed from which fields happen to be present.

use async_trait::async_trait;
use goodnight_core::clock::Clock;
use goodnight_core::ports::{ImageGeneration, ImageGenerationService, PortError, PortResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

//=========================================================================================
// Wire Types
//=========================================================================================

#[derive(Serialize)]
struct GenerateRequest<'a> {
    key: &'a str,
    model_id: &'a str,
    prompt: &'a str,
    width: &'a str,
    height: &'a str,
    samples: &'a str,
    num_inference_steps: &'a str,
    safety_checker: &'a str,
    enhance_prompt: &'a str,
    seed: Option<u64>,
    guidance_scale: f32,
    webhook: Option<&'a str>,
    track_id: Option<&'a str>,
}

#[derive(Serialize)]
struct FetchRequest<'a> {
    key: &'a str,
}

/// Job ids come back as numbers from some endpoints and strings from others.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum JobId {
    Number(u64),
    Text(String),
}

impl JobId {
    fn into_string(self) -> String {
        match self {
            JobId::Number(n) => n.to_string(),
            JobId::Text(s) => s,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(tag = "status", rename_all = "lowercase")]
enum DreamboothResponse {
    Success {
        #[serde(default)]
        output: Vec<String>,
    },
    Processing {
        id: JobId,
        /// Seconds until the job should be done.
        #[serde(default)]
        eta: f64,
    },
    Error {
        #[serde(default, alias = "messege")]
        message: Option<serde_json::Value>,
    },
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `ImageGenerationService` over the Stable Diffusion HTTP API.
#[derive(Clone)]
pub struct StableDiffusionAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model_id: String,
    clock: Arc<dyn Clock>,
}

impl StableDiffusionAdapter {
    /// Creates a new `StableDiffusionAdapter` whose requests give up after `timeout`.
    pub fn new(
        base_url: String,
        api_key: String,
        model_id: String,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> PortResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model_id,
            clock,
        })
    }

    async fn post<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> PortResult<DreamboothResponse> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| PortError::Gateway(e.to_string()))?;

        // Check status before parsing
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, %body, "Image API error");
            return Err(PortError::Gateway(format!(
                "Image API request failed with status {}",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| PortError::Gateway(e.to_string()))?;
        serde_json::from_str::<DreamboothResponse>(&body)
            .map_err(|e| PortError::Gateway(format!("Unexpected image API response ({}): {}", e, body)))
    }
}

fn first_output(output: Vec<String>) -> PortResult<String> {
    output
        .into_iter()
        .next()
        .ok_or_else(|| PortError::Gateway("Image API response does not have output".to_string()))
}

/// The epoch second a queued job is due, `eta` seconds after `now`.
fn ready_at(now: i64, eta: f64) -> PortResult<i64> {
    now.checked_add(eta.max(0.0).ceil() as i64)
        .ok_or_else(|| PortError::Gateway(format!("Image API returned an unusable eta: {}", eta)))
}

fn api_error(message: Option<serde_json::Value>) -> PortError {
    let message = match message {
        Some(serde_json::Value::String(text)) => text,
        Some(other) => other.to_string(),
        None => "no message".to_string(),
    };
    PortError::Gateway(format!("Image API reported an error: {}", message))
}

//=========================================================================================
// `ImageGenerationService` Trait Implementation
//=========================================================================================

#[async_trait]
impl ImageGenerationService for StableDiffusionAdapter {
    async fn generate(&self, prompt: &str) -> PortResult<ImageGeneration> {
        let request = GenerateRequest {
            key: &self.api_key,
            model_id: &self.model_id,
            prompt,
            width: "512",
            height: "512",
            samples: "1",
            num_inference_steps: "30",
            safety_checker: "no",
            enhance_prompt: "yes",
            seed: None,
            guidance_scale: 7.5,
            webhook: None,
            track_id: None,
        };
        let url = format!("{}/api/v3/dreambooth", self.base_url);

        match self.post(&url, &request).await? {
            DreamboothResponse::Success { output } => Ok(ImageGeneration::Ready {
                url: first_output(output)?,
            }),
            DreamboothResponse::Processing { id, eta } => Ok(ImageGeneration::Queued {
                job_id: id.into_string(),
                eta: ready_at(self.clock.now(), eta)?,
            }),
            DreamboothResponse::Error { message } => Err(api_error(message)),
        }
    }

    async fn fetch(&self, job_id: &str) -> PortResult<String> {
        let url = format!("{}/api/v4/dreambooth/fetch/{}", self.base_url, job_id);
        let request = FetchRequest { key: &self.api_key };

        match self.post(&url, &request).await? {
            DreamboothResponse::Success { output } => first_output(output),
            DreamboothResponse::Processing { .. } => Err(PortError::Gateway(format!(
                "Image job {} is still processing",
                job_id
            ))),
            DreamboothResponse::Error { message } => Err(api_error(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goodnight_core::clock::ManualClock;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NOW: i64 = 1_700_000_000;

    fn adapter(server: &MockServer) -> StableDiffusionAdapter {
        StableDiffusionAdapter::new(
            server.uri(),
            "sd-key".to_string(),
            "midjourney".to_string(),
            Duration::from_secs(5),
            Arc::new(ManualClock::new(NOW)),
        )
        .unwrap()
    }

    async fn respond_to_generate(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path("/api/v3/dreambooth"))
            .and(body_partial_json(json!({"key": "sd-key", "model_id": "midjourney"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn finished_image_is_ready() {
        let server = MockServer::start().await;
        respond_to_generate(
            &server,
            json!({"status": "success", "id": 7, "output": ["https://cdn.example/7.png"]}),
        )
        .await;

        let result = adapter(&server).generate("a dragon").await.unwrap();
        assert_eq!(
            result,
            ImageGeneration::Ready {
                url: "https://cdn.example/7.png".to_string()
            }
        );
    }

    #[tokio::test]
    async fn processing_image_is_queued_with_absolute_eta() {
        let server = MockServer::start().await;
        respond_to_generate(
            &server,
            json!({"status": "processing", "id": 4242, "eta": 119.2, "output": []}),
        )
        .await;

        let result = adapter(&server).generate("a dragon").await.unwrap();
        assert_eq!(
            result,
            ImageGeneration::Queued {
                job_id: "4242".to_string(),
                eta: NOW + 120,
            }
        );
    }

    #[tokio::test]
    async fn out_of_range_eta_is_an_error() {
        let server = MockServer::start().await;
        respond_to_generate(&server, json!({"status": "processing", "id": 1, "eta": 1e300})).await;

        let err = adapter(&server).generate("a dragon").await.unwrap_err();
        assert!(matches!(err, PortError::Gateway(msg) if msg.contains("unusable eta")));
    }

    #[tokio::test]
    async fn success_without_output_is_an_error() {
        let server = MockServer::start().await;
        respond_to_generate(&server, json!({"status": "success", "output": []})).await;

        let err = adapter(&server).generate("a dragon").await.unwrap_err();
        assert!(matches!(err, PortError::Gateway(msg) if msg.contains("does not have output")));
    }

    #[tokio::test]
    async fn body_without_known_status_is_an_error() {
        let server = MockServer::start().await;
        respond_to_generate(&server, json!({"output": ["https://cdn.example/x.png"]})).await;

        let err = adapter(&server).generate("a dragon").await.unwrap_err();
        assert!(matches!(err, PortError::Gateway(msg) if msg.contains("Unexpected image API response")));
    }

    #[tokio::test]
    async fn api_error_status_is_reported() {
        let server = MockServer::start().await;
        respond_to_generate(&server, json!({"status": "error", "message": "Invalid key"})).await;

        let err = adapter(&server).generate("a dragon").await.unwrap_err();
        assert!(matches!(err, PortError::Gateway(msg) if msg.contains("Invalid key")));
    }

    #[tokio::test]
    async fn non_success_http_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/dreambooth"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = adapter(&server).generate("a dragon").await.unwrap_err();
        assert!(matches!(err, PortError::Gateway(msg) if msg.contains("502")));
    }

    #[tokio::test]
    async fn fetch_returns_first_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v4/dreambooth/fetch/4242"))
            .and(body_partial_json(json!({"key": "sd-key"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"status": "success", "id": 4242, "output": ["https://cdn.example/4242.png"]}),
            ))
            .mount(&server)
            .await;

        let url = adapter(&server).fetch("4242").await.unwrap();
        assert_eq!(url, "https://cdn.example/4242.png");
    }

    #[tokio::test]
    async fn fetch_of_unfinished_job_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v4/dreambooth/fetch/4242"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "processing", "id": 4242, "eta": 30})),
            )
            .mount(&server)
            .await;

        let err = adapter(&server).fetch("4242").await.unwrap_err();
        assert!(matches!(err, PortError::Gateway(msg) if msg.contains("still processing")));
    }
}

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Image handed to the model alongside the prompt.
#[derive(Debug, Clone, Copy)]
pub struct ImageInput<'a> {
    pub bytes: &'a [u8],
    pub media_type: &'a str,
}

/// Structured-extraction request: the model must answer with an object
/// matching `schema`.
#[derive(Debug, Clone, Copy)]
pub struct ObjectRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub schema: &'a serde_json::Value,
    pub image: ImageInput<'a>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedObject {
    pub object: serde_json::Value,
    pub usage: Usage,
}

/// Vision model capable of structured extraction.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn generate_object(&self, request: ObjectRequest<'_>) -> Result<GeneratedObject, AiError>;
}

/// Client for Cloudflare Workers AI vision models.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
}

#[derive(Deserialize)]
struct RunResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<RunResult>,
}

#[derive(Deserialize)]
struct ApiMessage {
    message: String,
}

#[derive(Deserialize)]
struct RunResult {
    response: serde_json::Value,
    #[serde(default)]
    usage: Usage,
}

impl WorkersAiClient {
    pub fn new(account_id: &str, api_token: &str) -> Result<Self, AiError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(AiError::Http)?;
        Ok(Self {
            http,
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
        })
    }
}

#[async_trait]
impl AiClient for WorkersAiClient {
    async fn generate_object(&self, request: ObjectRequest<'_>) -> Result<GeneratedObject, AiError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, request.model
        );

        let image = base64::engine::general_purpose::STANDARD.encode(request.image.bytes);
        let request_body = serde_json::json!({
            "messages": [
                { "role": "system", "content": request.prompt },
                {
                    "role": "user",
                    "content": "Analyze the garment in this photo. Return ONLY valid JSON."
                }
            ],
            "image": format!("data:{};base64,{}", request.image.media_type, image),
            "response_format": {
                "type": "json_schema",
                "json_schema": request.schema
            },
            "max_tokens": 512
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await
            .map_err(AiError::Http)?;

        let status = response.status();
        let body: RunResponse = response.json().await.map_err(AiError::Http)?;

        if !status.is_success() || !body.success {
            let message = body
                .errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AiError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let result = body.result.ok_or_else(|| AiError::Provider {
            status: status.as_u16(),
            message: "response had no result".to_string(),
        })?;

        // Some models return the object inline, others as a JSON string.
        let object = match result.response {
            serde_json::Value::String(text) => serde_json::from_str(&text).map_err(AiError::Parse)?,
            other => other,
        };

        Ok(GeneratedObject {
            object,
            usage: result.usage,
        })
    }
}

type Responder = dyn Fn(&[u8], usize) -> Result<serde_json::Value, String> + Send + Sync;

/// Deterministic AI double. The responder sees the image bytes and the
/// zero-based call number and decides between an object and a failure.
pub struct MockAiClient {
    responder: Box<Responder>,
    calls: AtomicUsize,
}

impl MockAiClient {
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&[u8], usize) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answer with `object`.
    pub fn succeeding(object: serde_json::Value) -> Self {
        Self::from_fn(move |_, _| Ok(object.clone()))
    }

    /// Always fail with `message`.
    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::from_fn(move |_, _| Err(message.clone()))
    }

    /// Fail the first `times` calls, then answer with `object`.
    pub fn failing_then(times: usize, message: &str, object: serde_json::Value) -> Self {
        let message = message.to_string();
        Self::from_fn(move |_, call| {
            if call < times {
                Err(message.clone())
            } else {
                Ok(object.clone())
            }
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiClient for MockAiClient {
    async fn generate_object(&self, request: ObjectRequest<'_>) -> Result<GeneratedObject, AiError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let object = (self.responder)(request.image.bytes, call).map_err(AiError::Mock)?;
        Ok(GeneratedObject {
            object,
            usage: Usage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("AI provider error (status {status}): {message}")]
    Provider { status: u16, message: String },

    #[error("Failed to parse model response as JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0}")]
    Mock(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(schema: &'a serde_json::Value, bytes: &'a [u8]) -> ObjectRequest<'a> {
        ObjectRequest {
            model: "test-model",
            prompt: "describe",
            schema,
            image: ImageInput {
                bytes,
                media_type: "image/png",
            },
        }
    }

    #[tokio::test]
    async fn test_mock_failing_then_succeeding() {
        let schema = serde_json::json!({});
        let client = MockAiClient::failing_then(2, "Mock AI client failure", serde_json::json!({ "ok": true }));

        for _ in 0..2 {
            let err = client.generate_object(request(&schema, b"img")).await.unwrap_err();
            assert_eq!(err.to_string(), "Mock AI client failure");
        }
        let generated = client.generate_object(request(&schema, b"img")).await.unwrap();
        assert_eq!(generated.object, serde_json::json!({ "ok": true }));
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_sees_image_bytes() {
        let schema = serde_json::json!({});
        let client = MockAiClient::from_fn(|bytes, _| {
            if bytes.starts_with(b"bad") {
                Err("unreadable".to_string())
            } else {
                Ok(serde_json::json!({}))
            }
        });
        assert!(client.generate_object(request(&schema, b"bad image")).await.is_err());
        assert!(client.generate_object(request(&schema, b"good image")).await.is_ok());
    }

    #[test]
    fn test_run_response_string_payload() {
        let body: RunResponse = serde_json::from_value(serde_json::json!({
            "success": true,
            "errors": [],
            "result": {
                "response": "{\"category\":\"coat\"}",
                "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
            }
        }))
        .unwrap();
        let result = body.result.unwrap();
        assert!(result.response.is_string());
        assert_eq!(result.usage.total_tokens, 15);
    }
}

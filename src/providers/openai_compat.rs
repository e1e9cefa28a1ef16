use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::providers::http::{
    classify_reqwest_error, classify_status, deterministic_backoff_ms, message_short,
    retry_after_ms, HttpConfig, RetryRecord, UpstreamError, UpstreamErrorKind,
};
use crate::providers::ChatClient;
use crate::types::Message;

/// Non-streaming chat client for any OpenAI-compatible completion endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    http: HttpConfig,
}

impl OpenAiChatClient {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        http: HttpConfig,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(http.connect_timeout())
            .timeout(http.request_timeout())
            .build()
            .context("failed to build OpenAI-compatible HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            http,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: ChatMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn chat(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, UpstreamError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = ChatRequest {
            model: &self.model,
            messages,
            temperature,
            max_tokens,
            stream: false,
        };
        let max_attempts = self.http.http_max_retries + 1;
        let mut retries = Vec::<RetryRecord>::new();

        for attempt in 1..=max_attempts {
            let mut request = self.client.post(&url).json(&payload);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    let cls = classify_reqwest_error(&e);
                    if cls.retryable && attempt < max_attempts {
                        let backoff = deterministic_backoff_ms(self.http, attempt - 1);
                        retries.push(RetryRecord {
                            attempt,
                            max_attempts,
                            kind: cls.kind,
                            status: cls.status,
                            backoff_ms: backoff,
                        });
                        tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                        continue;
                    }
                    return Err(UpstreamError {
                        kind: cls.kind,
                        http_status: cls.status,
                        retryable: cls.retryable,
                        attempt,
                        max_attempts,
                        message: format!("failed to call chat endpoint: {e}"),
                        retries,
                    });
                }
            };

            let status = response.status();
            if !status.is_success() {
                let cls = classify_status(status.as_u16());
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<body unavailable>".to_string());
                if cls.retryable && attempt < max_attempts {
                    let backoff = retry_after_ms(self.http, retry_after.as_deref())
                        .unwrap_or_else(|| deterministic_backoff_ms(self.http, attempt - 1));
                    retries.push(RetryRecord {
                        attempt,
                        max_attempts,
                        kind: cls.kind,
                        status: Some(status.as_u16()),
                        backoff_ms: backoff,
                    });
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                    continue;
                }
                return Err(UpstreamError {
                    kind: cls.kind,
                    http_status: Some(status.as_u16()),
                    retryable: cls.retryable,
                    attempt,
                    max_attempts,
                    message: format!(
                        "chat endpoint returned HTTP {}: {}",
                        status.as_u16(),
                        message_short(&body)
                    ),
                    retries,
                });
            }

            let bytes = match response.bytes().await {
                Ok(b) => b,
                Err(e) => {
                    return Err(UpstreamError {
                        kind: UpstreamErrorKind::Connection,
                        http_status: Some(status.as_u16()),
                        retryable: false,
                        attempt,
                        max_attempts,
                        message: format!("failed to read chat response body: {e}"),
                        retries,
                    })
                }
            };
            if bytes.len() > self.http.max_response_bytes {
                return Err(UpstreamError {
                    kind: UpstreamErrorKind::PayloadTooLarge,
                    http_status: Some(status.as_u16()),
                    retryable: false,
                    attempt,
                    max_attempts,
                    message: format!(
                        "response exceeded max bytes: {} > {}",
                        bytes.len(),
                        self.http.max_response_bytes
                    ),
                    retries,
                });
            }

            let parsed: ChatResponse = match serde_json::from_slice(&bytes) {
                Ok(p) => p,
                Err(e) => {
                    return Err(UpstreamError {
                        kind: UpstreamErrorKind::Parse,
                        http_status: Some(status.as_u16()),
                        retryable: false,
                        attempt,
                        max_attempts,
                        message: format!("failed to parse chat response JSON: {e}"),
                        retries,
                    })
                }
            };
            return match parsed.choices.into_iter().next().and_then(|c| c.message.content) {
                Some(text) => Ok(text),
                None => Err(UpstreamError {
                    kind: UpstreamErrorKind::Parse,
                    http_status: Some(status.as_u16()),
                    retryable: false,
                    attempt,
                    max_attempts,
                    message: "chat response had no choices[0].message.content".to_string(),
                    retries,
                }),
            };
        }

        Err(UpstreamError {
            kind: UpstreamErrorKind::Other,
            http_status: None,
            retryable: false,
            attempt: max_attempts,
            max_attempts,
            message: "unexpected retry loop termination".to_string(),
            retries,
        })
    }
}

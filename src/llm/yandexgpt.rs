use super::CompletionClient;
use crate::http::{FETCH_TIMEOUT, build_client};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub completion_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            completion_url: "https://llm.api.cloud.yandex.net/foundationModels/v1/completion"
                .into(),
            model: "yandexgpt-lite".into(),
            temperature: 0.6,
            max_tokens: 1000,
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            completion_url: std::env::var("YANDEX_GPT_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.completion_url),
            model: std::env::var("YANDEX_GPT_MODEL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.model),
            ..defaults
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing completion API key")]
    MissingApiKey,
    #[error("missing completion folder")]
    MissingFolder,
    #[error("http error: {0}")]
    Http(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("empty completion")]
    EmptyCompletion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmMessage {
    pub role: &'static str,
    pub text: String,
}

impl LlmMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system",
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user",
            text: text.into(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionRequest<'a> {
    model_uri: String,
    completion_options: CompletionOptions,
    messages: &'a [LlmMessage],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionOptions {
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    result: CompletionResult,
}

#[derive(Deserialize)]
struct CompletionResult {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Deserialize)]
struct Alternative {
    message: AlternativeMessage,
}

#[derive(Deserialize)]
struct AlternativeMessage {
    #[serde(default)]
    text: String,
}

pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(FETCH_TIMEOUT),
            config,
        }
    }
}

#[async_trait]
impl CompletionClient for LlmClient {
    async fn complete(
        &self,
        api_key: Option<&str>,
        folder: Option<&str>,
        messages: &[LlmMessage],
    ) -> Result<String, LlmError> {
        let api_key = api_key
            .filter(|v| !v.trim().is_empty())
            .ok_or(LlmError::MissingApiKey)?;
        let folder = folder
            .filter(|v| !v.trim().is_empty())
            .ok_or(LlmError::MissingFolder)?;

        let body = CompletionRequest {
            model_uri: format!("gpt://{folder}/{}", self.config.model),
            completion_options: CompletionOptions {
                stream: false,
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
            },
            messages,
        };

        let response = self
            .http
            .post(&self.config.completion_url)
            .header("Authorization", format!("Api-Key {api_key}"))
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: CompletionResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        let text = payload
            .result
            .alternatives
            .into_iter()
            .next()
            .map(|alt| alt.message.text)
            .ok_or_else(|| LlmError::InvalidResponse("no alternatives".into()))?;

        let text = text.trim();
        if text.is_empty() {
            return Err(LlmError::EmptyCompletion);
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> LlmClient {
        LlmClient::new(LlmConfig {
            completion_url: format!("{}/completion", server.uri()),
            ..LlmConfig::default()
        })
    }

    fn messages() -> Vec<LlmMessage> {
        vec![LlmMessage::system("be kind"), LlmMessage::user("good kettle")]
    }

    #[tokio::test]
    async fn sends_model_uri_and_returns_first_alternative() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completion"))
            .and(header("Authorization", "Api-Key k1"))
            .and(body_partial_json(json!({
                "modelUri": "gpt://folder-1/yandexgpt-lite",
                "completionOptions": { "stream": false, "maxTokens": 1000 },
                "messages": [
                    { "role": "system", "text": "be kind" },
                    { "role": "user", "text": "good kettle" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "alternatives": [{ "message": { "role": "assistant", "text": "  Рады стараться!  " } }] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let text = client(&server)
            .complete(Some("k1"), Some("folder-1"), &messages())
            .await
            .unwrap();
        assert_eq!(text, "Рады стараться!");
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = client(&server)
            .complete(None, Some("folder-1"), &messages())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MissingApiKey));
        let err = client(&server)
            .complete(Some("k1"), Some(" "), &messages())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MissingFolder));
    }

    #[tokio::test]
    async fn whitespace_completion_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "alternatives": [{ "message": { "text": "   " } }] }
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .complete(Some("k1"), Some("f"), &messages())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::EmptyCompletion));
    }
}

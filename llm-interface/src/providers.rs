use crate::TextGenerator;
use async_trait::async_trait;
use replybot_core::{LlmConfig, LlmError};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3";

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

fn chat_messages(system_prompt: &str, context: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            role: "system",
            content: system_prompt.to_string(),
        },
        ChatMessage {
            role: "user",
            content: context.to_string(),
        },
    ]
}

fn build_client(timeout: Duration, provider: &str) -> Result<Client, LlmError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| LlmError::Failed {
            reason: format!("failed to create HTTP client for {}: {}", provider, e),
        })
}

fn transport_error(provider: &str, e: reqwest::Error) -> LlmError {
    error!("{} request failed: {}", provider, e);
    if e.is_timeout() {
        LlmError::RequestTimeout {
            provider: provider.to_string(),
        }
    } else if e.is_connect() {
        LlmError::ServiceUnavailable {
            provider: provider.to_string(),
        }
    } else {
        LlmError::Failed {
            reason: e.to_string(),
        }
    }
}

/// Maps a non-success HTTP status onto the shared error type.
async fn status_error(provider: &str, model: &str, response: Response) -> LlmError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    let body = response.text().await.unwrap_or_default();
    error!("{} returned {}: {}", provider, status, body);

    let provider = provider.to_string();
    match status {
        401 => LlmError::InvalidApiKey { provider },
        403 => LlmError::AuthenticationFailed { provider },
        404 => LlmError::ModelNotAvailable {
            model: model.to_string(),
        },
        429 => LlmError::RateLimitExceeded {
            provider,
            retry_after,
        },
        s if s >= 500 => LlmError::ServiceUnavailable { provider },
        _ => LlmError::Failed {
            reason: format!("{} returned {}: {}", provider, status, body),
        },
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI chat completions.
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: Option<String>) -> Result<Self, LlmError> {
        Ok(Self {
            client: build_client(Duration::from_secs(60), "openai")?,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            base_url: OPENAI_API_URL.to_string(),
            max_tokens: 300,
            temperature: 0.8,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl TextGenerator for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, system_prompt: &str, context: &str) -> Result<String, LlmError> {
        let request = OpenAiRequest {
            model: self.model.clone(),
            messages: chat_messages(system_prompt, context),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        debug!("Sending chat completion request to OpenAI ({})", self.model);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("openai", e))?;

        if !response.status().is_success() {
            return Err(status_error("openai", &self.model, response).await);
        }

        let body: OpenAiResponse =
            response
                .json()
                .await
                .map_err(|_| LlmError::InvalidResponseFormat {
                    provider: "openai".to_string(),
                })?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::EmptyResponse {
                provider: "openai".to_string(),
            })?;
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(LlmError::ContentFiltered {
                reason: "content_filter".to_string(),
            });
        }
        choice
            .message
            .content
            .map(|text| text.trim().to_string())
            .ok_or_else(|| LlmError::EmptyResponse {
                provider: "openai".to_string(),
            })
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    system: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

/// Anthropic messages API.
pub struct ClaudeProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
}

impl ClaudeProvider {
    pub fn new(api_key: String, model: Option<String>) -> Result<Self, LlmError> {
        Ok(Self {
            client: build_client(Duration::from_secs(60), "anthropic")?,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
            base_url: ANTHROPIC_API_URL.to_string(),
            max_tokens: 300,
            temperature: 0.8,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl TextGenerator for ClaudeProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, system_prompt: &str, context: &str) -> Result<String, LlmError> {
        let request = AnthropicRequest {
            model: self.model.clone(),
            system: system_prompt.to_string(),
            messages: vec![ChatMessage {
                role: "user",
                content: context.to_string(),
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        debug!("Sending messages request to Anthropic ({})", self.model);
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("anthropic", e))?;

        if !response.status().is_success() {
            return Err(status_error("anthropic", &self.model, response).await);
        }

        let body: AnthropicResponse =
            response
                .json()
                .await
                .map_err(|_| LlmError::InvalidResponseFormat {
                    provider: "anthropic".to_string(),
                })?;

        let text: String = body
            .content
            .into_iter()
            .filter(|block| block.content_type == "text")
            .map(|block| block.text)
            .collect();
        Ok(text.trim().to_string())
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

/// Local Ollama server, `/api/chat` without streaming.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, model: Option<String>) -> Result<Self, LlmError> {
        Ok(Self {
            client: build_client(Duration::from_secs(60), "ollama")?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
            max_tokens: 300,
            temperature: 0.8,
        })
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Checks that the server answers `/api/tags`.
    pub async fn health_check(&self) -> Result<(), LlmError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| transport_error("ollama", e))?;
        if response.status().is_success() {
            info!("Connected to Ollama at {}", self.base_url);
            Ok(())
        } else {
            Err(status_error("ollama", &self.model, response).await)
        }
    }
}

#[async_trait]
impl TextGenerator for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, system_prompt: &str, context: &str) -> Result<String, LlmError> {
        let request = OllamaRequest {
            model: self.model.clone(),
            messages: chat_messages(system_prompt, context),
            stream: false,
            options: OllamaOptions {
                num_predict: self.max_tokens,
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("ollama", e))?;

        if !response.status().is_success() {
            return Err(status_error("ollama", &self.model, response).await);
        }

        let body: OllamaResponse =
            response
                .json()
                .await
                .map_err(|_| LlmError::InvalidResponseFormat {
                    provider: "ollama".to_string(),
                })?;
        Ok(body.message.content.trim().to_string())
    }
}

/// Builds the generator named by `config.provider`.
pub fn from_config(config: &LlmConfig) -> Result<Arc<dyn TextGenerator>, LlmError> {
    let generator: Arc<dyn TextGenerator> = match config.provider.as_str() {
        "openai" => {
            let key = config
                .openai_api_key
                .clone()
                .ok_or_else(|| LlmError::InvalidApiKey {
                    provider: "openai".to_string(),
                })?;
            Arc::new(
                OpenAiProvider::new(key, config.model.clone())?
                    .with_sampling(config.max_tokens, config.temperature),
            )
        }
        "anthropic" => {
            let key = config
                .anthropic_api_key
                .clone()
                .ok_or_else(|| LlmError::InvalidApiKey {
                    provider: "anthropic".to_string(),
                })?;
            Arc::new(
                ClaudeProvider::new(key, config.model.clone())?
                    .with_sampling(config.max_tokens, config.temperature),
            )
        }
        "ollama" => Arc::new(
            OllamaProvider::new(config.ollama_base_url.clone(), config.model.clone())?
                .with_sampling(config.max_tokens, config.temperature),
        ),
        other => {
            return Err(LlmError::UnsupportedProvider {
                provider: other.to_string(),
            })
        }
    };

    info!("LLM client initialized: {}", generator.name());
    Ok(generator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_openai_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini", "max_tokens": 300})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": " Nice point! "}}]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("sk-test".to_string(), None)
            .unwrap()
            .with_base_url(server.uri());
        let text = provider.generate("system", "context").await.unwrap();
        assert_eq!(text, "Nice point!");
    }

    #[tokio::test]
    async fn test_openai_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "12"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("sk-test".to_string(), None)
            .unwrap()
            .with_base_url(server.uri());
        assert_eq!(
            provider.generate("s", "c").await,
            Err(LlmError::RateLimitExceeded {
                provider: "openai".to_string(),
                retry_after: 12
            })
        );
    }

    #[tokio::test]
    async fn test_openai_content_filter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {"role": "assistant", "content": null},
                    "finish_reason": "content_filter"
                }]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("sk-test".to_string(), None)
            .unwrap()
            .with_base_url(server.uri());
        assert!(matches!(
            provider.generate("s", "c").await,
            Err(LlmError::ContentFiltered { .. })
        ));
    }

    #[tokio::test]
    async fn test_anthropic_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "ak-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({"system": "be brief"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "Agreed."}],
                "model": DEFAULT_ANTHROPIC_MODEL
            })))
            .mount(&server)
            .await;

        let provider = ClaudeProvider::new("ak-test".to_string(), None)
            .unwrap()
            .with_base_url(server.uri());
        assert_eq!(provider.generate("be brief", "ctx").await.unwrap(), "Agreed.");
    }

    #[tokio::test]
    async fn test_ollama_generate_and_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"model": "llama3", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "Sure thing\n"}
            })))
            .mount(&server)
            .await;

        let provider = OllamaProvider::new(server.uri(), None).unwrap();
        provider.health_check().await.unwrap();
        assert_eq!(provider.generate("s", "c").await.unwrap(), "Sure thing");
    }

    #[test]
    fn test_from_config() {
        let mut config = LlmConfig::default();
        assert!(matches!(
            from_config(&config),
            Err(LlmError::InvalidApiKey { .. })
        ));

        config.openai_api_key = Some("sk".to_string());
        assert_eq!(from_config(&config).unwrap().name(), "openai");

        config.provider = "ollama".to_string();
        assert_eq!(from_config(&config).unwrap().name(), "ollama");

        config.provider = "bard".to_string();
        assert!(matches!(
            from_config(&config),
            Err(LlmError::UnsupportedProvider { .. })
        ));
    }
}

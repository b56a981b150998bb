use reqwest::{
    Client,
    header,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Per-request timeout applied to every chat-completions call.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// System prompt for the moderation verdict. The model is instructed to
/// answer with exactly one of two literals; anything else is treated as a
/// rejection by the caller.
const MODERATION_SYSTEM_PROMPT: &str = "You are a content moderation expert. \
Please determine if the provided content complies with public order and good \
customs, and whether it contains inappropriate information. If the content \
is compliant, return 'Approved'; if it contains inappropriate information, \
return 'Rejected'. Only return 'Approved' or 'Rejected', do not add any \
other content.";

/// System prompt for summary generation.
const SUMMARY_SYSTEM_PROMPT: &str = "You are a professional tourist \
attraction review summary expert. Please generate a detailed summary report \
based on the provided scenic spot information and review content.";

/// A client for an OpenAI-style chat-completions endpoint.
///
/// The client is responsible for two narrow capabilities: rendering a
/// moderation verdict for review content and generating a free-text summary
/// from assembled review input. Both go through the same `generate` call,
/// differing only in prompts and sampling parameters.
///
/// ``` no_run
/// use ai_client::AiClient;
///
/// #[tokio::main]
/// async fn main() {
///     let client = AiClient::new("https://ark.example.com/api/v3/chat/completions", "key").unwrap();
///     let approved = client.moderate("{\"content\":\"great place\"}", "model-id").await.unwrap();
///     assert!(approved || !approved);
/// }
/// ```
#[derive(Debug)]
pub struct AiClient {
    client: Client,
    api_url: Url,
}

#[derive(Debug, thiserror::Error)]
pub enum AiClientError {
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),
    #[error("API error {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// A single chat message in a request.
#[derive(Debug, Clone, Serialize)]
pub struct AiRequestMessage {
    pub role: String,
    pub content: String,
}

impl AiRequestMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat-completions request body.
#[derive(Debug, Clone, Serialize)]
pub struct AiRequest {
    pub model: String,
    pub messages: Vec<AiRequestMessage>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

impl AiRequest {
    pub fn new(model: impl Into<String>, messages: Vec<AiRequestMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: 2000,
            stream: false,
        }
    }

    #[must_use]
    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }
}

/// Chat-completions response body. Fields the caller never inspects are
/// tolerated as absent.
#[derive(Debug, Default, Deserialize)]
pub struct AiResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<AiChoice>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AiChoice {
    #[serde(default)]
    pub message: AiMessage,
}

#[derive(Debug, Default, Deserialize)]
pub struct AiMessage {
    #[serde(default)]
    pub role: String,
    pub content: Option<String>,
}

impl AiResponse {
    /// Content of the first choice, if the response carried one.
    pub fn content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.message.content.as_deref())
    }
}

impl AiClient {
    /// Create a new client against the given chat-completions endpoint,
    /// authenticating every request with the bearer key.
    pub fn new(api_url: &str, api_key: &str) -> Result<Self, AiClientError> {
        let api_url = Url::parse(api_url)?;
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {api_key}").parse().map_err(|_| {
                AiClientError::InvalidResponse("Invalid authorization header".to_string())
            })?,
        );

        let client = Client::builder()
            .use_rustls_tls()
            .default_headers(headers)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self { client, api_url })
    }

    /// Call the model and return the parsed response.
    pub async fn generate(&self, request: &AiRequest) -> Result<AiResponse, AiClientError> {
        debug!(model = %request.model, stream = request.stream, "Sending chat-completions request");

        let response = self
            .client
            .post(self.api_url.clone())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiClientError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let response: AiResponse = response.json().await?;
        debug!(id = %response.id, model = %response.model, "Received chat-completions response");

        Ok(response)
    }

    /// Render a moderation verdict for the given content.
    ///
    /// Returns true only when the model replies with the exact literal
    /// "Approved" (surrounding whitespace ignored). Any other well-formed
    /// reply is a rejection; transport and malformed-response errors are
    /// returned to the caller.
    pub async fn moderate(&self, content: &str, model_id: &str) -> Result<bool, AiClientError> {
        let request = AiRequest::new(
            model_id,
            vec![
                AiRequestMessage::system(MODERATION_SYSTEM_PROMPT),
                AiRequestMessage::user(content),
            ],
        )
        .with_sampling(0.0, 10);

        let response = self.generate(&request).await?;
        let verdict = response
            .content()
            .ok_or_else(|| {
                AiClientError::InvalidResponse("Missing message content in response".to_string())
            })?
            .trim();

        debug!(%verdict, "Moderation verdict");
        Ok(verdict == "Approved")
    }

    /// Generate a summary from the assembled review input.
    pub async fn summarize(&self, summary_input: &str, model_id: &str) -> Result<String, AiClientError> {
        let request = AiRequest::new(
            model_id,
            vec![
                AiRequestMessage::system(SUMMARY_SYSTEM_PROMPT),
                AiRequestMessage::user(summary_input),
            ],
        );

        let response = self.generate(&request).await?;
        let summary = response
            .content()
            .ok_or_else(|| {
                AiClientError::InvalidResponse("Missing message content in response".to_string())
            })?
            .trim()
            .to_string();

        Ok(summary)
    }
}

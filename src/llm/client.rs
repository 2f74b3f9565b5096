use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::error::{GatewayError, InsightError, Result};
use crate::llm::gateway::{ChatMessage, CompletionGateway, CompletionRequest, Role};
use crate::llm::types::*;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Completion gateway backed by the Gemini `generateContent` endpoint.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    /// Reads `GEMINI_API_KEY` and, optionally, `GEMINI_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| InsightError::Config("GEMINI_API_KEY is not set".to_string()))?;
        let client = Self::new(api_key);
        Ok(match std::env::var("GEMINI_MODEL") {
            Ok(model) if !model.trim().is_empty() => client.with_model(model.trim()),
            _ => client,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Maps the role-tagged message list onto Gemini's request shape. System messages are
/// joined into the system instruction; assistant turns use the `model` role.
pub(crate) fn build_request(request: &CompletionRequest) -> GenerateContentRequest {
    let system_text = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let contents = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(to_content)
        .collect();

    // Gemini has no recency window; any freshness hint turns on search grounding.
    let tools = request
        .params
        .freshness
        .map(|_| Tool {
            google_search: json!({}),
        })
        .into_iter()
        .collect();

    GenerateContentRequest {
        contents,
        system_instruction: (!system_text.is_empty()).then(|| Content {
            role: "user".to_string(),
            parts: vec![Part::Text { text: system_text }],
        }),
        generation_config: GenerationConfig {
            temperature: request.params.temperature,
            max_output_tokens: request.params.max_output_tokens,
        },
        tools,
    }
}

fn to_content(message: &ChatMessage) -> Content {
    let role = match message.role {
        Role::Assistant => "model",
        Role::User | Role::System => "user",
    };
    Content {
        role: role.to_string(),
        parts: vec![Part::Text {
            text: message.content.clone(),
        }],
    }
}

/// Concatenates the text parts of the first candidate.
pub(crate) fn response_text(body: GenerateContentResponse) -> std::result::Result<String, GatewayError> {
    let candidate = body
        .candidates
        .ok_or_else(|| GatewayError::InvalidResponse("No candidates returned".to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::InvalidResponse("Empty candidates list".to_string()))?;

    let content = candidate.content.ok_or_else(|| {
        GatewayError::InvalidResponse(format!(
            "Candidate has no content (finish reason {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        ))
    })?;

    let text: String = content
        .parts
        .into_iter()
        .filter_map(|part| match part {
            Part::Text { text } => Some(text),
            Part::Other(_) => None,
        })
        .collect();

    if text.is_empty() {
        return Err(GatewayError::InvalidResponse(
            "Model returned non-text content".to_string(),
        ));
    }
    Ok(text)
}

#[async_trait]
impl CompletionGateway for GeminiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> std::result::Result<String, GatewayError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let payload = build_request(&request);

        let res = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        let status = res.status();

        if !status.is_success() {
            let body = res
                .text()
                .await
                .map_err(|e| GatewayError::Network(e.to_string()))?;
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: GenerateContentResponse = res
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        response_text(body)
    }
}

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{GatewayError, InsightError, Operation, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Asks the completion service to ground its answer in recent information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "days")]
pub enum Freshness {
    Live,
    WithinDays(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
    #[serde(default)]
    pub freshness: Option<Freshness>,
}

impl GenerationParams {
    pub fn new(temperature: f32, max_output_tokens: u32) -> Self {
        Self {
            temperature,
            max_output_tokens,
            freshness: None,
        }
    }

    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = Some(freshness);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
}

/// The external text-generation service: an ordered list of role-tagged messages in,
/// one text blob out. Nothing about the shape of the text is guaranteed.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> std::result::Result<String, GatewayError>;
}

/// Issues one gateway call bounded by `timeout`. Timeouts and service failures surface as
/// [`InsightError::Upstream`] tagged with `operation`; nothing is retried here.
pub async fn call_gateway(
    gateway: &Arc<dyn CompletionGateway>,
    operation: Operation,
    request: CompletionRequest,
    timeout: Duration,
) -> Result<String> {
    debug!(
        "{} call via {}: {} messages, max {} tokens",
        operation,
        gateway.name(),
        request.messages.len(),
        request.params.max_output_tokens
    );

    match tokio::time::timeout(timeout, gateway.complete(request)).await {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(InsightError::upstream(operation, e)),
        Err(_) => Err(InsightError::upstream(
            operation,
            GatewayError::Timeout(timeout),
        )),
    }
}

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::ActorError,
    providers::{complete_with_retry, LLMProvider},
    tools::{Tool, ToolCall, ToolChoice},
    types::{ChatMessage, CompletionRequest},
};

/// Default instructions for the system under test, covering the staging
/// workup the tool family supports.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an experienced thoracic oncologist consulting on a lung cancer case.\n\
The opening message gives first-contact information only; detailed findings \
must be retrieved through the available tools.\n\
Work stepwise: analyze what is known, call the tools you need, reason over \
the returned data, and finish with a complete diagnosis and treatment \
recommendation grounded in the retrieved results.";

/// What the agent produced for one turn: either a user-facing message or one
/// or more tool-call requests.
#[derive(Debug, Clone)]
pub enum AgentReply {
    Message(String),
    ToolCalls(Vec<ToolCall>),
}

/// Opaque interface to the system under test. The orchestrator neither knows
/// nor cares which backend implements it.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    async fn respond(
        &self,
        history: &[ChatMessage],
        tools: &[Tool],
    ) -> Result<AgentReply, ActorError>;
}

/// Agent adapter backed by any `LLMProvider` with native tool calling.
pub struct LlmAgent {
    provider: Arc<dyn LLMProvider>,
    model: String,
    system_prompt: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout_ms: u64,
    retries: u32,
}

impl LlmAgent {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: Some(0.3),
            max_tokens: None,
            timeout_ms: 60_000,
            retries: 3,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

#[async_trait]
impl AgentAdapter for LlmAgent {
    async fn respond(
        &self,
        history: &[ChatMessage],
        tools: &[Tool],
    ) -> Result<AgentReply, ActorError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(history.iter().cloned());

        let mut request = CompletionRequest::new(self.model.clone(), messages)
            .with_tools(tools.iter().cloned());
        if !tools.is_empty() {
            request = request.with_tool_choice(ToolChoice::auto());
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let response = complete_with_retry(
            self.provider.as_ref(),
            &request,
            self.timeout_ms,
            self.retries,
        )
        .await?;

        if !response.message.tool_calls.is_empty() {
            return Ok(AgentReply::ToolCalls(response.message.tool_calls));
        }

        let content = response.message.text().unwrap_or_default().trim().to_string();
        if content.is_empty() {
            return Err(ActorError::EmptyResponse);
        }

        Ok(AgentReply::Message(content))
    }
}

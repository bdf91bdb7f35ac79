use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    providers::LLMProvider,
    tools::{FunctionCall, ToolCall},
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

/// Deterministic provider that replays a fixed queue of assistant messages.
/// Each `complete` call pops one message; exhausting the queue is a provider
/// error, which keeps test scripts honest about call counts.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ChatMessage>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ChatMessage>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(|t| ChatMessage::assistant(t.into())).collect())
    }

    /// Assistant message that requests a single tool call.
    pub fn tool_call_message(tool: impl Into<String>, arguments: Value) -> ChatMessage {
        let mut message = ChatMessage::assistant(String::new());
        message.content = None;
        message.tool_calls = vec![
            ToolCall::new(FunctionCall::new(tool, arguments)).with_id("scripted_call_0"),
        ];
        message
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let next = {
            let mut guard = self
                .responses
                .lock()
                .map_err(|_| LLMError::Provider("scripted queue poisoned".to_string()))?;
            guard.pop_front()
        };

        match next {
            Some(message) => Ok(CompletionResponse {
                message,
                usage: None,
            }),
            None => Err(LLMError::Provider(
                "no more scripted responses".to_string(),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

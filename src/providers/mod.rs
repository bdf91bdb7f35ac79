use std::time::Duration;

use async_trait::async_trait;

use crate::error::ActorError;
use crate::types::{CompletionRequest, CompletionResponse};
use crate::LLMError;

pub mod openrouter;
pub mod scripted;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    fn name(&self) -> &'static str;
}

/// One actor-facing provider call: per-attempt timeout, bounded retries on
/// transient failure, typed exhaustion instead of a hang or crash.
pub(crate) async fn complete_with_retry(
    provider: &dyn LLMProvider,
    request: &CompletionRequest,
    timeout_ms: u64,
    retries: u32,
) -> Result<CompletionResponse, ActorError> {
    let attempts = retries.max(1);
    let mut last = String::new();

    for attempt in 1..=attempts {
        let call = provider.complete(request.clone());
        match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(error)) => {
                last = error.to_string();
                tracing::warn!(attempt, provider = provider.name(), error = %last, "provider call failed");
            }
            Err(_) => {
                last = format!("timed out after {timeout_ms} ms");
                tracing::warn!(attempt, provider = provider.name(), "provider call timed out");
            }
        }
    }

    Err(ActorError::RetriesExhausted { attempts, last })
}

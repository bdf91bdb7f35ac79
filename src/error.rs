use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),
}

/// Failure of a dialogue actor (user simulator or agent adapter).
///
/// Recorded as a trajectory terminal status, never propagated as a crash
/// past the orchestrator.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("actor call timed out after {0} ms")]
    Timeout(u64),

    #[error("retry budget exhausted ({attempts} attempts): {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("actor produced an empty response")]
    EmptyResponse,

    #[error(transparent)]
    Provider(#[from] LLMError),
}

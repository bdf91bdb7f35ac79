pub mod agent;
pub mod batch;
pub mod case;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod orchestrator;
pub mod providers;
pub mod simulator;
pub mod tools;
pub mod trajectory;
pub mod types;

pub use agent::{AgentAdapter, AgentReply, LlmAgent};
pub use batch::{BatchError, BatchRunner, BatchSummary, RunRecord};
pub use case::{Case, CaseSet, LoaderError};
pub use config::{RunConfig, TerminalPredicate};
pub use error::{ActorError, LLMError};
pub use evaluator::{
    CriterionScore,
    EvaluationError,
    EvaluationResult,
    Evaluator,
    FaultAttribution,
    FaultAttributor,
    FaultType,
    ResponsibleActor,
    RubricCriterion,
};
pub use orchestrator::Orchestrator;
pub use providers::LLMProvider;
pub use simulator::{SimulatedUtterance, UserSimulator, UserStrategy, STOP_SENTINEL};
pub use tools::{
    FunctionCall, Tool, ToolCall, ToolChoice, ToolError, ToolRegistry, ToolSpec, ToolType,
};
pub use trajectory::{TerminalStatus, Trajectory, Turn, TurnKind};
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage,
};

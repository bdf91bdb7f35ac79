use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{FunctionCall, ToolCall};
use crate::types::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    MaxTurnsExceeded,
    AgentError,
    UserError,
    ToolError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnKind {
    UserUtterance {
        text: String,
        /// Generative backend calls the simulator spent producing this turn.
        generative_calls: u32,
    },
    AgentMessage {
        text: String,
    },
    AgentToolCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        tool: String,
        arguments: Value,
    },
    ToolResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        tool: String,
        payload: Value,
        /// False when the payload is a synthesized invalid-call notice.
        valid: bool,
    },
    SystemTermination {
        status: TerminalStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub index: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TurnKind,
}

/// Ordered record of one case's simulated conversation. Owned exclusively by
/// the orchestration run that created it; immutable once the terminal status
/// is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub case_id: String,
    pub turns: Vec<Turn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TerminalStatus>,
}

impl Trajectory {
    pub fn new(case_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            turns: Vec::new(),
            status: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some()
    }

    /// Appends a turn with the next sequence index. No-op after termination.
    pub fn push(&mut self, kind: TurnKind) {
        if self.is_terminal() {
            return;
        }
        let index = self.turns.len() as u64;
        self.turns.push(Turn {
            index,
            at: Utc::now(),
            kind,
        });
    }

    /// Seals the trajectory with a terminal status. The first call wins.
    pub fn finish(&mut self, status: TerminalStatus, detail: Option<String>) {
        if self.is_terminal() {
            return;
        }
        let index = self.turns.len() as u64;
        self.turns.push(Turn {
            index,
            at: Utc::now(),
            kind: TurnKind::SystemTermination {
                status,
                detail,
            },
        });
        self.status = Some(status);
    }

    /// Number of agent-visible turns consumed so far: each agent message and
    /// each run of tool calls with their results counts as one.
    pub fn agent_turns(&self) -> usize {
        let mut count = 0;
        let mut in_call_block = false;
        for turn in &self.turns {
            match &turn.kind {
                TurnKind::AgentMessage { .. } => {
                    count += 1;
                    in_call_block = false;
                }
                TurnKind::AgentToolCall { .. } => {
                    if !in_call_block {
                        count += 1;
                        in_call_block = true;
                    }
                }
                // Results interleave with the calls of the same agent reply.
                TurnKind::ToolResult { .. } => {}
                _ => in_call_block = false,
            }
        }
        count
    }

    pub fn last_agent_message(&self) -> Option<&str> {
        self.turns.iter().rev().find_map(|turn| match &turn.kind {
            TurnKind::AgentMessage { text } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.turns.iter().filter_map(|turn| match &turn.kind {
            TurnKind::AgentToolCall { tool, arguments, .. } => {
                Some((tool.as_str(), arguments))
            }
            _ => None,
        })
    }

    /// Projects the trajectory into provider chat messages. Consecutive tool
    /// calls collapse into one assistant message, matching the wire shape the
    /// calls arrived in.
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = Vec::new();
        let mut pending_calls: Vec<ToolCall> = Vec::new();

        for turn in &self.turns {
            match &turn.kind {
                TurnKind::AgentToolCall {
                    call_id,
                    tool,
                    arguments,
                } => {
                    let mut call =
                        ToolCall::new(FunctionCall::new(tool.clone(), arguments.clone()));
                    call.id = call_id.clone();
                    pending_calls.push(call);
                    continue;
                }
                _ => {
                    if !pending_calls.is_empty() {
                        let mut assistant = ChatMessage::assistant(String::new());
                        assistant.content = None;
                        assistant.tool_calls = std::mem::take(&mut pending_calls);
                        messages.push(assistant);
                    }
                }
            }

            match &turn.kind {
                TurnKind::UserUtterance { text, .. } => {
                    messages.push(ChatMessage::user(text.clone()));
                }
                TurnKind::AgentMessage { text } => {
                    messages.push(ChatMessage::assistant(text.clone()));
                }
                TurnKind::ToolResult {
                    call_id,
                    tool,
                    payload,
                    ..
                } => {
                    let id = call_id.clone().unwrap_or_else(|| tool.clone());
                    let content =
                        serde_json::to_string(payload).unwrap_or_else(|_| payload.to_string());
                    messages.push(ChatMessage::tool(id, content));
                }
                TurnKind::SystemTermination { .. } | TurnKind::AgentToolCall { .. } => {}
            }
        }

        if !pending_calls.is_empty() {
            let mut assistant = ChatMessage::assistant(String::new());
            assistant.content = None;
            assistant.tool_calls = pending_calls;
            messages.push(assistant);
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageRole;

    #[test]
    fn indices_are_gapless_from_zero() {
        let mut trajectory = Trajectory::new("P1");
        trajectory.push(TurnKind::UserUtterance {
            text: "hello".into(),
            generative_calls: 0,
        });
        trajectory.push(TurnKind::AgentMessage { text: "hi".into() });
        trajectory.finish(TerminalStatus::Completed, None);

        for (i, turn) in trajectory.turns.iter().enumerate() {
            assert_eq!(turn.index, i as u64);
        }
        assert_eq!(trajectory.turns.len(), 3);
    }

    #[test]
    fn push_after_finish_is_ignored() {
        let mut trajectory = Trajectory::new("P1");
        trajectory.finish(TerminalStatus::AgentError, Some("timeout".into()));
        trajectory.push(TurnKind::AgentMessage { text: "late".into() });
        trajectory.finish(TerminalStatus::Completed, None);

        assert_eq!(trajectory.turns.len(), 1);
        assert_eq!(trajectory.status, Some(TerminalStatus::AgentError));
    }

    #[test]
    fn agent_turns_counts_tool_call_blocks_once() {
        let mut trajectory = Trajectory::new("P1");
        trajectory.push(TurnKind::UserUtterance {
            text: "q".into(),
            generative_calls: 0,
        });
        trajectory.push(TurnKind::AgentToolCall {
            call_id: None,
            tool: "get_tumor_markers".into(),
            arguments: serde_json::json!({}),
        });
        trajectory.push(TurnKind::AgentToolCall {
            call_id: None,
            tool: "get_blood_routine".into(),
            arguments: serde_json::json!({}),
        });
        trajectory.push(TurnKind::ToolResult {
            call_id: None,
            tool: "get_tumor_markers".into(),
            payload: serde_json::json!({}),
            valid: true,
        });
        trajectory.push(TurnKind::AgentMessage { text: "done".into() });

        assert_eq!(trajectory.agent_turns(), 2);
    }

    #[test]
    fn agent_turns_counts_interleaved_calls_and_results_once() {
        let mut trajectory = Trajectory::new("P1");
        for tool in ["get_tumor_markers", "get_blood_routine"] {
            trajectory.push(TurnKind::AgentToolCall {
                call_id: None,
                tool: tool.into(),
                arguments: serde_json::json!({}),
            });
            trajectory.push(TurnKind::ToolResult {
                call_id: None,
                tool: tool.into(),
                payload: serde_json::json!({}),
                valid: true,
            });
        }
        trajectory.push(TurnKind::UserUtterance {
            text: "and?".into(),
            generative_calls: 1,
        });
        trajectory.push(TurnKind::AgentToolCall {
            call_id: None,
            tool: "get_tumor_markers".into(),
            arguments: serde_json::json!({}),
        });

        assert_eq!(trajectory.agent_turns(), 2);
    }

    #[test]
    fn chat_history_groups_consecutive_calls() {
        let mut trajectory = Trajectory::new("P1");
        trajectory.push(TurnKind::UserUtterance {
            text: "q".into(),
            generative_calls: 1,
        });
        trajectory.push(TurnKind::AgentToolCall {
            call_id: Some("call_0".into()),
            tool: "get_tumor_markers".into(),
            arguments: serde_json::json!({}),
        });
        trajectory.push(TurnKind::AgentToolCall {
            call_id: Some("call_1".into()),
            tool: "get_blood_routine".into(),
            arguments: serde_json::json!({}),
        });
        trajectory.push(TurnKind::ToolResult {
            call_id: Some("call_0".into()),
            tool: "get_tumor_markers".into(),
            payload: serde_json::json!({ "CEA": 8.5 }),
            valid: true,
        });

        let history = trajectory.chat_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].role, MessageRole::Assistant);
        assert_eq!(history[1].tool_calls.len(), 2);
        assert_eq!(history[2].role, MessageRole::Tool);
        assert_eq!(history[2].tool_call_id.as_deref(), Some("call_0"));
    }

    #[test]
    fn roundtrips_through_json() {
        let mut trajectory = Trajectory::new("P1");
        trajectory.push(TurnKind::UserUtterance {
            text: "patient, 65, cough 1 month".into(),
            generative_calls: 0,
        });
        trajectory.finish(TerminalStatus::MaxTurnsExceeded, None);

        let wire = serde_json::to_string(&trajectory).expect("serialize");
        let parsed: Trajectory = serde_json::from_str(&wire).expect("deserialize");
        assert_eq!(parsed.case_id, "P1");
        assert_eq!(parsed.status, Some(TerminalStatus::MaxTurnsExceeded));
        assert_eq!(parsed.turns.len(), 2);
    }
}

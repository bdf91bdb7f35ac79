use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::{
    agent::{AgentAdapter, AgentReply},
    case::Case,
    config::RunConfig,
    simulator::{SimulatedUtterance, UserSimulator},
    tools::{ToolCall, ToolError, ToolRegistry},
    trajectory::{TerminalStatus, Trajectory, TurnKind},
};

enum Phase {
    AwaitingUser,
    AwaitingAgent,
    /// Requested calls awaiting dispatch, in request order.
    AwaitingTool(Vec<ToolCall>),
}

/// Turn-taking state machine coordinating the user simulator, the agent under
/// test, and the tool executor for exactly one case.
///
/// Given identical actor outputs the produced trajectory is byte-identical
/// except for timestamps: tool results are lookups, never generated.
pub struct Orchestrator {
    agent: Arc<dyn AgentAdapter>,
    simulator: Arc<UserSimulator>,
    config: RunConfig,
}

impl Orchestrator {
    pub fn new(
        agent: Arc<dyn AgentAdapter>,
        simulator: Arc<UserSimulator>,
        config: RunConfig,
    ) -> Self {
        Self {
            agent,
            simulator,
            config,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs one trajectory to termination. Never panics on actor failure:
    /// every exit path seals the trajectory with a typed terminal status.
    pub async fn run(&self, case: &Case, registry: &ToolRegistry) -> Trajectory {
        let mut trajectory = Trajectory::new(case.id.clone());
        let tools = registry.tools();
        let mut invalid_streak = 0u32;

        let mut phase = if self.config.simulated_opening {
            Phase::AwaitingUser
        } else {
            trajectory.push(TurnKind::UserUtterance {
                text: case.initial_prompt.clone(),
                generative_calls: 0,
            });
            Phase::AwaitingAgent
        };

        // Outer bound on an actor call: the per-attempt timeout times the
        // retry budget, plus one attempt of slack for adapter overhead.
        let actor_deadline = Duration::from_millis(
            self.config
                .actor_timeout_ms
                .saturating_mul(u64::from(self.config.actor_retries.max(1)) + 1),
        );

        while !trajectory.is_terminal() {
            match phase {
                Phase::AwaitingAgent => {
                    if trajectory.agent_turns() >= self.config.max_agent_turns {
                        tracing::debug!(case = %case.id, "agent turn budget exhausted");
                        trajectory.finish(TerminalStatus::MaxTurnsExceeded, None);
                        break;
                    }

                    let history = trajectory.chat_history();
                    let reply =
                        time::timeout(actor_deadline, self.agent.respond(&history, &tools)).await;

                    match reply {
                        Ok(Ok(AgentReply::Message(text))) => {
                            // Conversation moved on: past invalid calls are no
                            // longer consecutive.
                            invalid_streak = 0;
                            let terminal = self.config.terminal_predicate.is_terminal(&text);
                            trajectory.push(TurnKind::AgentMessage { text });
                            if terminal {
                                trajectory.finish(TerminalStatus::Completed, None);
                                break;
                            }
                            phase = Phase::AwaitingUser;
                        }
                        Ok(Ok(AgentReply::ToolCalls(calls))) => {
                            if calls.is_empty() {
                                trajectory.finish(
                                    TerminalStatus::AgentError,
                                    Some("agent returned an empty tool-call batch".to_string()),
                                );
                                break;
                            }
                            phase = Phase::AwaitingTool(calls);
                        }
                        Ok(Err(error)) => {
                            tracing::warn!(case = %case.id, %error, "agent adapter failed");
                            trajectory
                                .finish(TerminalStatus::AgentError, Some(error.to_string()));
                            break;
                        }
                        Err(_) => {
                            trajectory.finish(
                                TerminalStatus::AgentError,
                                Some(format!("agent call exceeded {actor_deadline:?}")),
                            );
                            break;
                        }
                    }
                }
                Phase::AwaitingTool(calls) => {
                    // One ToolResult per requested call, in request order and
                    // immediately after its own AgentToolCall turn.
                    for call in calls {
                        let call_id = call
                            .id
                            .unwrap_or_else(|| format!("call_{}", trajectory.turns.len()));
                        let tool = call.function.name;
                        let arguments = call.function.arguments;
                        trajectory.push(TurnKind::AgentToolCall {
                            call_id: Some(call_id.clone()),
                            tool: tool.clone(),
                            arguments: arguments.clone(),
                        });
                        match registry.execute(&tool, &arguments, case) {
                            Ok(payload) => {
                                invalid_streak = 0;
                                trajectory.push(TurnKind::ToolResult {
                                    call_id: Some(call_id),
                                    tool,
                                    payload,
                                    valid: true,
                                });
                            }
                            Err(error @ ToolError::UnknownCaseForTool { .. }) => {
                                // Valid call, missing fixture data: feed the gap
                                // back without charging the agent.
                                trajectory.push(TurnKind::ToolResult {
                                    call_id: Some(call_id),
                                    tool,
                                    payload: error.to_payload(),
                                    valid: true,
                                });
                            }
                            Err(error) => {
                                invalid_streak += 1;
                                tracing::debug!(
                                    case = %case.id,
                                    %tool,
                                    invalid_streak,
                                    %error,
                                    "invalid tool call"
                                );
                                trajectory.push(TurnKind::ToolResult {
                                    call_id: Some(call_id),
                                    tool,
                                    payload: error.to_payload(),
                                    valid: false,
                                });
                                if invalid_streak >= self.config.max_invalid_calls {
                                    trajectory.finish(
                                        TerminalStatus::AgentError,
                                        Some(format!(
                                            "{invalid_streak} consecutive invalid tool calls"
                                        )),
                                    );
                                    break;
                                }
                            }
                        }
                    }
                    phase = Phase::AwaitingAgent;
                }
                Phase::AwaitingUser => {
                    let history = trajectory.chat_history();
                    let utterance = time::timeout(
                        actor_deadline,
                        self.simulator.next_utterance(case, &history),
                    )
                    .await;

                    match utterance {
                        Ok(Ok(SimulatedUtterance::Utterance {
                            text,
                            generative_calls,
                        })) => {
                            trajectory.push(TurnKind::UserUtterance {
                                text,
                                generative_calls,
                            });
                            phase = Phase::AwaitingAgent;
                        }
                        Ok(Ok(SimulatedUtterance::EndConversation { .. })) => {
                            trajectory.finish(
                                TerminalStatus::Completed,
                                Some("user ended the conversation".to_string()),
                            );
                            break;
                        }
                        Ok(Err(error)) => {
                            tracing::warn!(case = %case.id, %error, "user simulator failed");
                            trajectory.finish(TerminalStatus::UserError, Some(error.to_string()));
                            break;
                        }
                        Err(_) => {
                            trajectory.finish(
                                TerminalStatus::UserError,
                                Some(format!("simulator call exceeded {actor_deadline:?}")),
                            );
                            break;
                        }
                    }
                }
            }
        }

        trajectory
    }
}

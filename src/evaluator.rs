use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    case::Case,
    providers::{complete_with_retry, LLMProvider},
    trajectory::{Trajectory, TurnKind},
    types::{extract_json_object, ChatMessage, CompletionRequest},
};

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("criterion input unavailable: {0}")]
    MissingInput(String),
    #[error("{0}")]
    Scoring(String),
}

type ScoreFn =
    Box<dyn Fn(&Trajectory, &Case) -> Result<f64, EvaluationError> + Send + Sync>;

/// One weighted scoring dimension. The scorer is a pure function of the
/// trajectory and its case; results are clamped to [0, 1] before weighting.
pub struct RubricCriterion {
    pub name: String,
    pub weight: f64,
    pub description: String,
    scorer: ScoreFn,
}

impl fmt::Debug for RubricCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RubricCriterion")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

impl RubricCriterion {
    pub fn new(
        name: impl Into<String>,
        weight: f64,
        scorer: impl Fn(&Trajectory, &Case) -> Result<f64, EvaluationError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            weight: weight.max(0.0),
            description: String::new(),
            scorer: Box::new(scorer),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn score(&self, trajectory: &Trajectory, case: &Case) -> Result<f64, EvaluationError> {
        (self.scorer)(trajectory, case).map(|s| s.clamp(0.0, 1.0))
    }

    /// All schema-valid tool calls, or zero on the first invalid one.
    pub fn schema_validity(weight: f64) -> Self {
        Self::new("schema_validity", weight, |trajectory, _| {
            let all_valid = trajectory.turns.iter().all(|turn| match &turn.kind {
                TurnKind::ToolResult { valid, .. } => *valid,
                _ => true,
            });
            Ok(if all_valid { 1.0 } else { 0.0 })
        })
        .with_description("every tool call passed name and schema validation")
    }

    pub fn required_tool(weight: f64, tool: impl Into<String>) -> Self {
        let tool = tool.into();
        Self::new(format!("required_tool_{tool}"), weight, move |trajectory, _| {
            let called = trajectory.tool_calls().any(|(name, _)| name == tool);
            Ok(if called { 1.0 } else { 0.0 })
        })
    }

    /// The named tool must be consulted before the agent first asserts the
    /// given phrase. An assertion with no prior call scores zero; no
    /// assertion at all falls back to plain tool presence.
    pub fn required_tool_before_assertion(
        weight: f64,
        tool: impl Into<String>,
        assertion: impl Into<String>,
    ) -> Self {
        let tool = tool.into();
        let assertion = assertion.into();
        Self::new(
            format!("required_tool_{tool}_before_assertion"),
            weight,
            move |trajectory, _| {
                let mut tool_seen = false;
                for turn in &trajectory.turns {
                    match &turn.kind {
                        TurnKind::AgentToolCall { tool: name, .. } if name == &tool => {
                            tool_seen = true;
                        }
                        TurnKind::AgentMessage { text } if text.contains(&assertion) => {
                            return Ok(if tool_seen { 1.0 } else { 0.0 });
                        }
                        _ => {}
                    }
                }
                Ok(if tool_seen { 1.0 } else { 0.0 })
            },
        )
    }

    pub fn allowed_tools(weight: f64, allowed: impl IntoIterator<Item = String>) -> Self {
        let allowed: BTreeSet<String> = allowed.into_iter().collect();
        Self::new("allowed_tools", weight, move |trajectory, _| {
            let all_allowed = trajectory
                .tool_calls()
                .all(|(name, _)| allowed.contains(name));
            Ok(if all_allowed { 1.0 } else { 0.0 })
        })
    }

    pub fn forbidden_tools(weight: f64, forbidden: impl IntoIterator<Item = String>) -> Self {
        let forbidden: BTreeSet<String> = forbidden.into_iter().collect();
        Self::new("forbidden_tools", weight, move |trajectory, _| {
            let hit = trajectory
                .tool_calls()
                .any(|(name, _)| forbidden.contains(name));
            Ok(if hit { 0.0 } else { 1.0 })
        })
    }

    /// Linear penalty for calls beyond the expected count.
    pub fn efficiency(weight: f64, expected_calls: usize) -> Self {
        Self::new("efficiency", weight, move |trajectory, _| {
            let calls = trajectory.tool_calls().count();
            let extra = calls.saturating_sub(expected_calls);
            if extra == 0 {
                Ok(1.0)
            } else {
                Ok((1.0 - extra as f64 / expected_calls.max(1) as f64).max(0.0))
            }
        })
    }

    pub fn final_contains(weight: f64, needles: Vec<String>) -> Self {
        Self::new("final_contains", weight, move |trajectory, _| {
            let answer = trajectory.last_agent_message().ok_or_else(|| {
                EvaluationError::MissingInput("trajectory has no agent message".to_string())
            })?;
            let hit = needles.iter().all(|needle| answer.contains(needle));
            Ok(if hit { 1.0 } else { 0.0 })
        })
    }

    /// Final agent message must contain the case's reference conclusion.
    pub fn matches_reference_conclusion(weight: f64) -> Self {
        Self::new("reference_conclusion", weight, |trajectory, case| {
            let reference = case.reference_conclusion.as_deref().ok_or_else(|| {
                EvaluationError::MissingInput("case has no reference conclusion".to_string())
            })?;
            let answer = trajectory.last_agent_message().ok_or_else(|| {
                EvaluationError::MissingInput("trajectory has no agent message".to_string())
            })?;
            Ok(if answer.contains(reference) { 1.0 } else { 0.0 })
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionScore {
    pub name: String,
    pub weight: f64,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub case_id: String,
    pub criteria: Vec<CriterionScore>,
    /// Weighted total in [0, 1], normalized over the rubric's weight mass.
    pub total: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultAttribution>,
}

/// Applies a rubric to a finished trajectory. A failing criterion records a
/// zero score with its error string; scoring itself never fails.
pub struct Evaluator {
    rubric: Vec<RubricCriterion>,
}

impl Evaluator {
    pub fn new(rubric: Vec<RubricCriterion>) -> Self {
        Self { rubric }
    }

    pub fn score(&self, trajectory: &Trajectory, case: &Case) -> EvaluationResult {
        let mut criteria = Vec::with_capacity(self.rubric.len());
        let mut weighted = 0.0;
        let mut weight_mass = 0.0;

        for criterion in &self.rubric {
            let (score, error) = match criterion.score(trajectory, case) {
                Ok(score) => (score, None),
                Err(error) => {
                    tracing::debug!(
                        case = %trajectory.case_id,
                        criterion = %criterion.name,
                        %error,
                        "criterion failed, scoring zero"
                    );
                    (0.0, Some(error.to_string()))
                }
            };

            weighted += criterion.weight * score;
            weight_mass += criterion.weight;
            criteria.push(CriterionScore {
                name: criterion.name.clone(),
                weight: criterion.weight,
                score,
                error,
            });
        }

        let total = if weight_mass > 0.0 {
            weighted / weight_mass
        } else {
            0.0
        };

        EvaluationResult {
            case_id: trajectory.case_id.clone(),
            criteria,
            total,
            fault: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsibleActor {
    User,
    Agent,
    Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultType {
    GoalPartiallyCompleted,
    UsedWrongTool,
    UsedWrongToolArgument,
    TookUnintendedAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultAttribution {
    pub responsible_actor: ResponsibleActor,
    pub fault_type: FaultType,
    pub justification: String,
}

const ATTRIBUTION_PROMPT: &str = "You review a finished clinician-patient \
dialogue in which the clinician could call diagnostic tools. Decide which \
actor is most responsible for the conversation falling short of its goal and \
how. Respond with a single JSON object with fields `responsible_actor` (one \
of \"user\", \"agent\", \"environment\"), `fault_type` (one of \
\"goal_partially_completed\", \"used_wrong_tool\", \
\"used_wrong_tool_argument\", \"took_unintended_action\") and \
`justification` (one sentence).";

/// One generative judgment over a failed trajectory. Advisory only: any
/// backend or parse failure yields `None` and leaves the record unscathed.
pub struct FaultAttributor {
    provider: Arc<dyn LLMProvider>,
    model: String,
    timeout_ms: u64,
    retries: u32,
}

impl FaultAttributor {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            timeout_ms: 60_000,
            retries: 3,
        }
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub async fn attribute(
        &self,
        trajectory: &Trajectory,
        case: &Case,
    ) -> Option<FaultAttribution> {
        let transcript = render_transcript(trajectory);
        let user = format!(
            "Case goal:\n{}\n\nFinal status: {}\n\nTranscript:\n{}",
            case.initial_prompt,
            trajectory
                .status
                .map(|s| format!("{s:?}"))
                .unwrap_or_else(|| "unknown".to_string()),
            transcript,
        );

        let request = CompletionRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(ATTRIBUTION_PROMPT),
                ChatMessage::user(user),
            ],
        )
        .with_temperature(0.0);

        let response =
            match complete_with_retry(self.provider.as_ref(), &request, self.timeout_ms, self.retries)
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    tracing::debug!(case = %trajectory.case_id, %error, "fault attribution call failed");
                    return None;
                }
            };

        let content = response.message.text()?.to_string();
        let object = extract_json_object(&content)?;
        match serde_json::from_str::<FaultAttribution>(object) {
            Ok(attribution) => Some(attribution),
            Err(error) => {
                tracing::debug!(case = %trajectory.case_id, %error, "unparseable fault attribution");
                None
            }
        }
    }
}

fn render_transcript(trajectory: &Trajectory) -> String {
    let mut lines = Vec::with_capacity(trajectory.turns.len());
    for turn in &trajectory.turns {
        match &turn.kind {
            TurnKind::UserUtterance { text, .. } => lines.push(format!("Patient: {text}")),
            TurnKind::AgentMessage { text } => lines.push(format!("Clinician: {text}")),
            TurnKind::AgentToolCall { tool, arguments, .. } => {
                lines.push(format!("Clinician calls {tool}({arguments})"));
            }
            TurnKind::ToolResult { tool, payload, .. } => {
                lines.push(format!("Tool {tool} returned {payload}"));
            }
            TurnKind::SystemTermination { .. } => {}
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::ScriptedProvider;
    use crate::trajectory::TerminalStatus;

    fn marker_case() -> Case {
        Case::new("C1", "65-year-old with a persistent cough")
            .with_reference_conclusion("stage IIIA")
    }

    fn marker_trajectory() -> Trajectory {
        let mut trajectory = Trajectory::new("C1");
        trajectory.push(TurnKind::UserUtterance {
            text: "I have had a cough for a month.".to_string(),
            generative_calls: 0,
        });
        trajectory.push(TurnKind::AgentToolCall {
            call_id: Some("call_1".to_string()),
            tool: "get_tumor_markers".to_string(),
            arguments: serde_json::json!({}),
        });
        trajectory.push(TurnKind::ToolResult {
            call_id: Some("call_1".to_string()),
            tool: "get_tumor_markers".to_string(),
            payload: serde_json::json!({ "CEA": 8.5 }),
            valid: true,
        });
        trajectory.push(TurnKind::AgentMessage {
            text: "Markers are elevated; this is consistent with stage IIIA.".to_string(),
        });
        trajectory.finish(TerminalStatus::Completed, None);
        trajectory
    }

    fn rubric() -> Vec<RubricCriterion> {
        vec![
            RubricCriterion::schema_validity(1.0),
            RubricCriterion::required_tool_before_assertion(2.0, "get_tumor_markers", "stage"),
            RubricCriterion::efficiency(1.0, 1),
            RubricCriterion::matches_reference_conclusion(2.0),
        ]
    }

    #[test]
    fn weighted_total_is_normalized() {
        let result = Evaluator::new(rubric()).score(&marker_trajectory(), &marker_case());
        assert!((result.total - 1.0).abs() < 1e-9);
        assert_eq!(result.criteria.len(), 4);
        assert!(result.criteria.iter().all(|c| c.error.is_none()));
    }

    #[test]
    fn total_is_invariant_under_criteria_order() {
        let trajectory = marker_trajectory();
        let case = marker_case();

        let forward = Evaluator::new(rubric()).score(&trajectory, &case);
        let mut reversed = rubric();
        reversed.reverse();
        let backward = Evaluator::new(reversed).score(&trajectory, &case);

        assert!((forward.total - backward.total).abs() < 1e-9);
    }

    #[test]
    fn failing_criterion_scores_zero_and_records_error() {
        let case = Case::new("C2", "prompt");
        let mut trajectory = Trajectory::new("C2");
        trajectory.finish(TerminalStatus::AgentError, None);

        let rubric = vec![
            RubricCriterion::schema_validity(1.0),
            RubricCriterion::matches_reference_conclusion(1.0),
        ];
        let result = Evaluator::new(rubric).score(&trajectory, &case);

        let failing = &result.criteria[1];
        assert_eq!(failing.score, 0.0);
        assert!(failing.error.as_deref().unwrap().contains("reference conclusion"));
        assert!((result.total - 0.5).abs() < 1e-9);
    }

    #[test]
    fn assertion_without_prior_tool_call_scores_zero() {
        let mut trajectory = Trajectory::new("C3");
        trajectory.push(TurnKind::AgentMessage {
            text: "This is stage IV disease.".to_string(),
        });
        trajectory.finish(TerminalStatus::Completed, None);

        let criterion =
            RubricCriterion::required_tool_before_assertion(1.0, "get_tumor_markers", "stage");
        let result = Evaluator::new(vec![criterion]).score(&trajectory, &marker_case());
        assert_eq!(result.total, 0.0);
    }

    #[test]
    fn efficiency_penalizes_extra_calls() {
        let mut trajectory = marker_trajectory();
        // Rebuild with a second, redundant call.
        trajectory = {
            let mut t = Trajectory::new("C1");
            for turn in trajectory.turns.iter().take(3) {
                t.push(turn.kind.clone());
            }
            t.push(TurnKind::AgentToolCall {
                call_id: Some("call_3".to_string()),
                tool: "get_tumor_markers".to_string(),
                arguments: serde_json::json!({}),
            });
            t.push(TurnKind::ToolResult {
                call_id: Some("call_3".to_string()),
                tool: "get_tumor_markers".to_string(),
                payload: serde_json::json!({ "CEA": 8.5 }),
                valid: true,
            });
            t.finish(TerminalStatus::Completed, None);
            t
        };

        let result = Evaluator::new(vec![RubricCriterion::efficiency(1.0, 1)])
            .score(&trajectory, &marker_case());
        assert_eq!(result.total, 0.0);
    }

    #[test]
    fn forbidden_and_allowed_sets() {
        let trajectory = marker_trajectory();
        let case = marker_case();

        let allowed = Evaluator::new(vec![RubricCriterion::allowed_tools(
            1.0,
            vec!["get_tumor_markers".to_string()],
        )])
        .score(&trajectory, &case);
        assert_eq!(allowed.total, 1.0);

        let forbidden = Evaluator::new(vec![RubricCriterion::forbidden_tools(
            1.0,
            vec!["get_tumor_markers".to_string()],
        )])
        .score(&trajectory, &case);
        assert_eq!(forbidden.total, 0.0);
    }

    #[tokio::test]
    async fn fault_attribution_parses_mixed_content() {
        let provider = Arc::new(ScriptedProvider::from_texts(vec![
            "The agent misused the panel. {\"responsible_actor\": \"agent\", \
             \"fault_type\": \"used_wrong_tool\", \"justification\": \
             \"Called an imaging tool for a lab question.\"}"
                .to_string(),
        ]));
        let attributor = FaultAttributor::new(provider, "scripted");

        let fault = attributor
            .attribute(&marker_trajectory(), &marker_case())
            .await
            .expect("attribution");
        assert_eq!(fault.responsible_actor, ResponsibleActor::Agent);
        assert_eq!(fault.fault_type, FaultType::UsedWrongTool);
    }

    #[tokio::test]
    async fn unparseable_attribution_is_none() {
        let provider = Arc::new(ScriptedProvider::from_texts(vec![
            "I cannot decide.".to_string(),
        ]));
        let attributor = FaultAttributor::new(provider, "scripted");

        let fault = attributor
            .attribute(&marker_trajectory(), &marker_case())
            .await;
        assert!(fault.is_none());
    }
}

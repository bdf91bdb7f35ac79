use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    case::Case,
    error::ActorError,
    providers::{complete_with_retry, LLMProvider},
    types::{ChatMessage, CompletionRequest, MessageRole},
};

/// Sentinel the simulated user emits when the conversation is over.
pub const STOP_SENTINEL: &str = "###STOP###";

const REPLY_MARKER: &str = "Patient:";

/// Closed set of simulation strategies, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStrategy {
    /// One generative call conditioned on the hidden goal and history.
    Direct,
    /// One call that must produce a rationale before the utterance; only the
    /// utterance is exposed to the agent.
    ReasoningThenRespond,
    /// Candidate utterance plus a judging call; on rejection, regenerate once.
    SelfVerifying,
    /// Like SelfVerifying, but the rejection feedback is fed back into the
    /// regeneration prompt.
    SelfReflecting,
}

/// Outcome of one simulator turn. `generative_calls` counts utterance
/// generations only; verification judgments are structural overhead and do
/// not produce text that could appear in the trajectory.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedUtterance {
    Utterance { text: String, generative_calls: u32 },
    EndConversation { generative_calls: u32 },
}

pub struct UserSimulator {
    provider: Arc<dyn LLMProvider>,
    model: String,
    strategy: UserStrategy,
    max_regenerations: u32,
    timeout_ms: u64,
    retries: u32,
    temperature: Option<f32>,
}

impl UserSimulator {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
        strategy: UserStrategy,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            strategy,
            max_regenerations: 1,
            timeout_ms: 60_000,
            retries: 3,
            temperature: Some(0.7),
        }
    }

    pub fn with_max_regenerations(mut self, max: u32) -> Self {
        self.max_regenerations = max;
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

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn strategy(&self) -> UserStrategy {
        self.strategy
    }

    /// Produces the next user utterance for the dialogue so far. A fixed
    /// number of backend calls per strategy; backend failure after the retry
    /// budget surfaces as an `ActorError`, never a panic.
    pub async fn next_utterance(
        &self,
        case: &Case,
        history: &[ChatMessage],
    ) -> Result<SimulatedUtterance, ActorError> {
        let mut calls = 0u32;

        let text = match self.strategy {
            UserStrategy::Direct => {
                calls += 1;
                self.generate(case, history, None).await?
            }
            UserStrategy::ReasoningThenRespond => {
                calls += 1;
                let raw = self.generate_with_rationale(case, history).await?;
                extract_reply(&raw)
            }
            UserStrategy::SelfVerifying | UserStrategy::SelfReflecting => {
                calls += 1;
                let mut candidate = self.generate(case, history, None).await?;

                for _ in 0..self.max_regenerations {
                    match self.judge(case, history, &candidate).await? {
                        Verdict::Adequate => break,
                        Verdict::Inadequate(feedback) => {
                            calls += 1;
                            let hint = match self.strategy {
                                UserStrategy::SelfReflecting => Some(feedback),
                                _ => None,
                            };
                            candidate = self.generate(case, history, hint.as_deref()).await?;
                        }
                    }
                }

                candidate
            }
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ActorError::EmptyResponse);
        }

        if trimmed.contains(STOP_SENTINEL) {
            return Ok(SimulatedUtterance::EndConversation {
                generative_calls: calls,
            });
        }

        Ok(SimulatedUtterance::Utterance {
            text: trimmed.to_string(),
            generative_calls: calls,
        })
    }

    fn goal_prompt(&self, case: &Case) -> String {
        let mut prompt = format!(
            "You are role-playing the patient in a clinical consultation.\n\
             Your situation: {}\n",
            case.initial_prompt
        );

        if !case.metadata.is_empty() {
            let background: Vec<String> = case
                .metadata
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect();
            prompt.push_str(&format!("Background you know: {}\n", background.join(", ")));
        }

        prompt.push_str(&format!(
            "Answer the clinician's latest message in one or two sentences, in \
             character. Do not volunteer laboratory values or imaging findings a \
             patient would not know. When the clinician has delivered a final \
             recommendation and you have nothing further to ask, reply with \
             exactly {STOP_SENTINEL}."
        ));

        prompt
    }

    fn transcript(history: &[ChatMessage]) -> String {
        // The simulated user only sees user-visible dialogue, never tool traffic.
        let mut lines = Vec::new();
        for message in history {
            match message.role {
                MessageRole::User => {
                    if let Some(text) = message.text() {
                        lines.push(format!("Patient: {text}"));
                    }
                }
                MessageRole::Assistant => {
                    if let Some(text) = message.text() {
                        if !text.is_empty() {
                            lines.push(format!("Clinician: {text}"));
                        }
                    }
                }
                MessageRole::System | MessageRole::Tool => {}
            }
        }
        lines.join("\n")
    }

    async fn generate(
        &self,
        case: &Case,
        history: &[ChatMessage],
        reviewer_feedback: Option<&str>,
    ) -> Result<String, ActorError> {
        let mut user_prompt = format!(
            "Conversation so far:\n{}\n\nWrite the patient's next reply.",
            Self::transcript(history)
        );
        if let Some(feedback) = reviewer_feedback {
            user_prompt.push_str(&format!(
                "\n\nA reviewer rejected your previous draft: {feedback}\nWrite an improved reply."
            ));
        }

        let response = self.call(vec![
            ChatMessage::system(self.goal_prompt(case)),
            ChatMessage::user(user_prompt),
        ])
        .await?;
        Ok(response)
    }

    async fn generate_with_rationale(
        &self,
        case: &Case,
        history: &[ChatMessage],
    ) -> Result<String, ActorError> {
        let user_prompt = format!(
            "Conversation so far:\n{}\n\nFirst write your reasoning about what \
             the patient would say, prefixed with \"Thought:\". Then write the \
             reply itself on a new line prefixed with \"{REPLY_MARKER}\".",
            Self::transcript(history)
        );

        self.call(vec![
            ChatMessage::system(self.goal_prompt(case)),
            ChatMessage::user(user_prompt),
        ])
        .await
    }

    async fn judge(
        &self,
        case: &Case,
        history: &[ChatMessage],
        candidate: &str,
    ) -> Result<Verdict, ActorError> {
        let user_prompt = format!(
            "Scenario: {}\n\nConversation so far:\n{}\n\nCandidate patient reply:\n{candidate}\n\n\
             Does the candidate stay in character and move the consultation toward \
             the patient's goal? Answer with ADEQUATE or INADEQUATE followed by a \
             one-sentence reason.",
            case.initial_prompt,
            Self::transcript(history),
        );

        let response = self.call(vec![
            ChatMessage::system(
                "You review simulated patient replies for plausibility and goal fit.".to_string(),
            ),
            ChatMessage::user(user_prompt),
        ])
        .await?;

        let upper = response.to_uppercase();
        if upper.contains("INADEQUATE") {
            Ok(Verdict::Inadequate(response.trim().to_string()))
        } else {
            Ok(Verdict::Adequate)
        }
    }

    async fn call(&self, messages: Vec<ChatMessage>) -> Result<String, ActorError> {
        let mut request = CompletionRequest::new(self.model.clone(), messages);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }

        let response = complete_with_retry(
            self.provider.as_ref(),
            &request,
            self.timeout_ms,
            self.retries,
        )
        .await?;

        Ok(response.message.text().unwrap_or_default().to_string())
    }
}

enum Verdict {
    Adequate,
    Inadequate(String),
}

fn extract_reply(raw: &str) -> String {
    match raw.rfind(REPLY_MARKER) {
        Some(pos) => raw[pos + REPLY_MARKER.len()..].trim().to_string(),
        None => raw.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::ScriptedProvider;

    fn case() -> Case {
        Case::new("P1", "patient, 65, cough 1 month")
    }

    #[tokio::test]
    async fn direct_strategy_uses_one_call() {
        let provider = Arc::new(ScriptedProvider::from_texts(["The cough is worse at night."]));
        let simulator = UserSimulator::new(provider.clone(), "scripted", UserStrategy::Direct);

        let utterance = simulator
            .next_utterance(&case(), &[])
            .await
            .expect("utterance");
        match utterance {
            SimulatedUtterance::Utterance { text, generative_calls } => {
                assert_eq!(text, "The cough is worse at night.");
                assert_eq!(generative_calls, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test]
    async fn reasoning_strategy_hides_rationale() {
        let provider = Arc::new(ScriptedProvider::from_texts([
            "Thought: the clinician asked about smoking.\nPatient: I smoked for thirty years.",
        ]));
        let simulator =
            UserSimulator::new(provider, "scripted", UserStrategy::ReasoningThenRespond);

        let utterance = simulator
            .next_utterance(&case(), &[])
            .await
            .expect("utterance");
        match utterance {
            SimulatedUtterance::Utterance { text, generative_calls } => {
                assert_eq!(text, "I smoked for thirty years.");
                assert_eq!(generative_calls, 1);
                assert!(!text.contains("Thought"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn self_verifying_rejection_counts_two_generations() {
        let provider = Arc::new(ScriptedProvider::from_texts([
            "fine",
            "INADEQUATE: too terse to be believable",
            "It started about a month ago and has been getting worse.",
        ]));
        let simulator =
            UserSimulator::new(provider.clone(), "scripted", UserStrategy::SelfVerifying);

        let utterance = simulator
            .next_utterance(&case(), &[])
            .await
            .expect("utterance");
        match utterance {
            SimulatedUtterance::Utterance { text, generative_calls } => {
                assert_eq!(generative_calls, 2);
                assert_eq!(text, "It started about a month ago and has been getting worse.");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test]
    async fn self_verifying_acceptance_is_single_generation() {
        let provider = Arc::new(ScriptedProvider::from_texts([
            "It started about a month ago.",
            "ADEQUATE: plausible and on topic",
        ]));
        let simulator = UserSimulator::new(provider, "scripted", UserStrategy::SelfVerifying);

        let utterance = simulator
            .next_utterance(&case(), &[])
            .await
            .expect("utterance");
        match utterance {
            SimulatedUtterance::Utterance { generative_calls, .. } => {
                assert_eq!(generative_calls, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_sentinel_ends_conversation() {
        let provider = Arc::new(ScriptedProvider::from_texts([format!(
            "Thank you doctor. {STOP_SENTINEL}"
        )]));
        let simulator = UserSimulator::new(provider, "scripted", UserStrategy::Direct);

        let utterance = simulator
            .next_utterance(&case(), &[])
            .await
            .expect("utterance");
        assert!(matches!(utterance, SimulatedUtterance::EndConversation { .. }));
    }

    #[tokio::test]
    async fn backend_exhaustion_is_an_actor_error() {
        let provider = Arc::new(ScriptedProvider::from_texts(Vec::<String>::new()));
        let simulator = UserSimulator::new(provider, "scripted", UserStrategy::Direct)
            .with_retries(2)
            .with_timeout_ms(1_000);

        let err = simulator.next_utterance(&case(), &[]).await.unwrap_err();
        assert!(matches!(err, ActorError::RetriesExhausted { attempts: 2, .. }));
    }
}

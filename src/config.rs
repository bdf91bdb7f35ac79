use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::simulator::UserStrategy;

// Cues that an agent message is a final recommendation rather than a question
// back to the user. The original benchmark keyed on Chinese clinical phrasing;
// both vocabularies are kept so mixed-language agents terminate cleanly.
static RE_TERMINAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(recommend(?:ation)?s?|treatment\s+plan|management\s+plan|final\s+diagnosis|in\s+(?:summary|conclusion))\b|建议|推荐|治疗方案|诊疗方案|诊断|结论",
    )
    .expect("terminal cue regex is valid")
});

/// Decides whether a plain agent message ends the conversation or expects a
/// user reply. Deliberately configurable: the right cue set is domain-specific.
#[derive(Clone)]
pub struct TerminalPredicate(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl TerminalPredicate {
    pub fn new(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    pub fn is_terminal(&self, message: &str) -> bool {
        (self.0)(message)
    }
}

impl Default for TerminalPredicate {
    fn default() -> Self {
        Self::new(|message| RE_TERMINAL.is_match(message))
    }
}

impl fmt::Debug for TerminalPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TerminalPredicate")
    }
}

/// Run configuration threaded explicitly through the orchestrator and batch
/// runner. No process-wide singleton: concurrent batches with different
/// configurations can coexist.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Agent-visible turn budget per trajectory.
    pub max_agent_turns: usize,
    /// Consecutive invalid tool calls tolerated before `agent_error`.
    pub max_invalid_calls: u32,
    /// Timeout applied to every external actor call.
    pub actor_timeout_ms: u64,
    /// Transient-failure retry budget per actor call.
    pub actor_retries: u32,
    pub user_strategy: UserStrategy,
    /// When set, the user simulator produces the opening turn instead of the
    /// case's initial prompt being replayed verbatim.
    pub simulated_opening: bool,
    /// Maximum trajectories in flight at once.
    pub concurrency: usize,
    pub terminal_predicate: TerminalPredicate,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_agent_turns: 10,
            max_invalid_calls: 3,
            actor_timeout_ms: 60_000,
            actor_retries: 3,
            user_strategy: UserStrategy::Direct,
            simulated_opening: false,
            concurrency: 4,
            terminal_predicate: TerminalPredicate::default(),
        }
    }
}

impl RunConfig {
    pub fn with_max_agent_turns(mut self, turns: usize) -> Self {
        self.max_agent_turns = turns;
        self
    }

    pub fn with_max_invalid_calls(mut self, calls: u32) -> Self {
        self.max_invalid_calls = calls;
        self
    }

    pub fn with_actor_timeout_ms(mut self, ms: u64) -> Self {
        self.actor_timeout_ms = ms;
        self
    }

    pub fn with_actor_retries(mut self, retries: u32) -> Self {
        self.actor_retries = retries;
        self
    }

    pub fn with_user_strategy(mut self, strategy: UserStrategy) -> Self {
        self.user_strategy = strategy;
        self
    }

    pub fn with_simulated_opening(mut self, simulated: bool) -> Self {
        self.simulated_opening = simulated;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_terminal_predicate(mut self, predicate: TerminalPredicate) -> Self {
        self.terminal_predicate = predicate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_predicate_spots_recommendations() {
        let predicate = TerminalPredicate::default();
        assert!(predicate.is_terminal(
            "Based on the staging workup, my recommendation is concurrent chemoradiation."
        ));
        assert!(predicate.is_terminal("综合以上检查结果，治疗方案如下。"));
        assert!(!predicate.is_terminal("Could you tell me when the cough started?"));
    }

    #[test]
    fn predicate_is_replaceable() {
        let predicate = TerminalPredicate::new(|m| m.ends_with("DONE"));
        assert!(predicate.is_terminal("all set DONE"));
        assert!(!predicate.is_terminal("my recommendation is rest"));
    }
}

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::error::TargetError;

/// Identifies which model a stream update belongs to within a turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetId {
    Primary,
    Comparison(String),
}

impl TargetId {
    pub fn is_primary(&self) -> bool {
        matches!(self, TargetId::Primary)
    }

    pub fn comparison_key(&self) -> Option<&str> {
        match self {
            TargetId::Primary => None,
            TargetId::Comparison(key) => Some(key),
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetId::Primary => write!(f, "primary"),
            TargetId::Comparison(key) => write!(f, "comparison:{key}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Dispatching,
    Streaming,
    Settling,
}

/// Per-target bookkeeping within a turn.
#[derive(Debug, Clone)]
pub struct TargetState {
    pub request_id: String,
    pub attempt: u8,
    pub settled: bool,
    pub error: Option<TargetError>,
    /// Conversation id reported on this target's stream; for comparison
    /// targets it becomes the linked conversation on first success.
    pub conversation_id: Option<String>,
}

/// One user submission and every in-flight model response it produced. All
/// targets share one cancellation token; the turn id correlates late events
/// and stop requests.
#[derive(Debug)]
pub struct Turn {
    pub id: u64,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub cancel: CancellationToken,
    pub phase: TurnPhase,
    pub targets: HashMap<TargetId, TargetState>,
    pub token_rate: TokenRate,
}

impl Turn {
    pub fn new(id: u64, user_message_id: String, assistant_message_id: String) -> Self {
        Self {
            id,
            user_message_id,
            assistant_message_id,
            cancel: CancellationToken::new(),
            phase: TurnPhase::Dispatching,
            targets: HashMap::new(),
            token_rate: TokenRate::new(),
        }
    }

    /// Register a target for dispatch, minting its request id. Re-registering
    /// an existing target renews the request id and bumps the attempt count
    /// (the non-streaming retry path).
    pub fn register_target(&mut self, target: TargetId) -> String {
        let request_id = Uuid::new_v4().to_string();
        match self.targets.get_mut(&target) {
            Some(state) => {
                state.request_id = request_id.clone();
                state.attempt += 1;
                state.settled = false;
            }
            None => {
                self.targets.insert(
                    target,
                    TargetState {
                        request_id: request_id.clone(),
                        attempt: 1,
                        settled: false,
                        error: None,
                        conversation_id: None,
                    },
                );
            }
        }
        request_id
    }

    pub fn target(&self, target: &TargetId) -> Option<&TargetState> {
        self.targets.get(target)
    }

    pub fn target_mut(&mut self, target: &TargetId) -> Option<&mut TargetState> {
        self.targets.get_mut(target)
    }

    pub fn settle_target(&mut self, target: &TargetId, error: Option<TargetError>) {
        if let Some(state) = self.targets.get_mut(target) {
            state.settled = true;
            state.error = error;
        }
    }

    pub fn is_settled(&self) -> bool {
        !self.targets.is_empty() && self.targets.values().all(|state| state.settled)
    }

    pub fn unsettled_request_ids(&self) -> Vec<String> {
        self.targets
            .values()
            .filter(|state| !state.settled)
            .map(|state| state.request_id.clone())
            .collect()
    }
}

/// Throughput tracking for the primary response. Estimates from streamed
/// characters until a usage event reports the real completion-token count.
#[derive(Debug)]
pub struct TokenRate {
    started: Instant,
    chars: usize,
    completion_tokens: Option<u64>,
}

// Rough chars-per-token ratio for the streaming estimate.
const ESTIMATED_CHARS_PER_TOKEN: f64 = 4.0;

impl TokenRate {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            chars: 0,
            completion_tokens: None,
        }
    }

    pub fn observe_chars(&mut self, count: usize) {
        self.chars += count;
    }

    /// Switch from the character-based estimate to the reported count.
    pub fn finalize(&mut self, completion_tokens: u64) {
        self.completion_tokens = Some(completion_tokens);
    }

    pub fn tokens(&self) -> f64 {
        match self.completion_tokens {
            Some(tokens) => tokens as f64,
            None => self.chars as f64 / ESTIMATED_CHARS_PER_TOKEN,
        }
    }

    pub fn tokens_per_second(&self) -> Option<f64> {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(self.tokens() / elapsed)
    }
}

impl Default for TokenRate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_settles_when_every_target_has_settled() {
        let mut turn = Turn::new(1, "user-1".to_string(), "assistant-1".to_string());
        assert!(!turn.is_settled());

        turn.register_target(TargetId::Primary);
        turn.register_target(TargetId::Comparison("p::b".to_string()));
        assert!(!turn.is_settled());

        turn.settle_target(&TargetId::Primary, None);
        assert!(!turn.is_settled());
        turn.settle_target(&TargetId::Comparison("p::b".to_string()), None);
        assert!(turn.is_settled());
    }

    #[test]
    fn re_registering_renews_request_and_bumps_attempt() {
        let mut turn = Turn::new(1, "user-1".to_string(), "assistant-1".to_string());
        let first = turn.register_target(TargetId::Primary);
        let second = turn.register_target(TargetId::Primary);

        assert_ne!(first, second);
        let state = turn.target(&TargetId::Primary).expect("primary state");
        assert_eq!(state.attempt, 2);
        assert!(!state.settled);
    }

    #[test]
    fn token_rate_switches_to_reported_count() {
        let mut rate = TokenRate::new();
        rate.observe_chars(400);
        assert_eq!(rate.tokens(), 100.0);

        rate.finalize(37);
        assert_eq!(rate.tokens(), 37.0);
    }
}

//! Per-turn token usage as reported by the model API.
//!
//! The context manager works on estimates. The tracker records what the API
//! actually billed each turn, which gives an average turn size and a rough
//! count of turns left before the window fills.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Usage for one completed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnUsage {
    /// 1-based.
    pub turn: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// Set when a compaction was applied during this turn.
    pub compacted: bool,
    pub recorded_at: DateTime<Utc>,
}

impl TurnUsage {
    pub fn total_tokens(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Default)]
pub struct TurnTracker {
    turns: Vec<TurnUsage>,
    total_tokens: usize,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_turn(&mut self, input_tokens: usize, output_tokens: usize) {
        let turn = TurnUsage {
            turn: self.turns.len() + 1,
            input_tokens,
            output_tokens,
            compacted: false,
            recorded_at: Utc::now(),
        };
        self.total_tokens += turn.total_tokens();
        self.turns.push(turn);
    }

    /// Mark the most recent turn as compacted. No-op before the first turn.
    pub fn record_compaction(&mut self) {
        if let Some(last) = self.turns.last_mut() {
            last.compacted = true;
        }
    }

    pub fn turns(&self) -> &[TurnUsage] {
        &self.turns
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn average_turn_size(&self) -> usize {
        if self.turns.is_empty() {
            0
        } else {
            self.total_tokens / self.turns.len()
        }
    }

    /// Turns of average size that still fit in `window - reserved`.
    /// Zero before the first turn.
    pub fn estimate_remaining_turns(&self, window: usize, reserved: usize) -> usize {
        let average = self.average_turn_size();
        if average == 0 {
            return 0;
        }
        window
            .saturating_sub(reserved)
            .saturating_sub(self.total_tokens)
            / average
    }
}

//! The per-session conversation window.
//!
//! [`ContextManager`] owns the ordered item sequence and its token total.
//! It never calls the compaction engine itself: when usage reaches the
//! threshold, [`add_item`](ContextManager::add_item) still appends the item
//! and returns [`AddOutcome::CompactionRequired`]; the caller runs
//! compaction and hands the result back through
//! [`apply_compaction`](ContextManager::apply_compaction).
//!
//! The threshold is inclusive: with a 100 000 token window and a 0.70 ratio,
//! an append that brings usage (conversation plus instruction overhead) to
//! exactly 70 000 tokens signals.

use std::borrow::Cow;
use std::collections::HashSet;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::audit::{AuditEntry, AuditTrail, CompactionRecord};
use super::item::{CompactionSummary, ConversationItem, Role};
use super::truncate::OutputTruncator;
use crate::config::ContextConfig;
use crate::error::ContextError;
use crate::instructions::InstructionTrim;

/// Default context window in tokens.
pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

/// Default fraction of the window at which compaction is required.
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.70;

/// Fraction of the window held back for the model's reply when reporting
/// available tokens.
pub const OUTPUT_RESERVE_FRACTION: f64 = 0.10;

// ── Usage ──────────────────────────────────────────────────────────

/// Token usage at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContextUsage {
    /// Sum of `estimated_tokens` over the conversation items.
    pub cumulative_tokens: usize,
    /// Fixed overhead of the merged instructions.
    pub instruction_tokens: usize,
    pub model_context_window: usize,
    /// `(cumulative_tokens + instruction_tokens) / model_context_window`.
    pub ratio: f64,
    /// Window minus the output reserve minus usage, floored at zero.
    pub available_tokens: usize,
}

impl ContextUsage {
    /// Conversation plus instruction tokens.
    pub fn used_tokens(&self) -> usize {
        self.cumulative_tokens + self.instruction_tokens
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {}), {} available",
            self.used_tokens(),
            self.ratio * 100.0,
            self.model_context_window,
            self.available_tokens,
        )
    }
}

/// Read-only snapshot for a status line or telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    #[serde(flatten)]
    pub usage: ContextUsage,
    pub item_count: usize,
    pub compactions: usize,
    /// Truncations since the last user item.
    pub truncations_last_turn: usize,
    pub truncations_total: usize,
}

impl UsageSnapshot {
    pub fn to_log_string(&self) -> String {
        format!(
            "{} | {} items, {} compactions, {} truncations ({} this turn)",
            self.usage.to_log_string(),
            self.item_count,
            self.compactions,
            self.truncations_total,
            self.truncations_last_turn,
        )
    }
}

/// Result of [`ContextManager::add_item`]. The item is appended either way.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum AddOutcome {
    Accepted,
    /// Usage is at or over the threshold; compact before the next turn.
    CompactionRequired { usage: ContextUsage },
}

impl AddOutcome {
    pub fn compaction_required(&self) -> bool {
        matches!(self, AddOutcome::CompactionRequired { .. })
    }
}

/// What [`ContextManager::apply_compaction`] changed.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionApplied {
    pub record: CompactionRecord,
    pub usage: ContextUsage,
}

// ── Manager ────────────────────────────────────────────────────────

/// Conversation state for one session.
///
/// Single writer: wrap it in a lock (see [`Session`](crate::session::Session))
/// when more than one task can reach it.
#[derive(Debug, Clone)]
pub struct ContextManager {
    items: Vec<ConversationItem>,
    cumulative_tokens: usize,
    model_context_window: usize,
    threshold_ratio: f64,
    instruction_tokens: usize,
    truncator: OutputTruncator,
    truncate_tool_results: bool,
    audit: AuditTrail,
    turn: u64,
    compactions: usize,
    truncations_total: usize,
    truncations_this_turn: usize,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_WINDOW)
    }
}

impl ContextManager {
    /// Create an empty manager for a model with the given window.
    pub fn new(model_context_window: usize) -> Self {
        Self {
            items: Vec::new(),
            cumulative_tokens: 0,
            model_context_window,
            threshold_ratio: DEFAULT_COMPACTION_THRESHOLD,
            instruction_tokens: 0,
            truncator: OutputTruncator::default(),
            truncate_tool_results: true,
            audit: AuditTrail::new(),
            turn: 0,
            compactions: 0,
            truncations_total: 0,
            truncations_this_turn: 0,
        }
    }

    /// Build a manager from a validated config.
    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.model_context_window)
            .with_threshold_ratio(config.compaction_threshold_ratio)
            .with_truncator(
                OutputTruncator::new(config.output_limit_bytes)
                    .with_head_fraction(config.truncation_head_fraction),
            )
            .with_tool_result_truncation(config.truncate_tool_results)
    }

    pub fn with_threshold_ratio(mut self, ratio: f64) -> Self {
        self.threshold_ratio = ratio;
        self
    }

    pub fn with_truncator(mut self, truncator: OutputTruncator) -> Self {
        self.truncator = truncator;
        self
    }

    /// Enable or disable truncation of tool results on append.
    pub fn with_tool_result_truncation(mut self, enabled: bool) -> Self {
        self.truncate_tool_results = enabled;
        self
    }

    /// Set the fixed instruction overhead counted toward the threshold.
    pub fn with_instruction_tokens(mut self, tokens: usize) -> Self {
        self.instruction_tokens = tokens;
        self
    }

    pub fn set_instruction_tokens(&mut self, tokens: usize) {
        self.instruction_tokens = tokens;
    }

    /// Record instruction trims in this session's audit trail.
    pub fn record_instruction_trims(&mut self, trims: &[InstructionTrim]) {
        for trim in trims {
            self.audit.push(AuditEntry::InstructionTrim(trim.clone()));
        }
    }

    // ── Queries ──

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cumulative_tokens(&self) -> usize {
        self.cumulative_tokens
    }

    pub fn model_context_window(&self) -> usize {
        self.model_context_window
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Smallest usage (in tokens) that counts as reaching the threshold.
    pub fn threshold_tokens(&self) -> usize {
        // The epsilon keeps 100_000 * 0.7 at 70_000 despite float error.
        ((self.model_context_window as f64) * self.threshold_ratio - 1e-9)
            .ceil()
            .max(0.0) as usize
    }

    /// Sum of `estimated_tokens` over `first..=last`, if the range is valid.
    pub fn range_tokens(&self, first: usize, last: usize) -> Option<usize> {
        if first > last || last >= self.items.len() {
            return None;
        }
        Some(
            self.items[first..=last]
                .iter()
                .map(|i| i.estimated_tokens)
                .sum(),
        )
    }

    pub fn current_usage(&self) -> ContextUsage {
        let used = self.cumulative_tokens + self.instruction_tokens;
        let ratio = if self.model_context_window > 0 {
            used as f64 / self.model_context_window as f64
        } else {
            1.0
        };
        let reserve = ((self.model_context_window as f64) * OUTPUT_RESERVE_FRACTION) as usize;
        ContextUsage {
            cumulative_tokens: self.cumulative_tokens,
            instruction_tokens: self.instruction_tokens,
            model_context_window: self.model_context_window,
            ratio,
            available_tokens: self
                .model_context_window
                .saturating_sub(reserve)
                .saturating_sub(used),
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            usage: self.current_usage(),
            item_count: self.items.len(),
            compactions: self.compactions,
            truncations_last_turn: self.truncations_this_turn,
            truncations_total: self.truncations_total,
        }
    }

    // ── Mutators ──

    /// Append an item and report whether compaction is now required.
    ///
    /// Tool results over the output limit are truncated first (when enabled)
    /// and the truncation is recorded in the audit trail.
    pub fn add_item(&mut self, mut item: ConversationItem) -> AddOutcome {
        if item.role == Role::User {
            self.turn += 1;
            self.truncations_this_turn = 0;
        }
        item.created_at = self.turn;

        if self.truncate_tool_results && item.role == Role::ToolResult {
            let truncated = match self.truncator.truncate(&item.content) {
                (Cow::Owned(content), Some(record)) => Some((content, record)),
                _ => None,
            };
            if let Some((content, record)) = truncated {
                debug!(
                    tool_call_id = item.tool_call_id.as_deref().unwrap_or("-"),
                    "{}",
                    record.to_log_string()
                );
                item.content = content;
                item.truncated = true;
                item.reestimate();
                self.truncations_total += 1;
                self.truncations_this_turn += 1;
                self.audit.push(AuditEntry::Truncation {
                    tool_call_id: item.tool_call_id.clone(),
                    record,
                });
            }
        }

        if item.role.is_tool() && item.tool_call_id.is_none() {
            warn!(role = %item.role, "tool item appended without a tool_call_id");
        } else if item.role == Role::ToolResult {
            let paired = item.tool_call_id.as_deref().is_some_and(|id| {
                self.items
                    .iter()
                    .any(|i| i.role == Role::ToolCall && i.tool_call_id.as_deref() == Some(id))
            });
            if !paired {
                warn!(
                    tool_call_id = item.tool_call_id.as_deref().unwrap_or("-"),
                    "tool result appended without a matching tool call"
                );
            }
        }

        self.cumulative_tokens += item.estimated_tokens;
        self.items.push(item);

        let usage = self.current_usage();
        if usage.used_tokens() >= self.threshold_tokens() {
            info!("compaction threshold reached: {}", usage.to_log_string());
            AddOutcome::CompactionRequired { usage }
        } else {
            AddOutcome::Accepted
        }
    }

    /// Replace `summary.first_index..=summary.last_index` with one summary
    /// item, then drop tool items whose partner no longer exists.
    ///
    /// All checks run before anything changes; on error the conversation is
    /// untouched.
    pub fn apply_compaction(
        &mut self,
        summary: &CompactionSummary,
    ) -> Result<CompactionApplied, ContextError> {
        let (first, last) = (summary.first_index, summary.last_index);
        let actual = self
            .range_tokens(first, last)
            .ok_or(ContextError::InvalidRange {
                first,
                last,
                len: self.items.len(),
            })?;
        if actual != summary.original_tokens {
            return Err(ContextError::StaleSummary {
                first,
                last,
                expected: summary.original_tokens,
                actual,
            });
        }
        if summary.summary_tokens >= summary.original_tokens {
            return Err(ContextError::SummaryNotSmaller {
                summary_tokens: summary.summary_tokens,
                original_tokens: summary.original_tokens,
            });
        }

        let mut summary_item = summary.to_item();
        summary_item.created_at = self.items[last].created_at;

        let tail = self.items.split_off(last + 1);
        let replaced: Vec<ConversationItem> = self.items.drain(first..).collect();
        let removed_ids: HashSet<String> = replaced
            .iter()
            .filter_map(|i| i.pairing_id().map(str::to_string))
            .collect();

        self.items.push(summary_item);
        self.items.extend(tail);
        let dropped_orphans = self.drop_orphans(&removed_ids);

        self.cumulative_tokens = self.items.iter().map(|i| i.estimated_tokens).sum();
        self.compactions += 1;

        let record = CompactionRecord {
            first_index: first,
            last_index: last,
            replaced_items: replaced.len(),
            original_tokens: summary.original_tokens,
            summary_tokens: summary.summary_tokens,
            dropped_orphans,
            created_at: Utc::now(),
        };
        self.audit.push(AuditEntry::Compaction(record.clone()));

        let usage = self.current_usage();
        info!(
            first,
            last,
            dropped_orphans,
            "compaction applied: {} -> {} tokens; {}",
            summary.original_tokens,
            summary.summary_tokens,
            usage.to_log_string()
        );
        Ok(CompactionApplied { record, usage })
    }

    /// Among the tool items that shared an id with the replaced range, remove
    /// those whose partner is gone. Items whose id was not in the range are
    /// never touched; a call still waiting for its result is kept.
    fn drop_orphans(&mut self, removed_ids: &HashSet<String>) -> usize {
        let present = |role: Role| -> HashSet<String> {
            self.items
                .iter()
                .filter(|i| i.role == role)
                .filter_map(|i| i.tool_call_id.clone())
                .filter(|id| removed_ids.contains(id))
                .collect()
        };
        let calls = present(Role::ToolCall);
        let results = present(Role::ToolResult);

        let before = self.items.len();
        self.items.retain(|item| {
            let Some(id) = item.pairing_id().filter(|id| removed_ids.contains(*id)) else {
                return true;
            };
            match item.role {
                Role::ToolResult => calls.contains(id),
                Role::ToolCall => results.contains(id),
                Role::User | Role::Assistant | Role::Summary => true,
            }
        });
        let dropped = before - self.items.len();
        if dropped > 0 {
            warn!(dropped, "dropped orphaned tool items after compaction");
        }
        dropped
    }
}

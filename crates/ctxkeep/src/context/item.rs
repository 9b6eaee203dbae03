//! Conversation items and the compaction summary that replaces them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::estimator::estimate_tokens;
use crate::error::ContextError;

// ── Roles ──────────────────────────────────────────────────────────

/// Role of an item in the conversation.
///
/// Closed set: pairing and summary checks in the context manager match on
/// it exhaustively.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    /// A model request to run a tool. Carries a `tool_call_id`.
    ToolCall,
    /// The output of a tool run. Carries the `tool_call_id` of its call.
    ToolResult,
    /// A compaction summary standing in for a replaced range.
    Summary,
}

impl Role {
    /// Whether items of this role must carry a `tool_call_id`.
    pub fn is_tool(self) -> bool {
        matches!(self, Role::ToolCall | Role::ToolResult)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::ToolCall => write!(f, "tool_call"),
            Role::ToolResult => write!(f, "tool_result"),
            Role::Summary => write!(f, "summary"),
        }
    }
}

// ── Items ──────────────────────────────────────────────────────────

/// One unit of dialogue history.
///
/// Deserialization rejects tool calls and tool results without a
/// `tool_call_id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(try_from = "RawItem")]
pub struct ConversationItem {
    pub role: Role,
    pub content: String,
    /// Token estimate for `content`. Filled by the constructors.
    #[serde(default)]
    pub estimated_tokens: usize,
    /// Logical turn index, assigned by the context manager on append.
    #[serde(default)]
    pub created_at: u64,
    /// Whether `content` was cut by the output truncator.
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Wire shape of [`ConversationItem`] before validation.
#[derive(Deserialize)]
struct RawItem {
    role: Role,
    content: String,
    #[serde(default)]
    estimated_tokens: usize,
    #[serde(default)]
    created_at: u64,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    tool_call_id: Option<String>,
}

impl TryFrom<RawItem> for ConversationItem {
    type Error = ContextError;

    fn try_from(raw: RawItem) -> Result<Self, Self::Error> {
        let item = Self {
            role: raw.role,
            content: raw.content,
            estimated_tokens: raw.estimated_tokens,
            created_at: raw.created_at,
            truncated: raw.truncated,
            tool_call_id: raw.tool_call_id,
        };
        item.validate()?;
        Ok(item)
    }
}

impl ConversationItem {
    fn new(role: Role, content: String, tool_call_id: Option<String>) -> Self {
        Self {
            role,
            estimated_tokens: estimate_tokens(&content),
            content,
            created_at: 0,
            truncated: false,
            tool_call_id,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into(), None)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into(), None)
    }

    /// A tool invocation. `content` is the serialized call (name + arguments).
    pub fn tool_call(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::ToolCall, content.into(), Some(id.into()))
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::ToolResult, content.into(), Some(id.into()))
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Self::new(Role::Summary, content.into(), None)
    }

    /// Override the token estimate (e.g. with a count reported by the API).
    pub fn with_estimated_tokens(mut self, tokens: usize) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    /// Recompute `estimated_tokens` from the current content.
    pub fn reestimate(&mut self) {
        self.estimated_tokens = estimate_tokens(&self.content);
    }

    /// Tool calls and tool results must carry a `tool_call_id`.
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.role.is_tool() && self.tool_call_id.is_none() {
            return Err(ContextError::MissingToolCallId { role: self.role });
        }
        Ok(())
    }

    /// The pairing id, only for tool calls and tool results.
    pub fn pairing_id(&self) -> Option<&str> {
        if self.role.is_tool() {
            self.tool_call_id.as_deref()
        } else {
            None
        }
    }
}

// ── Compaction summary ─────────────────────────────────────────────

/// Replacement for an inclusive range of items, produced by the
/// [`CompactionEngine`](super::compaction::CompactionEngine) and applied by
/// [`ContextManager::apply_compaction`](super::manager::ContextManager::apply_compaction).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CompactionSummary {
    pub text: String,
    pub summary_tokens: usize,
    /// First replaced index (inclusive).
    pub first_index: usize,
    /// Last replaced index (inclusive).
    pub last_index: usize,
    /// Sum of `estimated_tokens` over the replaced range when the summary
    /// was computed.
    pub original_tokens: usize,
    pub created_at: DateTime<Utc>,
}

impl CompactionSummary {
    /// Build a summary for `first..=last`, estimating its own token count.
    pub fn new(
        text: impl Into<String>,
        first_index: usize,
        last_index: usize,
        original_tokens: usize,
    ) -> Self {
        let text = text.into();
        Self {
            summary_tokens: estimate_tokens(&text),
            text,
            first_index,
            last_index,
            original_tokens,
            created_at: Utc::now(),
        }
    }

    /// Number of items the summary replaces.
    pub fn replaced_items(&self) -> usize {
        self.last_index.saturating_sub(self.first_index) + 1
    }

    /// `original_tokens / summary_tokens`.
    pub fn compression_ratio(&self) -> f64 {
        if self.summary_tokens == 0 {
            return f64::INFINITY;
        }
        self.original_tokens as f64 / self.summary_tokens as f64
    }

    /// The item that takes the range's place in the conversation.
    pub fn to_item(&self) -> ConversationItem {
        ConversationItem::summary(self.text.clone()).with_estimated_tokens(self.summary_tokens)
    }
}

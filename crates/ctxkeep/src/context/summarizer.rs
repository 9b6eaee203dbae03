//! Summarization backends for compaction.
//!
//! A [`SummaryBackend`] turns a [`SummaryRequest`] (a rendered transcript of
//! the range being compacted, plus any earlier summary it absorbs) into
//! summary text. Two backends ship with the crate:
//!
//! - [`ExtractiveSummarizer`]: deterministic and model-free. Keeps the task
//!   statement and the most recent events, one line each, within the token
//!   budget. Used by the CLI and tests, and as a fallback when no model is
//!   configured.
//! - [`OpenRouterSummarizer`](crate::api::openrouter::OpenRouterSummarizer):
//!   one chat-completions call with [`SUMMARIZATION_PROMPT`].
//!
//! Earlier summaries inside the range are passed separately as
//! `existing_summary` so repeated compactions merge into one summary instead
//! of nesting.

use std::future::Future;
use std::pin::Pin;

use super::estimator::estimate_tokens;
use super::item::{ConversationItem, Role};
use crate::error::SummaryError;

/// System prompt for model-backed summarization.
pub const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation between a user and a coding agent. The summary \
replaces these messages in the agent's context, so it must let the agent continue the \
task without them. Focus on:
- The user's task and any constraints they stated
- What was accomplished (completed subtasks, files modified)
- Decisions made and failed approaches (what was tried and why it failed)
- Key facts from tool results: file paths, function names, error messages
- What remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- Stay within the token budget given at the end of the input.
- If there is an existing summary, merge the new information into it to produce a single \
  cohesive summary. The result replaces the existing one entirely.";

/// Boxed future returned by [`SummaryBackend::summarize`].
pub type SummaryFuture<'a> = Pin<Box<dyn Future<Output = Result<String, SummaryError>> + Send + 'a>>;

/// Input for one summarization call.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRequest {
    pub system_prompt: String,
    /// The range rendered as `[role]: content` blocks, summaries excluded.
    pub transcript: String,
    /// Budget the summary should stay within.
    pub target_tokens: usize,
    /// Text of summary items inside the range, joined.
    pub existing_summary: Option<String>,
    /// Extra instructions (e.g. a `## Compaction Instructions` section).
    pub guidance: Option<String>,
    /// The range's non-summary items, for backends that work on structure.
    pub items: Vec<ConversationItem>,
}

impl SummaryRequest {
    /// Render a request for `items` with the default prompt.
    pub fn build(items: &[ConversationItem], target_tokens: usize, guidance: Option<&str>) -> Self {
        let mut transcript = String::new();
        let mut existing = Vec::new();
        let mut kept = Vec::with_capacity(items.len());

        for item in items {
            if item.role == Role::Summary {
                existing.push(item.content.as_str());
                continue;
            }
            match item.tool_call_id.as_deref() {
                Some(id) => transcript.push_str(&format!("[{} {id}]: {}\n\n", item.role, item.content)),
                None => transcript.push_str(&format!("[{}]: {}\n\n", item.role, item.content)),
            }
            kept.push(item.clone());
        }

        Self {
            system_prompt: SUMMARIZATION_PROMPT.to_string(),
            transcript,
            target_tokens,
            existing_summary: (!existing.is_empty()).then(|| existing.join("\n\n")),
            guidance: guidance.map(str::to_string).filter(|g| !g.trim().is_empty()),
            items: kept,
        }
    }

    /// The user message sent to a model.
    pub fn user_message(&self) -> String {
        let mut content = String::new();
        if let Some(ref existing) = self.existing_summary {
            content.push_str("=== EXISTING SUMMARY ===\n");
            content.push_str(existing);
            content.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
        }
        content.push_str(&self.transcript);
        if let Some(ref guidance) = self.guidance {
            content.push_str("=== COMPACTION INSTRUCTIONS ===\n");
            content.push_str(guidance);
            content.push_str("\n\n");
        }
        content.push_str(&format!(
            "Keep the summary under {} tokens.",
            self.target_tokens
        ));
        content
    }
}

/// Produces summary text for a compaction range.
pub trait SummaryBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn summarize<'a>(&'a self, request: &'a SummaryRequest) -> SummaryFuture<'a>;
}

// ── Extractive backend ─────────────────────────────────────────────

/// Longest line (in chars) the extractive summary keeps per event.
const DEFAULT_MAX_LINE_CHARS: usize = 160;

/// Deterministic, model-free summarizer.
///
/// Output shape:
///
/// ```text
/// Summary of 42 earlier messages.
/// Task: Fix the failing parser tests in src/parse.rs
/// (17 earlier events omitted)
/// - assistant: The lexer drops trailing newlines.
/// - ran c7: {"name":"shell","arguments":{"cmd":"cargo test"}}
///   -> test result: ok. 12 passed
/// ```
///
/// The task and the most recent events are kept; middle events are dropped
/// first when the budget is tight. Summaries in this shape merge cleanly
/// into the next one.
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    max_line_chars: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            max_line_chars: DEFAULT_MAX_LINE_CHARS,
        }
    }
}

impl ExtractiveSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_chars(mut self, chars: usize) -> Self {
        self.max_line_chars = chars.max(16);
        self
    }

    /// Build the summary synchronously.
    ///
    /// An earlier extractive summary in the range is merged: its task line
    /// wins over the range's first user message, and its events come before
    /// the new ones.
    pub fn summarize_now(&self, request: &SummaryRequest) -> String {
        let budget = request.target_tokens;
        let carried = request
            .existing_summary
            .as_deref()
            .map(|text| self.carry(text))
            .unwrap_or_default();
        let header = format!(
            "Summary of {} earlier messages.",
            carried.messages + request.items.len()
        );

        let task_index = match carried.task {
            Some(_) => None,
            None => request.items.iter().position(|i| i.role == Role::User),
        };

        let mut head = vec![header];
        if let Some(ref task) = carried.task {
            head.push(format!("Task: {task}"));
        } else if let Some(index) = task_index {
            head.push(format!("Task: {}", self.first_line(&request.items[index].content)));
        }

        let new_events = request
            .items
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != task_index)
            .filter_map(|(_, item)| self.event_line(item));
        let events: Vec<String> = carried.events.into_iter().chain(new_events).collect();

        let mut used = 0;
        let mut lines = Vec::new();
        for line in head {
            let cost = line_cost(&line);
            if used + cost > budget && !lines.is_empty() {
                break;
            }
            used += cost;
            lines.push(line);
        }

        // Fill from the most recent event backwards.
        let omission_reserve = line_cost("(999999 earlier events omitted)");
        let mut recent = Vec::new();
        for line in events.iter().rev() {
            let cost = line_cost(line);
            if used + cost + omission_reserve > budget {
                break;
            }
            used += cost;
            recent.push(line.as_str());
        }
        let omitted = carried.omitted + events.len() - recent.len();
        if omitted > 0 && used + omission_reserve <= budget {
            lines.push(format!("({omitted} earlier events omitted)"));
        }
        lines.extend(recent.into_iter().rev().map(str::to_string));

        lines.join("\n")
    }

    /// Split an earlier summary into its header count, task, and events.
    /// Lines not in event form (e.g. from a model summary) become
    /// `- earlier:` events.
    fn carry(&self, text: &str) -> Carried {
        let mut carried = Carried::default();
        for line in text.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()) {
            if let Some(count) = line
                .strip_prefix("Summary of ")
                .and_then(|rest| rest.strip_suffix(" earlier messages."))
                .and_then(|n| n.parse::<usize>().ok())
            {
                carried.messages += count;
            } else if let Some(task) = line.strip_prefix("Task: ") {
                if carried.task.is_none() {
                    carried.task = Some(task.to_string());
                }
            } else if let Some(count) = line
                .strip_prefix('(')
                .and_then(|rest| rest.strip_suffix(" earlier events omitted)"))
                .and_then(|n| n.parse::<usize>().ok())
            {
                carried.omitted += count;
            } else if line.starts_with("- ") || line.starts_with("  -> ") {
                carried.events.push(line.to_string());
            } else {
                carried.events.push(format!("- earlier: {}", self.first_line(line)));
            }
        }
        carried
    }

    fn event_line(&self, item: &ConversationItem) -> Option<String> {
        let text = self.first_line(&item.content);
        if text.is_empty() {
            return None;
        }
        Some(match item.role {
            Role::User => format!("- user: {text}"),
            Role::Assistant => format!("- assistant: {text}"),
            Role::ToolCall => format!(
                "- ran {}: {text}",
                item.tool_call_id.as_deref().unwrap_or("tool")
            ),
            Role::ToolResult if item.truncated => format!("  -> {text} (output truncated)"),
            Role::ToolResult => format!("  -> {text}"),
            Role::Summary => return None,
        })
    }

    /// First non-blank line, cut to `max_line_chars`.
    fn first_line(&self, text: &str) -> String {
        let line = text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("");
        if line.chars().count() > self.max_line_chars {
            let cut: String = line.chars().take(self.max_line_chars).collect();
            format!("{}...", cut.trim_end())
        } else {
            line.to_string()
        }
    }
}

/// What an earlier summary contributes to the next one.
#[derive(Debug, Default)]
struct Carried {
    messages: usize,
    task: Option<String>,
    omitted: usize,
    events: Vec<String>,
}

fn line_cost(line: &str) -> usize {
    // The joining newline costs about one token.
    estimate_tokens(line) + 1
}

impl SummaryBackend for ExtractiveSummarizer {
    fn name(&self) -> &str {
        "extractive"
    }

    fn summarize<'a>(&'a self, request: &'a SummaryRequest) -> SummaryFuture<'a> {
        Box::pin(async move { Ok(self.summarize_now(request)) })
    }
}

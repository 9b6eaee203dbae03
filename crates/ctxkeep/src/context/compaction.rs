//! Compaction: summarize a prefix of the conversation.
//!
//! ## Algorithm
//!
//! 1. Pick the last index of the prefix to replace. By default this is the
//!    item before the most recent user turn, so the model keeps the turn it
//!    is working on verbatim ([`CompactionEngine::suggest_boundary`]).
//! 2. Move the boundary so no tool call is separated from its result: extend
//!    it to take in the result, or, if that would reach into the retained
//!    suffix, pull it back before the call ([`CompactionEngine::select_range`]).
//! 3. Ask a [`SummaryBackend`] for a summary of the range with a budget of
//!    `original_tokens / target_ratio`.
//! 4. Return a [`CompactionSummary`] for the caller to hand to
//!    [`ContextManager::apply_compaction`](super::manager::ContextManager::apply_compaction).
//!
//! The engine never touches the conversation itself.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use super::item::{CompactionSummary, ConversationItem, Role};
use super::summarizer::{SummaryBackend, SummaryRequest};
use crate::config::ContextConfig;
use crate::error::CompactionError;

/// Default ratio of original tokens to summary tokens.
pub const DEFAULT_TARGET_RATIO: f64 = 10.0;

/// Default number of trailing items always kept when no user turn marks the
/// boundary.
pub const DEFAULT_KEEP_RECENT_ITEMS: usize = 1;

/// Floor for the summary budget, so tiny ranges still get a usable summary.
pub const MIN_SUMMARY_TOKENS: usize = 32;

/// Produces compaction summaries.
#[derive(Debug, Clone)]
pub struct CompactionEngine {
    target_ratio: f64,
    keep_recent_items: usize,
    guidance: Option<String>,
}

impl Default for CompactionEngine {
    fn default() -> Self {
        Self {
            target_ratio: DEFAULT_TARGET_RATIO,
            keep_recent_items: DEFAULT_KEEP_RECENT_ITEMS,
            guidance: None,
        }
    }
}

impl CompactionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new()
            .with_target_ratio(config.compaction_target_ratio)
            .with_keep_recent_items(config.keep_recent_items)
    }

    pub fn with_target_ratio(mut self, ratio: f64) -> Self {
        self.target_ratio = if ratio.is_finite() && ratio > 1.0 {
            ratio
        } else {
            DEFAULT_TARGET_RATIO
        };
        self
    }

    /// Keep at least this many trailing items (minimum one).
    pub fn with_keep_recent_items(mut self, n: usize) -> Self {
        self.keep_recent_items = n.max(1);
        self
    }

    /// Extra summarization instructions, e.g. from a
    /// `## Compaction Instructions` section.
    pub fn with_guidance(mut self, guidance: Option<String>) -> Self {
        self.guidance = guidance.filter(|g| !g.trim().is_empty());
        self
    }

    pub fn guidance(&self) -> Option<&str> {
        self.guidance.as_deref()
    }

    /// Summary budget for a range of `original_tokens`.
    pub fn target_tokens(&self, original_tokens: usize) -> usize {
        ((original_tokens as f64 / self.target_ratio) as usize)
            .max(MIN_SUMMARY_TOKENS)
            .min(original_tokens.saturating_sub(1))
    }

    /// Highest index a compaction range may end at.
    fn max_last(&self, len: usize) -> Option<usize> {
        len.checked_sub(self.keep_recent_items + 1)
    }

    /// The default `up_to_index`: the item before the most recent user turn,
    /// or, when that turn is the first item, everything but the last
    /// `keep_recent_items` items. `None` when nothing can be compacted.
    pub fn suggest_boundary(&self, items: &[ConversationItem]) -> Option<usize> {
        let max_last = self.max_last(items.len())?;
        let before_last_user = items
            .iter()
            .rposition(|i| i.role == Role::User)
            .and_then(|pos| pos.checked_sub(1));
        Some(before_last_user.map_or(max_last, |b| b.min(max_last)))
    }

    /// Resolve `up_to_index` into an inclusive range starting at 0 that keeps
    /// every tool call together with its result.
    ///
    /// `up_to_index` is capped at [`suggest_boundary`](Self::suggest_boundary),
    /// so the most recent user turn is never part of the range.
    pub fn select_range(
        &self,
        items: &[ConversationItem],
        up_to_index: usize,
    ) -> Result<(usize, usize), CompactionError> {
        let max_last = self
            .suggest_boundary(items)
            .ok_or_else(|| CompactionError::NothingToCompact {
                reason: format!(
                    "{} items, {} must be kept",
                    items.len(),
                    self.keep_recent_items
                ),
            })?;

        let mut last = up_to_index.min(max_last);
        let spans = pairing_spans(items);

        // Extend over split pairs while the retained suffix allows it.
        while let Some(end) = spans
            .values()
            .filter(|(lo, hi)| *lo <= last && *hi > last)
            .map(|(_, hi)| *hi)
            .max()
        {
            if end > max_last {
                break;
            }
            trace!(from = last, to = end, "extending compaction range over tool pair");
            last = end;
        }

        // Otherwise pull back before the earliest split pair.
        while let Some(start) = spans
            .values()
            .filter(|(lo, hi)| *lo <= last && *hi > last)
            .map(|(lo, _)| *lo)
            .min()
        {
            if start == 0 {
                return Err(CompactionError::NothingToCompact {
                    reason: "the first item belongs to a tool pair that must be kept".into(),
                });
            }
            trace!(from = last, to = start - 1, "pulling compaction range before tool pair");
            last = start - 1;
        }

        Ok((0, last))
    }

    /// Summarize `items[0..=up_to_index]` (after pair adjustment).
    ///
    /// Fails with a [`CompactionError`] when the range is empty, the backend
    /// fails, or the summary is not smaller than the range.
    pub async fn compact(
        &self,
        items: &[ConversationItem],
        up_to_index: usize,
        backend: &dyn SummaryBackend,
    ) -> Result<CompactionSummary, CompactionError> {
        let (first, last) = self.select_range(items, up_to_index)?;
        let range = &items[first..=last];
        let original_tokens: usize = range.iter().map(|i| i.estimated_tokens).sum();
        if original_tokens == 0 {
            return Err(CompactionError::NothingToCompact {
                reason: "the selected range holds no tokens".into(),
            });
        }

        let target = self.target_tokens(original_tokens);
        let request = SummaryRequest::build(range, target, self.guidance.as_deref());
        debug!(
            backend = backend.name(),
            first,
            last,
            original_tokens,
            target,
            "summarizing compaction range"
        );

        let text = backend.summarize(&request).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(CompactionError::EmptySummary);
        }

        let summary = CompactionSummary::new(text, first, last, original_tokens);
        if summary.summary_tokens >= original_tokens {
            return Err(CompactionError::NotSmaller {
                summary_tokens: summary.summary_tokens,
                original_tokens,
            });
        }
        if summary.summary_tokens > target {
            warn!(
                summary_tokens = summary.summary_tokens,
                target, "summary is over its budget"
            );
        }
        Ok(summary)
    }
}

/// For each pairing id, the lowest and highest index it appears at.
fn pairing_spans(items: &[ConversationItem]) -> HashMap<&str, (usize, usize)> {
    let mut spans: HashMap<&str, (usize, usize)> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        if let Some(id) = item.pairing_id() {
            spans
                .entry(id)
                .and_modify(|(_, hi)| *hi = index)
                .or_insert((index, index));
        }
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::summarizer::{ExtractiveSummarizer, SummaryFuture};
    use crate::error::SummaryError;

    fn user(t: usize) -> ConversationItem {
        ConversationItem::user("do the thing").with_estimated_tokens(t)
    }
    fn assistant(t: usize) -> ConversationItem {
        ConversationItem::assistant("working on it").with_estimated_tokens(t)
    }
    fn call(id: &str) -> ConversationItem {
        ConversationItem::tool_call(id, "read_file src/lib.rs").with_estimated_tokens(50)
    }
    fn result(id: &str) -> ConversationItem {
        ConversationItem::tool_result(id, "pub mod context;").with_estimated_tokens(500)
    }

    struct Fixed(&'static str);
    impl SummaryBackend for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn summarize<'a>(&'a self, _request: &'a SummaryRequest) -> SummaryFuture<'a> {
            Box::pin(async move { Ok(self.0.to_string()) })
        }
    }

    struct Failing;
    impl SummaryBackend for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn summarize<'a>(&'a self, _request: &'a SummaryRequest) -> SummaryFuture<'a> {
            Box::pin(async { Err(SummaryError::Timeout(std::time::Duration::from_secs(30))) })
        }
    }

    #[test]
    fn boundary_is_before_last_user_turn() {
        let items = vec![user(10), assistant(10), user(10), assistant(10)];
        assert_eq!(CompactionEngine::new().suggest_boundary(&items), Some(1));
    }

    #[test]
    fn boundary_falls_back_to_keep_recent() {
        let items = vec![user(10), assistant(10), assistant(10), assistant(10)];
        let engine = CompactionEngine::new().with_keep_recent_items(2);
        assert_eq!(engine.suggest_boundary(&items), Some(1));
    }

    #[test]
    fn nothing_to_compact_for_single_item() {
        let engine = CompactionEngine::new();
        assert_eq!(engine.suggest_boundary(&[user(10)]), None);
        assert!(matches!(
            engine.select_range(&[user(10)], 0),
            Err(CompactionError::NothingToCompact { .. })
        ));
    }

    #[test]
    fn never_includes_most_recent_item() {
        let items = vec![user(10), assistant(10), assistant(10)];
        assert_eq!(CompactionEngine::new().select_range(&items, 99).unwrap(), (0, 1));
    }

    #[test]
    fn extends_over_split_pair() {
        // 0 user, 1 call, 2 result, 3 assistant, 4 user
        let items = vec![user(10), call("c1"), result("c1"), assistant(10), user(10)];
        assert_eq!(CompactionEngine::new().select_range(&items, 1).unwrap(), (0, 2));
    }

    #[test]
    fn pulls_back_when_result_is_in_retained_suffix() {
        // The result is the last item, which is always kept.
        let items = vec![user(10), assistant(10), call("c1"), result("c1")];
        assert_eq!(CompactionEngine::new().select_range(&items, 2).unwrap(), (0, 1));
    }

    #[test]
    fn explicit_index_stops_before_last_user_turn() {
        let items = vec![
            user(10),
            assistant(10),
            ConversationItem::user("second task").with_estimated_tokens(10),
            assistant(10),
            assistant(10),
        ];
        let engine = CompactionEngine::new();
        assert_eq!(engine.select_range(&items, 3).unwrap(), (0, 1));
        assert_eq!(engine.select_range(&items, 2).unwrap(), (0, 1));
        assert_eq!(engine.select_range(&items, 0).unwrap(), (0, 0));
    }

    #[test]
    fn pair_at_start_cannot_be_split() {
        let items = vec![call("c1"), result("c1")];
        let engine = CompactionEngine::new();
        assert!(matches!(
            engine.select_range(&items, 0),
            Err(CompactionError::NothingToCompact { .. })
        ));
    }

    #[test]
    fn target_is_a_tenth_with_floor() {
        let engine = CompactionEngine::new();
        assert_eq!(engine.target_tokens(50_000), 5_000);
        assert_eq!(engine.target_tokens(100), MIN_SUMMARY_TOKENS);
        assert_eq!(engine.target_tokens(10), 9);
    }

    #[tokio::test]
    async fn compact_produces_summary_for_range() {
        let items = vec![user(1_000), call("c1"), result("c1"), assistant(1_000), user(10)];
        let engine = CompactionEngine::new();
        let up_to = engine.suggest_boundary(&items).unwrap();
        let summary = engine
            .compact(&items, up_to, &Fixed("Read src/lib.rs; it declares the context module."))
            .await
            .unwrap();

        assert_eq!((summary.first_index, summary.last_index), (0, 3));
        assert_eq!(summary.original_tokens, 2_550);
        assert!(summary.summary_tokens < summary.original_tokens);
    }

    #[tokio::test]
    async fn compact_with_extractive_backend_hits_target() {
        let mut items = vec![ConversationItem::user("Port the cache to the new storage API")];
        for i in 0..100 {
            items.push(ConversationItem::tool_call(format!("c{i}"), "shell cargo test"));
            items.push(ConversationItem::tool_result(
                format!("c{i}"),
                "test storage::cache ... ok\n".repeat(40),
            ));
        }
        items.push(ConversationItem::user("Now update the docs"));

        let engine = CompactionEngine::new();
        let up_to = engine.suggest_boundary(&items).unwrap();
        let summary = engine
            .compact(&items, up_to, &ExtractiveSummarizer::new())
            .await
            .unwrap();

        assert!(summary.compression_ratio() >= 10.0);
        assert_eq!(summary.last_index, items.len() - 2);
    }

    #[tokio::test]
    async fn empty_summary_fails() {
        let items = vec![user(100), assistant(100), user(10)];
        let err = CompactionEngine::new()
            .compact(&items, 1, &Fixed("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, CompactionError::EmptySummary));
    }

    #[tokio::test]
    async fn oversized_summary_fails() {
        let items = vec![user(2), assistant(2), user(10)];
        let err = CompactionEngine::new()
            .compact(&items, 1, &Fixed("a much longer summary than the original two items"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompactionError::NotSmaller { .. }));
    }

    #[tokio::test]
    async fn backend_failure_is_compaction_failure() {
        let items = vec![user(100), assistant(100), user(10)];
        let err = CompactionEngine::new()
            .compact(&items, 1, &Failing)
            .await
            .unwrap_err();
        assert!(matches!(err, CompactionError::Backend(SummaryError::Timeout(_))));
    }

    #[test]
    fn blank_guidance_is_ignored() {
        let engine = CompactionEngine::new().with_guidance(Some("  ".into()));
        assert!(engine.guidance().is_none());
        let engine = CompactionEngine::new().with_guidance(Some("Keep file paths.".into()));
        assert_eq!(engine.guidance(), Some("Keep file paths."));
    }
}

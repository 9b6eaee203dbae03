//! Head+tail truncation for tool and command output.
//!
//! A `cargo test` run or a `grep` over a large tree can produce far more
//! output than is useful to the model. The truncator keeps the start and the
//! end of the output (where the command line, the first errors, and the final
//! summary usually live), drops the middle, and puts a visible marker in the
//! gap saying how much was left out:
//!
//! ```text
//! running 212 tests
//! test context::manager::tests::add_item ... ok
//! [... omitted 30771 bytes (512 lines) ...]
//! test result: ok. 212 passed; 0 failed
//! ```
//!
//! The marker is sized for the worst case before the cut points are chosen,
//! so the result never exceeds the limit. That is what makes truncation a
//! fixed point: feeding a truncated output back in with the same limit
//! returns it unchanged and produces no new [`TruncationRecord`].

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default per-output limit (10 KiB).
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 10 * 1024;

/// Limits below this are raised to it so the marker always fits.
pub const MIN_TRUNCATION_LIMIT_BYTES: usize = 256;

/// Default share of the retained bytes given to the head.
pub const DEFAULT_HEAD_FRACTION: f64 = 0.5;

/// Outcome of one truncation. Immutable once created; kept in the session's
/// audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncationRecord {
    /// Length of the content before truncation.
    pub original_bytes: usize,
    /// Bytes of original content kept (head + tail, marker excluded).
    pub retained_bytes: usize,
    /// Bytes dropped from the middle.
    pub omitted_bytes: usize,
    /// Lines touched by the dropped region.
    pub omitted_lines: usize,
    /// Length of the verbatim head segment.
    pub head_bytes: usize,
    /// Length of the verbatim tail segment.
    pub tail_bytes: usize,
    /// The limit that was enforced.
    pub limit_bytes: usize,
    pub created_at: DateTime<Utc>,
}

impl TruncationRecord {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "truncated {} -> {} bytes (omitted {} bytes, {} lines)",
            self.original_bytes, self.retained_bytes, self.omitted_bytes, self.omitted_lines,
        )
    }
}

/// Bounds a single piece of output with a head+tail strategy.
///
/// Stateless and `Copy`; safe to share across sessions.
///
/// # Example
///
/// ```
/// use ctxkeep::context::OutputTruncator;
///
/// let output = "line\n".repeat(10_000);
/// let (kept, record) = OutputTruncator::default().truncate(&output);
/// let record = record.expect("40 KiB is over the 10 KiB default");
///
/// assert!(kept.len() <= 10 * 1024);
/// assert_eq!(record.original_bytes, output.len());
/// assert!(kept.starts_with("line\n"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputTruncator {
    limit_bytes: usize,
    head_fraction: f64,
}

impl Default for OutputTruncator {
    fn default() -> Self {
        Self {
            limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            head_fraction: DEFAULT_HEAD_FRACTION,
        }
    }
}

impl OutputTruncator {
    /// Create a truncator with the given limit and an even head/tail split.
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit_bytes: limit_bytes.max(MIN_TRUNCATION_LIMIT_BYTES),
            ..Self::default()
        }
    }

    /// Set the share of retained bytes given to the head (clamped to 0.0–1.0).
    pub fn with_head_fraction(mut self, fraction: f64) -> Self {
        self.head_fraction = if fraction.is_nan() {
            DEFAULT_HEAD_FRACTION
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self
    }

    /// The configured limit in bytes.
    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    /// Truncate to the configured limit.
    pub fn truncate<'a>(&self, content: &'a str) -> (Cow<'a, str>, Option<TruncationRecord>) {
        self.truncate_to(content, self.limit_bytes)
    }

    /// Truncate to an explicit limit.
    ///
    /// Content that already fits is returned borrowed with no record.
    pub fn truncate_to<'a>(
        &self,
        content: &'a str,
        limit_bytes: usize,
    ) -> (Cow<'a, str>, Option<TruncationRecord>) {
        let limit = limit_bytes.max(MIN_TRUNCATION_LIMIT_BYTES);
        if content.len() <= limit {
            return (Cow::Borrowed(content), None);
        }

        let total_lines = content.matches('\n').count() + 1;
        let worst_marker = format!("\n{}", marker(content.len(), total_lines)).len();
        let budget = limit.saturating_sub(worst_marker);

        let head_budget = ((budget as f64) * self.head_fraction).floor() as usize;
        let tail_budget = budget - head_budget.min(budget);

        let head_end = snap_head(content, head_budget);
        let tail_start = snap_tail(content, content.len() - tail_budget).max(head_end);

        #[allow(clippy::string_slice)] // cut points are snapped to char boundaries
        let (head, tail, omitted) = (
            &content[..head_end],
            &content[tail_start..],
            &content[head_end..tail_start],
        );
        let omitted_lines =
            omitted.matches('\n').count() + usize::from(!omitted.is_empty() && !omitted.ends_with('\n'));

        let separator = if head.is_empty() || head.ends_with('\n') {
            ""
        } else {
            "\n"
        };
        let mut result = String::with_capacity(limit);
        result.push_str(head);
        result.push_str(separator);
        result.push_str(&marker(omitted.len(), omitted_lines));
        result.push_str(tail);

        let record = TruncationRecord {
            original_bytes: content.len(),
            retained_bytes: head.len() + tail.len(),
            omitted_bytes: omitted.len(),
            omitted_lines,
            head_bytes: head.len(),
            tail_bytes: tail.len(),
            limit_bytes: limit,
            created_at: Utc::now(),
        };
        (Cow::Owned(result), Some(record))
    }
}

/// Truncate `content` to `limit_bytes` with the default head/tail split.
pub fn truncate(content: &str, limit_bytes: usize) -> (Cow<'_, str>, Option<TruncationRecord>) {
    OutputTruncator::default().truncate_to(content, limit_bytes)
}

fn marker(bytes: usize, lines: usize) -> String {
    format!("[... omitted {bytes} bytes ({lines} lines) ...]\n")
}

/// End of the head segment: just after the last newline in the budget when
/// that keeps at least half of it, otherwise the budget itself (moved back
/// to a char boundary).
#[allow(clippy::string_slice)] // `end` is a char boundary
fn snap_head(content: &str, budget: usize) -> usize {
    let end = floor_char_boundary(content, budget);
    match content[..end].rfind('\n') {
        Some(pos) if pos + 1 >= end / 2 => pos + 1,
        _ => end,
    }
}

/// Start of the tail segment: just after the first newline past `start` when
/// that keeps at least half of the tail, otherwise `start` itself (moved
/// forward to a char boundary).
#[allow(clippy::string_slice)] // `start` is a char boundary
fn snap_tail(content: &str, start: usize) -> usize {
    let start = ceil_char_boundary(content, start);
    let tail_len = content.len() - start;
    match content[start..].find('\n') {
        Some(pos) if pos + 1 < tail_len && pos + 1 <= tail_len / 2 => start + pos + 1,
        _ => start,
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

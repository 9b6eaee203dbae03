//! Error types for the context subsystem.
//!
//! Expected threshold conditions are *not* errors: crossing the compaction
//! threshold is reported through [`AddOutcome`](crate::context::AddOutcome).
//! The enums here cover the failure paths the caller has to act on
//! (compaction failed, local instructions too large) and the programmer
//! errors the context manager refuses to apply.

use std::path::PathBuf;

use thiserror::Error;

use crate::context::Role;

/// Rejections from [`ContextManager::apply_compaction`](crate::context::ContextManager::apply_compaction)
/// and from item validation.
///
/// A rejected summary leaves the conversation untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// The summary references items outside the current sequence.
    #[error("invalid compaction range {first}..={last} for {len} items")]
    InvalidRange {
        first: usize,
        last: usize,
        len: usize,
    },
    /// The range no longer holds the tokens the summary was computed from.
    #[error(
        "stale compaction summary: range {first}..={last} holds {actual} tokens, summary expected {expected}"
    )]
    StaleSummary {
        first: usize,
        last: usize,
        expected: usize,
        actual: usize,
    },
    /// The summary would not shrink the range it replaces.
    #[error("summary of {summary_tokens} tokens does not reduce the {original_tokens} tokens it replaces")]
    SummaryNotSmaller {
        summary_tokens: usize,
        original_tokens: usize,
    },
    /// A tool call or tool result without the id that pairs it.
    #[error("{role} item has no tool_call_id")]
    MissingToolCallId { role: Role },
}

/// The `CompactionFailed` condition.
///
/// The conversation continues un-compacted; the next append over the
/// threshold re-signals `CompactionRequired`.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// The selected range is empty after boundary adjustment.
    #[error("nothing to compact: {reason}")]
    NothingToCompact { reason: String },
    /// The summarization backend failed (network, API, timeout).
    #[error("summarization failed: {0}")]
    Backend(#[from] SummaryError),
    /// The backend returned no usable text.
    #[error("summarization produced an empty summary")]
    EmptySummary,
    /// The summary is not smaller than what it replaces.
    #[error("summary of {summary_tokens} tokens is not below the original {original_tokens} tokens")]
    NotSmaller {
        summary_tokens: usize,
        original_tokens: usize,
    },
    /// The context manager refused to apply the summary.
    #[error("compaction rejected: {0}")]
    Rejected(#[from] ContextError),
}

/// Errors raised by a [`SummaryBackend`](crate::context::summarizer::SummaryBackend).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SummaryError {
    /// Transport-level failure (connection, TLS, body read).
    #[error("request failed: {0}")]
    Http(String),
    /// The API answered with a non-success status or an error body.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
    /// The API answered successfully but without content.
    #[error("empty response from summarization model")]
    Empty,
    /// The call did not finish within the configured timeout.
    #[error("summarization timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl SummaryError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SummaryError::Http(_) | SummaryError::Timeout(_) => true,
            SummaryError::Api { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            SummaryError::Empty => false,
        }
    }
}

/// Errors from loading layered instruction files.
#[derive(Debug, Error)]
pub enum InstructionError {
    /// Local instructions alone exceed the ceiling. Fatal to session startup.
    #[error(
        "local instructions are {local_bytes} bytes, over the {ceiling} byte ceiling; shrink {}",
        path.as_ref().map_or_else(|| "the local layer".to_string(), |p| p.display().to_string())
    )]
    ConfigTooLarge {
        local_bytes: usize,
        ceiling: usize,
        path: Option<PathBuf>,
    },
    /// A layer file exists but could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from loading [`ContextConfig`](crate::config::ContextConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

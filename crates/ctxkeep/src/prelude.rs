//! Convenience re-exports for common `ctxkeep` types.
//!
//! ```ignore
//! use ctxkeep::prelude::*;
//! ```
//!
//! Audit internals and wire types are left out; import those from their
//! modules directly.

// ── Context ─────────────────────────────────────────────────────────
pub use crate::context::{
    AddOutcome, CompactionEngine, CompactionSummary, ContextEvent, ContextManager, ContextUsage,
    ConversationItem, EventHandler, ExtractiveSummarizer, FnEventHandler, LoggingHandler,
    NoopHandler, OutputTruncator, Role, SummaryBackend, TruncationRecord, UsageSnapshot,
    estimate_tokens,
};

// ── Instructions ────────────────────────────────────────────────────
pub use crate::instructions::{InstructionLoader, InstructionPaths, InstructionSet, Layer};

// ── Sessions and backends ───────────────────────────────────────────
pub use crate::api::{OpenRouterSummarizer, RetryConfig};
pub use crate::config::ContextConfig;
pub use crate::session::Session;

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{CompactionError, ContextError, InstructionError, SummaryError};

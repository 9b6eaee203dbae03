//! Context window management: estimation, truncation, accounting, and
//! compaction.
//!
//! The context window is the scarcest resource a coding agent has. The
//! pieces here keep it under control without ever dropping information
//! silently:
//!
//! 1. **[`estimator`]**: [`estimate_tokens`], a fast tokenizer-free
//!    approximation used for all accounting.
//!
//! 2. **[`truncate`]**: [`OutputTruncator`] cuts oversized tool output to a
//!    head and a tail around an omission marker, and reports what it dropped.
//!
//! 3. **[`manager`]**: [`ContextManager`] owns the item sequence, keeps the
//!    token total in step with it, and signals when compaction is required.
//!
//! 4. **[`compaction`]**: [`CompactionEngine`] picks a pair-safe prefix and
//!    asks a [`SummaryBackend`] for a much smaller replacement.
//!
//! Every lossy step lands in the session's [`AuditTrail`] and is reported
//! as a [`ContextEvent`].

pub mod audit;
pub mod compaction;
pub mod estimator;
pub mod events;
pub mod item;
pub mod manager;
pub mod summarizer;
pub mod tracker;
pub mod truncate;

pub use audit::{AuditEntry, AuditTrail, CompactionRecord, FlatAuditRecord};
pub use compaction::CompactionEngine;
pub use estimator::estimate_tokens;
pub use events::{ContextEvent, EventHandler, FnEventHandler, LoggingHandler, NoopHandler};
pub use item::{CompactionSummary, ConversationItem, Role};
pub use manager::{AddOutcome, CompactionApplied, ContextManager, ContextUsage, UsageSnapshot};
pub use summarizer::{ExtractiveSummarizer, SummaryBackend, SummaryFuture, SummaryRequest};
pub use tracker::{TurnTracker, TurnUsage};
pub use truncate::{OutputTruncator, TruncationRecord};

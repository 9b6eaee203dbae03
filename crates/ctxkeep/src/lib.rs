//! Context-window management for coding agents.
//!
//! `ctxkeep` keeps a long-running agent conversation inside its model's
//! context window without losing track of what was dropped. It estimates
//! token usage, truncates oversized tool output, signals when the history
//! must be compacted, replaces old history with a summary, and merges
//! layered `AGENTS.md` instructions under a fixed size ceiling.
//!
//! # Getting started
//!
//! ```
//! use ctxkeep::prelude::*;
//!
//! let mut manager = ContextManager::new(100_000).with_instruction_tokens(20_000);
//! let outcome = manager.add_item(ConversationItem::user("Fix the parser tests"));
//! assert!(!outcome.compaction_required());
//!
//! let output = "log line\n".repeat(500);
//! let (text, record) = OutputTruncator::new(1024).truncate(&output);
//! assert!(text.len() <= 1024);
//! assert!(record.is_some());
//! ```
//!
//! A [`Session`](session::Session) wires a manager to a
//! [`CompactionEngine`](context::CompactionEngine) and a
//! [`SummaryBackend`](context::SummaryBackend) and serializes access for
//! async callers.
//!
//! # Where to find things
//!
//! - **Token accounting:** [`estimate_tokens`](context::estimate_tokens) and
//!   [`ContextManager`](context::ContextManager). Crossing the threshold is a
//!   value ([`AddOutcome::CompactionRequired`](context::AddOutcome)), not an
//!   error.
//!
//! - **Tool output:** [`OutputTruncator`](context::OutputTruncator) keeps a
//!   head and a tail and records every cut as a
//!   [`TruncationRecord`](context::TruncationRecord).
//!
//! - **Compaction:** [`CompactionEngine`](context::CompactionEngine) with the
//!   model-free [`ExtractiveSummarizer`](context::ExtractiveSummarizer) or the
//!   hosted [`OpenRouterSummarizer`](api::OpenRouterSummarizer).
//!
//! - **Instructions:** [`InstructionLoader`](instructions::InstructionLoader)
//!   and [`InstructionPaths::discover`](instructions::InstructionPaths::discover).
//!
//! - **Observability:** implement [`EventHandler`](context::EventHandler), or
//!   use [`LoggingHandler`](context::LoggingHandler) to forward every event to
//!   `tracing`.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Estimator, truncator, context manager, compaction engine, audit trail, events |
//! | [`instructions`] | Layered instruction discovery, merging, and trimming |
//! | [`session`] | Async session wrapper with single-writer compaction |
//! | [`api`] | OpenRouter summarization backend and retry policy |
//! | [`config`] | TOML session configuration |
//! | [`error`] | Error types |

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod instructions;
pub mod prelude;
pub mod session;

//! Context events and handlers.
//!
//! The [`Session`](crate::session::Session) reports every signal and lossy
//! operation as a [`ContextEvent`]. Callers implement [`EventHandler`] to
//! forward them to a REPL status line, metrics, or an audit sink.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or headless runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures |

use tracing::{info, warn};

use super::audit::CompactionRecord;
use super::manager::UsageSnapshot;
use super::truncate::TruncationRecord;
use crate::error::CompactionError;
use crate::instructions::InstructionTrim;

/// Events emitted while managing a session's context.
#[derive(Debug)]
pub enum ContextEvent<'a> {
    /// A tool result was truncated before entering the conversation.
    Truncated {
        tool_call_id: Option<&'a str>,
        record: &'a TruncationRecord,
    },
    /// Usage reached the compaction threshold.
    CompactionRequired { usage: &'a UsageSnapshot },
    /// A compaction summary replaced part of the history.
    Compacted {
        record: &'a CompactionRecord,
        usage: &'a UsageSnapshot,
    },
    /// Compaction was attempted and failed; the conversation is unchanged.
    CompactionFailed { error: &'a CompactionError },
    /// An instruction layer was cut to fit the ceiling.
    InstructionsTrimmed { trim: &'a InstructionTrim },
}

/// Handler for context events. The default ignores everything.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ContextEvent<'_>) {
        let _ = event;
    }
}

/// Ignores all events.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use ctxkeep::context::{ContextEvent, EventHandler, FnEventHandler};
///
/// let failures = AtomicUsize::new(0);
/// let handler = FnEventHandler::new(|event| {
///     if let ContextEvent::CompactionFailed { .. } = event {
///         failures.fetch_add(1, Ordering::Relaxed);
///     }
/// });
/// # let _ = &handler;
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&ContextEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&ContextEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&ContextEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &ContextEvent<'_>) {
        (self.0)(event)
    }
}

/// Forwards every event to `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &ContextEvent<'_>) {
        match event {
            ContextEvent::Truncated {
                tool_call_id,
                record,
            } => {
                warn!(
                    tool_call_id = tool_call_id.unwrap_or("-"),
                    original_bytes = record.original_bytes,
                    omitted_bytes = record.omitted_bytes,
                    "tool output {}",
                    record.to_log_string()
                );
            }
            ContextEvent::CompactionRequired { usage } => {
                info!("compaction required: {}", usage.to_log_string());
            }
            ContextEvent::Compacted { record, usage } => {
                info!(
                    first = record.first_index,
                    last = record.last_index,
                    "compacted {} items: {} -> {} tokens; {}",
                    record.replaced_items,
                    record.original_tokens,
                    record.summary_tokens,
                    usage.to_log_string()
                );
            }
            ContextEvent::CompactionFailed { error } => {
                warn!("compaction failed, continuing uncompacted: {error}");
            }
            ContextEvent::InstructionsTrimmed { trim } => {
                warn!(
                    layer = %trim.layer,
                    "instructions trimmed: {} -> {} bytes{}",
                    trim.original_bytes,
                    trim.retained_bytes,
                    if trim.dropped { " (layer dropped)" } else { "" }
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::truncate::truncate;
    use std::sync::Mutex;

    #[test]
    fn fn_handler_receives_events() {
        let seen = Mutex::new(Vec::new());
        let handler = FnEventHandler::new(|event| {
            let name = match event {
                ContextEvent::Truncated { .. } => "truncated",
                ContextEvent::CompactionFailed { .. } => "failed",
                _ => "other",
            };
            seen.lock().unwrap().push(name);
        });

        let content = "y".repeat(2_000);
        let (_, record) = truncate(&content, 512);
        let record = record.unwrap();
        handler.on_event(&ContextEvent::Truncated {
            tool_call_id: Some("c1"),
            record: &record,
        });
        handler.on_event(&ContextEvent::CompactionFailed {
            error: &CompactionError::EmptySummary,
        });

        assert_eq!(*seen.lock().unwrap(), vec!["truncated", "failed"]);
    }

    #[test]
    fn noop_and_logging_handlers_accept_everything() {
        let error = CompactionError::EmptySummary;
        let event = ContextEvent::CompactionFailed { error: &error };
        NoopHandler.on_event(&event);
        LoggingHandler.on_event(&event);
    }
}

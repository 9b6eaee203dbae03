//! One agent session's context, safe to share between tasks.
//!
//! [`Session`] serializes every mutation of its [`ContextManager`] behind a
//! `tokio` mutex. Compaction holds that lock across the summarization call,
//! so appends to the same session wait until the summary is applied or the
//! attempt fails. Usage is published on a `watch` channel after every
//! mutation, so [`Session::snapshot`] never waits on that lock. Separate
//! sessions share nothing.
//!
//! ```ignore
//! let session = Session::from_config(&config, Arc::new(OpenRouterSummarizer::from_env()?))
//!     .with_event_handler(Arc::new(LoggingHandler));
//! session.set_instructions(&instructions).await;
//!
//! if session.add_item(ConversationItem::user(prompt)).await.compaction_required() {
//!     // Failure leaves the conversation as it was; the next append re-signals.
//!     let _ = session.compact().await;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use crate::config::ContextConfig;
use crate::context::audit::AuditEntry;
use crate::context::compaction::CompactionEngine;
use crate::context::events::{ContextEvent, EventHandler, NoopHandler};
use crate::context::item::ConversationItem;
use crate::context::manager::{
    AddOutcome, CompactionApplied, ContextManager, OUTPUT_RESERVE_FRACTION, UsageSnapshot,
};
use crate::context::summarizer::SummaryBackend;
use crate::context::tracker::TurnTracker;
use crate::error::{CompactionError, SummaryError};
use crate::instructions::InstructionSet;

struct SessionState {
    manager: ContextManager,
    engine: CompactionEngine,
    tracker: TurnTracker,
}

/// A context manager, compaction engine, and summary backend bound together.
pub struct Session {
    state: Mutex<SessionState>,
    backend: Arc<dyn SummaryBackend>,
    handler: Arc<dyn EventHandler>,
    compaction_timeout: Option<Duration>,
    /// Last published usage.
    usage: watch::Sender<UsageSnapshot>,
}

impl Session {
    pub fn new(
        manager: ContextManager,
        engine: CompactionEngine,
        backend: Arc<dyn SummaryBackend>,
    ) -> Self {
        let (usage, _) = watch::channel(manager.snapshot());
        Self {
            state: Mutex::new(SessionState {
                manager,
                engine,
                tracker: TurnTracker::new(),
            }),
            backend,
            handler: Arc::new(NoopHandler),
            compaction_timeout: None,
            usage,
        }
    }

    pub fn from_config(config: &ContextConfig, backend: Arc<dyn SummaryBackend>) -> Self {
        Self::new(
            ContextManager::from_config(config),
            CompactionEngine::from_config(config),
            backend,
        )
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Give up on a summarization call after `timeout`.
    pub fn with_compaction_timeout(mut self, timeout: Duration) -> Self {
        self.compaction_timeout = Some(timeout);
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Account for merged instructions: their tokens become fixed overhead,
    /// trims go to the audit trail, and any compaction section becomes
    /// summarization guidance.
    pub async fn set_instructions(&self, instructions: &InstructionSet) {
        let mut state = self.state.lock().await;
        let SessionState {
            manager, engine, ..
        } = &mut *state;

        manager.set_instruction_tokens(instructions.estimated_tokens());
        manager.record_instruction_trims(&instructions.trims);
        *engine = engine
            .clone()
            .with_guidance(instructions.compaction_instructions.clone());

        self.publish(manager);

        for trim in &instructions.trims {
            self.handler
                .on_event(&ContextEvent::InstructionsTrimmed { trim });
        }
        debug!(
            instruction_tokens = instructions.estimated_tokens(),
            trims = instructions.trims.len(),
            "session instructions set"
        );
    }

    /// Append an item. Waits while a compaction is in flight.
    pub async fn add_item(&self, item: ConversationItem) -> AddOutcome {
        let mut state = self.state.lock().await;
        let audit_len = state.manager.audit().len();
        let outcome = state.manager.add_item(item);

        for entry in &state.manager.audit().entries()[audit_len..] {
            if let AuditEntry::Truncation {
                tool_call_id,
                record,
            } = entry
            {
                self.handler.on_event(&ContextEvent::Truncated {
                    tool_call_id: tool_call_id.as_deref(),
                    record,
                });
            }
        }
        let usage = self.publish(&state.manager);
        if outcome.compaction_required() {
            self.handler
                .on_event(&ContextEvent::CompactionRequired { usage: &usage });
        }
        outcome
    }

    /// Compact up to the default boundary (everything before the most
    /// recent user turn).
    pub async fn compact(&self) -> Result<CompactionApplied, CompactionError> {
        self.compact_through(None).await
    }

    /// Compact `0..=up_to_index`, adjusted so no tool pair is split.
    pub async fn compact_up_to(
        &self,
        up_to_index: usize,
    ) -> Result<CompactionApplied, CompactionError> {
        self.compact_through(Some(up_to_index)).await
    }

    async fn compact_through(
        &self,
        up_to_index: Option<usize>,
    ) -> Result<CompactionApplied, CompactionError> {
        let mut state = self.state.lock().await;
        let SessionState {
            manager,
            engine,
            tracker,
        } = &mut *state;

        let result = self.run_compaction(manager, engine, up_to_index).await;
        let usage = self.publish(manager);
        match &result {
            Ok(applied) => {
                tracker.record_compaction();
                self.handler.on_event(&ContextEvent::Compacted {
                    record: &applied.record,
                    usage: &usage,
                });
            }
            Err(error) => {
                warn!(backend = self.backend.name(), "compaction failed: {error}");
                self.handler
                    .on_event(&ContextEvent::CompactionFailed { error });
            }
        }
        result
    }

    async fn run_compaction(
        &self,
        manager: &mut ContextManager,
        engine: &CompactionEngine,
        up_to_index: Option<usize>,
    ) -> Result<CompactionApplied, CompactionError> {
        let up_to = up_to_index
            .or_else(|| engine.suggest_boundary(manager.items()))
            .ok_or_else(|| CompactionError::NothingToCompact {
                reason: format!("{} items, none before the retained suffix", manager.len()),
            })?;

        let pending = engine.compact(manager.items(), up_to, self.backend.as_ref());
        let summary = match self.compaction_timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| CompactionError::Backend(SummaryError::Timeout(limit)))??,
            None => pending.await?,
        };
        Ok(manager.apply_compaction(&summary)?)
    }

    /// Record API-reported usage for the turn that just finished.
    pub async fn record_turn_usage(&self, input_tokens: usize, output_tokens: usize) {
        self.state
            .lock()
            .await
            .tracker
            .record_turn(input_tokens, output_tokens);
    }

    /// Turns of average size left before the window (minus the output
    /// reserve) fills.
    pub async fn estimate_remaining_turns(&self) -> usize {
        let state = self.state.lock().await;
        let window = state.manager.model_context_window();
        let reserved = (window as f64 * OUTPUT_RESERVE_FRACTION) as usize;
        state.tracker.estimate_remaining_turns(window, reserved)
    }

    /// The usage published after the last completed mutation. Does not wait
    /// for an in-flight compaction.
    pub fn snapshot(&self) -> UsageSnapshot {
        self.usage.borrow().clone()
    }

    /// A receiver that sees every published [`UsageSnapshot`].
    pub fn subscribe(&self) -> watch::Receiver<UsageSnapshot> {
        self.usage.subscribe()
    }

    fn publish(&self, manager: &ContextManager) -> UsageSnapshot {
        let usage = manager.snapshot();
        self.usage.send_replace(usage.clone());
        usage
    }

    /// A copy of the current item sequence.
    pub async fn items(&self) -> Vec<ConversationItem> {
        self.state.lock().await.manager.items().to_vec()
    }

    /// The audit trail as JSON Lines.
    pub async fn audit_jsonl(&self) -> Result<String, serde_json::Error> {
        self.state.lock().await.manager.audit().to_jsonl()
    }
}

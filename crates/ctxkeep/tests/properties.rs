//! Properties that must hold for any input.

use ctxkeep::context::truncate::truncate;
use ctxkeep::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    User(usize),
    Assistant(usize),
    /// A call immediately followed by its result.
    ToolPair(usize, usize),
    /// Compact up to this fraction (in percent) of the sequence.
    Compact(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (1..400usize).prop_map(Step::User),
        (1..2_000usize).prop_map(Step::Assistant),
        (1..200usize, 1..3_000usize).prop_map(|(c, r)| Step::ToolPair(c, r)),
        (0..100usize).prop_map(Step::Compact),
    ]
}

fn output_text() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9 .:/]{0,120}", 0..200).prop_map(|lines| lines.join("\n"))
}

/// Run the steps; return the manager and the number of compactions applied.
fn run_steps(steps: &[Step], window: usize) -> (ContextManager, usize) {
    let mut manager = ContextManager::new(window);
    let engine = CompactionEngine::new();
    let mut applied = 0;

    for (n, step) in steps.iter().enumerate() {
        match *step {
            Step::User(t) => {
                let _ = manager.add_item(ConversationItem::user("go").with_estimated_tokens(t));
            }
            Step::Assistant(t) => {
                let _ = manager.add_item(ConversationItem::assistant("ok").with_estimated_tokens(t));
            }
            Step::ToolPair(c, r) => {
                let id = format!("call_{n}");
                let _ = manager
                    .add_item(ConversationItem::tool_call(&id, "shell ls").with_estimated_tokens(c));
                let _ = manager
                    .add_item(ConversationItem::tool_result(&id, "a.rs b.rs").with_estimated_tokens(r));
            }
            Step::Compact(percent) => {
                let up_to = manager.len() * percent / 100;
                let Ok((first, last)) = engine.select_range(manager.items(), up_to) else {
                    continue;
                };
                let Some(original) = manager.range_tokens(first, last) else {
                    continue;
                };
                let summary = CompactionSummary::new("Summary: earlier work.", first, last, original);
                if manager.apply_compaction(&summary).is_ok() {
                    applied += 1;
                }
            }
        }
    }
    (manager, applied)
}

proptest! {
    #[test]
    fn output_within_limit_is_untouched(content in output_text(), extra in 0..4_096usize) {
        let limit = (content.len() + extra).max(256);
        let (out, record) = truncate(&content, limit);
        prop_assert_eq!(out.as_ref(), content.as_str());
        prop_assert!(record.is_none());
    }

    #[test]
    fn truncation_respects_limit_and_is_a_fixed_point(
        content in output_text(),
        limit in 256..4_096usize,
    ) {
        let (once, record) = truncate(&content, limit);
        prop_assert!(once.len() <= limit);
        if let Some(record) = record {
            prop_assert_eq!(record.original_bytes, content.len());
            prop_assert_eq!(record.retained_bytes + record.omitted_bytes, content.len());
        }

        let (twice, again) = truncate(&once, limit);
        prop_assert_eq!(twice.as_ref(), once.as_ref());
        prop_assert!(again.is_none());
    }

    #[test]
    fn cumulative_tokens_never_drift(steps in prop::collection::vec(step(), 1..60)) {
        let (manager, _) = run_steps(&steps, 1_000_000);
        let summed: usize = manager.items().iter().map(|i| i.estimated_tokens).sum();
        prop_assert_eq!(manager.cumulative_tokens(), summed);
    }

    #[test]
    fn compaction_never_splits_tool_pairs(steps in prop::collection::vec(step(), 1..60)) {
        let (manager, _) = run_steps(&steps, 1_000_000);
        let items = manager.items();
        for (i, item) in items.iter().enumerate() {
            match item.role {
                Role::ToolCall => {
                    let id = item.tool_call_id.as_deref();
                    prop_assert!(
                        items[i + 1..].iter().any(|r| r.role == Role::ToolResult
                            && r.tool_call_id.as_deref() == id),
                        "call {:?} lost its result", id
                    );
                }
                Role::ToolResult => {
                    let id = item.tool_call_id.as_deref();
                    prop_assert!(
                        items[..i].iter().any(|c| c.role == Role::ToolCall
                            && c.tool_call_id.as_deref() == id),
                        "result {:?} lost its call", id
                    );
                }
                _ => {}
            }
        }
        for record in manager.audit().compactions() {
            prop_assert_eq!(record.dropped_orphans, 0);
        }
    }

    #[test]
    fn signal_matches_threshold(
        tokens in prop::collection::vec(1..5_000usize, 1..40),
        window in 10_000..200_000usize,
        ratio in 0.1..1.0f64,
    ) {
        let mut manager = ContextManager::new(window).with_threshold_ratio(ratio);
        let threshold = manager.threshold_tokens();
        prop_assert!(threshold as f64 >= window as f64 * ratio - 1e-6);

        for t in tokens {
            let outcome = manager.add_item(ConversationItem::assistant("x").with_estimated_tokens(t));
            prop_assert_eq!(
                outcome.compaction_required(),
                manager.cumulative_tokens() >= threshold
            );
        }
    }
}

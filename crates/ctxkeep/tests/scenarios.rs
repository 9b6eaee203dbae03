//! End-to-end scenarios across the estimator, truncator, manager,
//! compaction engine, and instruction loader.

use std::fs;
use std::sync::Arc;

use ctxkeep::context::audit::AuditEntry;
use ctxkeep::prelude::*;

/// Filler text whose content is irrelevant; token counts are set explicitly.
fn turn_text(i: usize) -> String {
    format!("step {i}: edited src/module_{i}.rs and re-ran the tests")
}

#[tokio::test]
async fn fifty_thousand_tokens_trigger_compaction_and_shrink_tenfold() {
    // 100k window at 0.70 puts the threshold at 70k; instructions take 20k.
    let mut manager = ContextManager::new(100_000).with_instruction_tokens(20_000);

    let mut signals = Vec::new();
    for i in 0..50 {
        let item = match i {
            0 => ConversationItem::user("Migrate the storage layer to the new API"),
            49 => ConversationItem::user("Now update the docs"),
            _ => ConversationItem::assistant(turn_text(i)),
        }
        .with_estimated_tokens(1_000);
        signals.push(manager.add_item(item).compaction_required());
    }

    assert_eq!(manager.cumulative_tokens(), 50_000);
    assert_eq!(signals.iter().filter(|s| **s).count(), 1);
    assert!(signals[49], "the 50,000th token is the one that signals");

    let engine = CompactionEngine::new();
    let up_to = engine.suggest_boundary(manager.items()).unwrap();
    assert_eq!(up_to, 48);

    let summary = engine
        .compact(manager.items(), up_to, &ExtractiveSummarizer::new())
        .await
        .unwrap();
    assert_eq!(summary.original_tokens, 49_000);
    assert!(summary.summary_tokens < 4_900);
    assert!(summary.compression_ratio() >= 10.0);

    let applied = manager.apply_compaction(&summary).unwrap();
    assert_eq!(manager.len(), 2);
    assert_eq!(manager.items()[0].role, Role::Summary);
    assert_eq!(manager.items()[1].content, "Now update the docs");
    assert!(applied.usage.cumulative_tokens < 6_000);

    let summed: usize = manager.items().iter().map(|i| i.estimated_tokens).sum();
    assert_eq!(manager.cumulative_tokens(), summed);
}

#[test]
fn forty_kib_tool_output_is_cut_to_ten_kib_with_a_record() {
    let mut output: String = (0..2_000)
        .map(|i| format!("test suite::case_{i:04} ... ok (0.{i:03}s)\n"))
        .collect();
    output.truncate(40 * 1024);
    assert_eq!(output.len(), 40 * 1024);

    let mut manager = ContextManager::default();
    let _ = manager.add_item(ConversationItem::tool_call("c1", "shell cargo test"));
    let _ = manager.add_item(ConversationItem::tool_result("c1", output.as_str()));

    let item = &manager.items()[1];
    assert!(item.truncated);
    assert!(item.content.len() <= 10 * 1024);
    assert!(item.content.contains("[... omitted "));
    assert!(item.content.starts_with("test suite::case_0000"));

    let records: Vec<_> = manager.audit().truncations().collect();
    assert_eq!(records.len(), 1);
    let record = records[0];
    assert_eq!(record.original_bytes, 40 * 1024);
    assert!(record.omitted_bytes >= 30 * 1024 && record.omitted_bytes < 31 * 1024);
    assert_eq!(record.limit_bytes, 10 * 1024);
    assert!(matches!(
        manager.audit().entries()[0],
        AuditEntry::Truncation { ref tool_call_id, .. } if tool_call_id.as_deref() == Some("c1")
    ));
}

#[test]
fn small_instruction_layers_merge_untouched() {
    let global = "g".repeat(2 * 1024);
    let project = "p".repeat(1024);
    let local = "l".repeat(1024);

    let set = InstructionLoader::new()
        .merge(Some(&global), Some(&project), Some(&local))
        .unwrap();

    assert!(!set.was_trimmed());
    assert_eq!(set.global.as_deref(), Some(global.as_str()));
    assert_eq!(set.project.as_deref(), Some(project.as_str()));
    assert_eq!(set.local.as_deref(), Some(local.as_str()));
    assert!(set.merged.len() < 5 * 1024);

    let g = set.merged.find(&global).unwrap();
    let p = set.merged.find(&project).unwrap();
    let l = set.merged.find(&local).unwrap();
    assert!(g < p && p < l, "global, then project, then local");
}

#[test]
fn oversized_local_instructions_abort_startup() {
    let home = tempfile::tempdir().unwrap();
    let repo = tempfile::tempdir().unwrap();
    fs::create_dir(repo.path().join(".git")).unwrap();
    fs::write(repo.path().join("AGENTS.md"), "Use rustfmt.").unwrap();
    fs::write(repo.path().join("AGENTS.local.md"), "x".repeat(40 * 1024)).unwrap();

    let paths = InstructionPaths::discover_with_home(repo.path(), Some(home.path()));
    let err = InstructionLoader::new().load(&paths).unwrap_err();

    match err {
        InstructionError::ConfigTooLarge {
            local_bytes,
            ceiling,
            path,
        } => {
            assert_eq!(local_bytes, 40 * 1024);
            assert_eq!(ceiling, 32 * 1024);
            assert!(path.unwrap().ends_with("AGENTS.local.md"));
        }
        other => panic!("expected ConfigTooLarge, got {other:?}"),
    }
}

#[tokio::test]
async fn session_compacts_without_splitting_tool_pairs() {
    let session = Session::new(
        ContextManager::new(2_000),
        CompactionEngine::new(),
        Arc::new(ExtractiveSummarizer::new()),
    );

    let _ = session
        .add_item(ConversationItem::user("Find the slow query").with_estimated_tokens(100))
        .await;
    let _ = session
        .add_item(ConversationItem::tool_call("q1", "grep -rn SELECT").with_estimated_tokens(50))
        .await;
    let _ = session
        .add_item(ConversationItem::tool_result("q1", "db.rs:12: SELECT *").with_estimated_tokens(900))
        .await;
    let _ = session
        .add_item(ConversationItem::tool_call("q2", "read_file db.rs").with_estimated_tokens(50))
        .await;

    // The most recent item stays; q2's call is still waiting for its result
    // and survives the compaction.
    let applied = session.compact_up_to(3).await.unwrap();
    assert_eq!(applied.record.last_index, 2);
    assert_eq!(applied.record.dropped_orphans, 0);

    let items = session.items().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].role, Role::Summary);
    assert_eq!(items[1].tool_call_id.as_deref(), Some("q2"));

    let outcome = session
        .add_item(ConversationItem::tool_result("q2", "fn query() {}").with_estimated_tokens(10))
        .await;
    assert!(!outcome.compaction_required());
}

#[tokio::test]
async fn repeated_compaction_merges_earlier_summary() {
    let mut manager = ContextManager::new(10_000);
    let engine = CompactionEngine::new();
    let backend = ExtractiveSummarizer::new();

    for round in 0..2 {
        let _ = manager.add_item(
            ConversationItem::user(format!("task {round}: refactor module {round}"))
                .with_estimated_tokens(500),
        );
        for i in 0..4 {
            let _ = manager
                .add_item(ConversationItem::assistant(turn_text(i)).with_estimated_tokens(500));
        }
        let _ = manager.add_item(ConversationItem::user("continue").with_estimated_tokens(10));

        let up_to = engine.suggest_boundary(manager.items()).unwrap();
        let summary = engine.compact(manager.items(), up_to, &backend).await.unwrap();
        manager.apply_compaction(&summary).unwrap();
    }

    let summaries = manager
        .items()
        .iter()
        .filter(|i| i.role == Role::Summary)
        .count();
    assert_eq!(summaries, 1, "the second compaction absorbs the first summary");
    assert_eq!(manager.audit().compactions().count(), 2);

    let merged = &manager.items()[0].content;
    assert!(merged.contains("Task: task 0: refactor module 0"), "{merged}");
    assert!(merged.contains("- user: task 1: refactor module 1"), "{merged}");
}

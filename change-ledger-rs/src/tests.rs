use std::fs;

use uuid::Uuid;

use crate::{ChangeStatus, ChangeType, CodeChangeTracker, Finalization, LedgerError};

fn passing(content: &str) -> Finalization {
    Finalization {
        tests_generated: vec!["test_parses_header".to_string()],
        tests_passed: Some(true),
        after_content: content.as_bytes().to_vec(),
    }
}

#[test]
fn track_existing_file_captures_before_snapshot() {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("src/notes.rs");
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, "fn old() {}\n").unwrap();

    let ledger = CodeChangeTracker::open(tmp.path().join("ledger")).unwrap();
    let id = ledger
        .track(&target, "rename helper", ChangeType::Refactor, None)
        .unwrap();

    let change = ledger.change(id).unwrap();
    assert_eq!(change.status, ChangeStatus::Proposed);
    assert_eq!(change.change_type, ChangeType::Refactor);
    let before = change.before_snapshot.clone().unwrap();
    assert_eq!(change.checksum, before.checksum);
    assert_eq!(before.size, 12);
    assert_eq!(ledger.snapshot_content(&before).unwrap(), b"fn old() {}\n");
    assert!(ledger.snapshots_dir().join(&before.checksum).exists());
}

#[test]
fn track_missing_file_forces_create() {
    let tmp = tempfile::tempdir().unwrap();
    let ledger = CodeChangeTracker::open(tmp.path().join("ledger")).unwrap();
    let id = ledger
        .track(tmp.path().join("new.rs"), "new module", ChangeType::Feature, None)
        .unwrap();

    let change = ledger.change(id).unwrap();
    assert_eq!(change.change_type, ChangeType::Create);
    assert!(change.before_snapshot.is_none());
}

#[test]
fn finalize_with_passing_tests_marks_tested() {
    let tmp = tempfile::tempdir().unwrap();
    let ledger = CodeChangeTracker::open(tmp.path().join("ledger")).unwrap();
    let id = ledger
        .track(tmp.path().join("a.rs"), "add a", ChangeType::Create, None)
        .unwrap();

    let change = ledger.finalize(id, passing("fn a() {}\n")).unwrap();
    assert_eq!(change.status, ChangeStatus::Tested);
    assert!(!change.needs_review);
    assert!(change.after_snapshot.is_some());
    assert!(change.finalized_at.is_some());

    // Finalizing twice is not allowed once tested.
    assert!(matches!(
        ledger.finalize(id, passing("fn a() {}\n")),
        Err(LedgerError::InvalidTransition { .. })
    ));
}

#[test]
fn finalize_without_passing_tests_flags_for_review() {
    let tmp = tempfile::tempdir().unwrap();
    let ledger = CodeChangeTracker::open(tmp.path().join("ledger")).unwrap();
    let id = ledger
        .track(tmp.path().join("b.rs"), "add b", ChangeType::Create, None)
        .unwrap();

    let change = ledger
        .finalize(
            id,
            Finalization {
                tests_generated: vec![],
                tests_passed: Some(false),
                after_content: b"fn b( {".to_vec(),
            },
        )
        .unwrap();
    assert_eq!(change.status, ChangeStatus::Proposed);
    assert!(change.needs_review);

    assert!(matches!(
        ledger.apply(id),
        Err(LedgerError::InvalidTransition { action: "apply", .. })
    ));
}

#[test]
fn apply_writes_after_content() {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("generated/c.rs");
    let ledger = CodeChangeTracker::open(tmp.path().join("ledger")).unwrap();
    let id = ledger.track(&target, "add c", ChangeType::Create, None).unwrap();
    ledger.finalize(id, passing("fn c() {}\n")).unwrap();

    let applied = ledger.apply(id).unwrap();
    assert_eq!(applied.status, ChangeStatus::Applied);
    assert!(applied.applied_at.is_some());
    assert_eq!(fs::read_to_string(&target).unwrap(), "fn c() {}\n");
}

#[test]
fn rollback_restores_exact_bytes() {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("data.bin");
    let original: Vec<u8> = vec![0, 159, 146, 150, b'\r', b'\n', 255];
    fs::write(&target, &original).unwrap();

    let ledger = CodeChangeTracker::open(tmp.path().join("ledger")).unwrap();
    let id = ledger.track(&target, "rewrite", ChangeType::Modify, None).unwrap();
    ledger.finalize(id, passing("replaced")).unwrap();
    ledger.apply(id).unwrap();
    assert_eq!(fs::read(&target).unwrap(), b"replaced");

    let rolled = ledger.rollback(id, "regressed startup").unwrap();
    assert_eq!(rolled.status, ChangeStatus::RolledBack);
    assert_eq!(rolled.rollback_reason.as_deref(), Some("regressed startup"));
    assert!(rolled.rolled_back_at.is_some());
    assert_eq!(fs::read(&target).unwrap(), original);

    // The record is retained for audit.
    assert_eq!(ledger.changes().len(), 1);
    assert!(matches!(
        ledger.rollback(id, "again"),
        Err(LedgerError::InvalidTransition { .. })
    ));
}

#[test]
fn rollback_of_create_deletes_file() {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("fresh.rs");
    let ledger = CodeChangeTracker::open(tmp.path().join("ledger")).unwrap();
    let id = ledger.track(&target, "fresh", ChangeType::Create, None).unwrap();
    ledger.finalize(id, passing("fn fresh() {}")).unwrap();
    ledger.apply(id).unwrap();
    assert!(target.exists());

    ledger.rollback(id, "not needed").unwrap();
    assert!(!target.exists());
}

#[test]
fn rollback_requires_reason() {
    let tmp = tempfile::tempdir().unwrap();
    let ledger = CodeChangeTracker::open(tmp.path().join("ledger")).unwrap();
    let id = ledger
        .track(tmp.path().join("x.rs"), "x", ChangeType::Create, None)
        .unwrap();
    assert!(matches!(
        ledger.rollback(id, "  "),
        Err(LedgerError::InvalidInput(_))
    ));
}

#[test]
fn unknown_change_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let ledger = CodeChangeTracker::open(tmp.path().join("ledger")).unwrap();
    let id = Uuid::new_v4();
    assert!(matches!(ledger.apply(id), Err(LedgerError::NotFound(found)) if found == id));
}

#[test]
fn statistics_summarize_changes() {
    let tmp = tempfile::tempdir().unwrap();
    let existing = tmp.path().join("existing.rs");
    fs::write(&existing, "old").unwrap();
    let ledger = CodeChangeTracker::open(tmp.path().join("ledger")).unwrap();

    let a = ledger.track(tmp.path().join("a.rs"), "a", ChangeType::Create, None).unwrap();
    ledger.finalize(a, passing("a")).unwrap();
    let b = ledger.track(&existing, "b", ChangeType::Fix, None).unwrap();
    ledger
        .finalize(
            b,
            Finalization {
                tests_generated: vec![],
                tests_passed: Some(false),
                after_content: b"broken".to_vec(),
            },
        )
        .unwrap();
    ledger.rollback(b, "tests failed").unwrap();
    ledger.track(tmp.path().join("c.rs"), "c", ChangeType::Create, None).unwrap();

    let stats = ledger.statistics();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_type.get(&ChangeType::Create), Some(&2));
    assert_eq!(stats.by_type.get(&ChangeType::Fix), Some(&1));
    assert_eq!(stats.by_status.get(&ChangeStatus::Tested), Some(&1));
    assert_eq!(stats.by_status.get(&ChangeStatus::RolledBack), Some(&1));
    assert_eq!(stats.by_status.get(&ChangeStatus::Proposed), Some(&1));
    assert_eq!(stats.tested, 2);
    assert_eq!(stats.pass_rate, Some(0.5));
    assert_eq!(stats.rollbacks, 1);
}

#[test]
fn changelog_groups_by_proposal_and_day() {
    let tmp = tempfile::tempdir().unwrap();
    let ledger = CodeChangeTracker::open(tmp.path().join("ledger")).unwrap();
    let proposal = Uuid::new_v4();

    let a = ledger
        .track(tmp.path().join("video.rs"), "video trimming", ChangeType::Create, Some(proposal))
        .unwrap();
    ledger.finalize(a, passing("fn trim() {}")).unwrap();
    ledger
        .track(tmp.path().join("misc.rs"), "tidy imports", ChangeType::Create, None)
        .unwrap();

    let text = ledger.generate_changelog().unwrap();
    assert!(text.starts_with("# Changelog"));
    assert!(text.contains(&format!("## Proposal {proposal}")));
    assert!(text.contains("video trimming"));
    assert!(text.contains("tests: passed, 1 generated"));
    assert!(text.contains("## Changes on "));
    assert!(text.contains("tidy imports (tests: not run, status: PROPOSED)"));
    assert_eq!(fs::read_to_string(ledger.changelog_path()).unwrap(), text);
}

#[test]
fn changes_for_proposal_filters() {
    let tmp = tempfile::tempdir().unwrap();
    let ledger = CodeChangeTracker::open(tmp.path().join("ledger")).unwrap();
    let proposal = Uuid::new_v4();
    ledger
        .track(tmp.path().join("a.rs"), "a", ChangeType::Create, Some(proposal))
        .unwrap();
    ledger
        .track(tmp.path().join("b.rs"), "b", ChangeType::Create, None)
        .unwrap();
    assert_eq!(ledger.changes_for_proposal(proposal).len(), 1);
}

//! Engine-level integration tests: snapshot isolation, conflicts,
//! constraints, vacuum safety, checkpoint durability and column
//! chunk handling together.

use std::sync::Arc;

use heron_common::{
    CancelSignal, CollectionFullName, Datum, EngineConfig, ExecutionContext, OwnedRow, RowId,
    SequenceNumber, SessionId, StorageError, TransactionData, TxnError, TxnId,
};

use crate::checkpoint::{FileDurableStore, MemoryDurableStore};
use crate::constraint::TableConstraint;
use crate::engine::StorageEngine;
use crate::schema::Schema;
use crate::vacuum::FixedHorizon;

fn users_name() -> CollectionFullName {
    CollectionFullName::parse("app.users").unwrap()
}

fn users_schema() -> Schema {
    Schema::new(vec!["id", "email", "age"])
}

fn users_constraints() -> Vec<TableConstraint> {
    vec![
        TableConstraint::PrimaryKey {
            columns: vec!["id".to_string()],
        },
        TableConstraint::Unique {
            name: "users_email_key".to_string(),
            columns: vec!["email".to_string()],
        },
        TableConstraint::Check {
            name: "users_age_check".to_string(),
            expression: "age >= 0 AND age < 200".to_string(),
        },
    ]
}

fn new_engine() -> Arc<StorageEngine> {
    let engine = StorageEngine::new(
        EngineConfig::default(),
        Arc::new(MemoryDurableStore::new()),
    )
    .unwrap();
    engine
        .create_collection(users_name(), users_schema(), users_constraints())
        .unwrap();
    Arc::new(engine)
}

fn user(id: i64, email: &str, age: i64) -> OwnedRow {
    OwnedRow::new(vec![
        Datum::Int64(id),
        Datum::Text(email.to_string()),
        Datum::Int64(age),
    ])
}

fn ctx(engine: &StorageEngine, txn_id: u64) -> ExecutionContext {
    let txn = TransactionData::new(TxnId(txn_id), engine.sequence().current());
    ExecutionContext::new(SessionId(1), txn, users_name())
}

/// Advance the committed sequence with empty (read-only) commits.
fn advance_sequence_to(engine: &StorageEngine, target: u64) {
    let mut filler = 9_000;
    while engine.sequence().current().0 < target {
        filler += 1;
        let txn = TransactionData::new(TxnId(filler), engine.sequence().current());
        engine.commit_txn(&txn).unwrap();
    }
}

#[test]
fn test_snapshot_scenario_three_transactions() {
    let engine = new_engine();
    advance_sequence_to(&engine, 10);

    // A and B both start at sequence 10.
    let ctx_a = ctx(&engine, 1);
    let ctx_b = ctx(&engine, 2);
    assert_eq!(ctx_a.txn.start_sequence, SequenceNumber(10));
    assert_eq!(ctx_b.txn.start_sequence, SequenceNumber(10));

    // A writes R1; B sees NotFound before A commits.
    engine.put(&ctx_a, RowId(1), user(1, "a@example.com", 30)).unwrap();
    assert!(matches!(
        engine.get(&ctx_b, RowId(1)),
        Err(StorageError::NotFound { .. })
    ));

    // A commits at sequence 11; B still sees NotFound.
    let seq = engine.commit_txn(&ctx_a.txn).unwrap();
    assert_eq!(seq, SequenceNumber(11));
    assert!(matches!(
        engine.get(&ctx_b, RowId(1)),
        Err(StorageError::NotFound { .. })
    ));

    // C starts at sequence 11 and sees A's payload.
    let ctx_c = ctx(&engine, 3);
    assert_eq!(ctx_c.txn.start_sequence, SequenceNumber(11));
    assert_eq!(
        engine.get(&ctx_c, RowId(1)).unwrap(),
        user(1, "a@example.com", 30)
    );
}

#[test]
fn test_read_your_own_writes() {
    let engine = new_engine();
    let c = ctx(&engine, 1);
    engine.put(&c, RowId(1), user(1, "me@example.com", 20)).unwrap();
    assert_eq!(engine.get(&c, RowId(1)).unwrap(), user(1, "me@example.com", 20));

    engine.delete(&c, RowId(1)).unwrap();
    assert!(engine.get(&c, RowId(1)).is_err());
}

#[test]
fn test_unique_constraint_names_email_column() {
    let engine = new_engine();
    let a = ctx(&engine, 1);
    engine.put(&a, RowId(1), user(1, "dup@example.com", 30)).unwrap();
    engine.commit_txn(&a.txn).unwrap();

    let b = ctx(&engine, 2);
    let err = engine
        .put(&b, RowId(2), user(2, "dup@example.com", 40))
        .unwrap_err();
    match err {
        TxnError::ConstraintViolation { name, columns, .. } => {
            assert_eq!(name, "users_email_key");
            assert_eq!(columns, vec!["email".to_string()]);
        }
        other => panic!("expected constraint violation, got {other:?}"),
    }
    // The failed mutation left no pending version behind.
    assert_eq!(engine.written_rows(b.txn.txn_id), 0);
}

#[test]
fn test_unique_constraint_sees_own_pending_writes() {
    let engine = new_engine();
    let c = ctx(&engine, 1);
    engine.put(&c, RowId(1), user(1, "x@example.com", 30)).unwrap();
    let err = engine
        .put(&c, RowId(2), user(2, "x@example.com", 31))
        .unwrap_err();
    assert!(matches!(err, TxnError::ConstraintViolation { .. }));
}

#[test]
fn test_unique_constraint_ignores_invisible_writers() {
    let engine = new_engine();
    let pending = ctx(&engine, 1);
    engine
        .put(&pending, RowId(1), user(1, "ghost@example.com", 30))
        .unwrap();

    // Another transaction cannot see that pending row, so its own
    // insert of the same email passes validation.
    let other = ctx(&engine, 2);
    engine
        .put(&other, RowId(2), user(2, "ghost@example.com", 31))
        .unwrap();
}

#[test]
fn test_check_constraint_rejects_row() {
    let engine = new_engine();
    let c = ctx(&engine, 1);
    let err = engine.put(&c, RowId(1), user(1, "kid@example.com", -1)).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("users_age_check"));

    let err = engine
        .put(
            &c,
            RowId(1),
            OwnedRow::new(vec![
                Datum::Int64(1),
                Datum::Text("n@example.com".into()),
                Datum::Null,
            ]),
        )
        .unwrap_err();
    assert!(matches!(err, TxnError::ConstraintViolation { .. }));
}

#[test]
fn test_write_conflict_fails_fast() {
    let engine = new_engine();
    let a = ctx(&engine, 1);
    let b = ctx(&engine, 2);
    engine.put(&a, RowId(1), user(1, "a@example.com", 30)).unwrap();
    let err = engine.put(&b, RowId(1), user(1, "b@example.com", 31)).unwrap_err();
    match err {
        TxnError::Storage(StorageError::WriteConflict { holder, .. }) => {
            assert_eq!(holder, TxnId(1));
        }
        other => panic!("expected write conflict, got {other:?}"),
    }
}

#[test]
fn test_commit_conflict_after_overlapping_commit() {
    let engine = new_engine();
    let a = ctx(&engine, 1);
    let b = ctx(&engine, 2);

    engine.put(&a, RowId(1), user(1, "a@example.com", 30)).unwrap();
    engine.commit_txn(&a.txn).unwrap();

    // B overlapped A and writes the same row after A's commit.
    engine.put(&b, RowId(1), user(1, "b@example.com", 31)).unwrap();
    let err = engine.commit_txn(&b.txn).unwrap_err();
    assert!(matches!(err, TxnError::CommitConflict { .. }));

    // The failed commit leaves the pending version for abort to clean.
    engine.abort_txn(b.txn.txn_id);
    let reader = ctx(&engine, 3);
    assert_eq!(
        engine.get(&reader, RowId(1)).unwrap(),
        user(1, "a@example.com", 30)
    );
}

#[test]
fn test_abort_restores_prior_version() {
    let engine = new_engine();
    let a = ctx(&engine, 1);
    engine.put(&a, RowId(1), user(1, "v1@example.com", 30)).unwrap();
    engine.commit_txn(&a.txn).unwrap();

    let b = ctx(&engine, 2);
    engine.put(&b, RowId(1), user(1, "v2@example.com", 31)).unwrap();
    engine.abort_txn(b.txn.txn_id);

    let reader = ctx(&engine, 3);
    assert_eq!(
        engine.get(&reader, RowId(1)).unwrap(),
        user(1, "v1@example.com", 30)
    );
}

#[test]
fn test_vacuum_preserves_reads_at_horizon() {
    let engine = new_engine();

    // Three committed versions of R1.
    for (txn_id, email) in [(1u64, "v1@x.com"), (2, "v2@x.com"), (3, "v3@x.com")] {
        let c = ctx(&engine, txn_id);
        engine.put(&c, RowId(1), user(1, email, 30)).unwrap();
        engine.commit_txn(&c.txn).unwrap();
    }
    // A reader that started between the second and third commit.
    let mid_reader = ExecutionContext::new(
        SessionId(1),
        TransactionData::new(TxnId(10), SequenceNumber(2)),
        users_name(),
    );
    let before = engine.get(&mid_reader, RowId(1)).unwrap();
    assert_eq!(before, user(1, "v2@x.com", 30));

    // Horizon at that reader's snapshot: only the oldest version can
    // go.
    let report = engine
        .vacuum_sweep(&FixedHorizon(SequenceNumber(2)), &CancelSignal::new())
        .unwrap();
    assert_eq!(report.versions_removed, 1);

    // Reads at or above the horizon are unchanged.
    assert_eq!(engine.get(&mid_reader, RowId(1)).unwrap(), before);
    let fresh = ctx(&engine, 11);
    assert_eq!(engine.get(&fresh, RowId(1)).unwrap(), user(1, "v3@x.com", 30));
}

#[test]
fn test_vacuum_never_removes_sole_version() {
    let engine = new_engine();
    let c = ctx(&engine, 1);
    engine.put(&c, RowId(1), user(1, "only@x.com", 30)).unwrap();
    engine.commit_txn(&c.txn).unwrap();

    let report = engine
        .vacuum_sweep(&FixedHorizon(SequenceNumber::MAX), &CancelSignal::new())
        .unwrap();
    assert_eq!(report.versions_removed, 0);

    let reader = ctx(&engine, 2);
    assert!(engine.get(&reader, RowId(1)).is_ok());
}

#[test]
fn test_vacuum_reports_stale_pending_heads() {
    let engine = new_engine();
    let abandoned = ctx(&engine, 1);
    engine
        .put(&abandoned, RowId(1), user(1, "gone@x.com", 30))
        .unwrap();

    // Default staleness threshold is three sweeps.
    let horizon = FixedHorizon(SequenceNumber(0));
    let cancel = CancelSignal::new();
    let mut last = 0;
    for _ in 0..3 {
        last = engine.vacuum_sweep(&horizon, &cancel).unwrap().stale_pending_heads;
    }
    assert_eq!(last, 1);

    // The pending head itself is untouched.
    assert!(engine.get(&abandoned, RowId(1)).is_ok());
}

#[test]
fn test_vacuum_cancellation_is_clean() {
    let engine = new_engine();
    for i in 0..5u64 {
        let c = ctx(&engine, i + 1);
        engine
            .put(&c, RowId(i), user(i as i64, &format!("u{i}@x.com"), 30))
            .unwrap();
        engine.commit_txn(&c.txn).unwrap();
    }
    let cancel = CancelSignal::new();
    cancel.cancel();
    let err = engine
        .vacuum_sweep(&FixedHorizon(SequenceNumber::MAX), &cancel)
        .unwrap_err();
    assert!(matches!(err, StorageError::Cancelled { .. }));

    // Everything still reads fine afterwards.
    let reader = ctx(&engine, 99);
    for i in 0..5u64 {
        assert!(engine.get(&reader, RowId(i)).is_ok());
    }
}

#[test]
fn test_checkpoint_flushes_and_is_idempotent() {
    let engine = new_engine();
    let control = ExecutionContext::control(
        SessionId(9),
        TransactionData::new(TxnId(900), SequenceNumber(0)),
        users_name(),
    );
    let cancel = CancelSignal::new();

    let a = ctx(&engine, 1);
    engine.put(&a, RowId(1), user(1, "a@x.com", 30)).unwrap();
    engine.commit_txn(&a.txn).unwrap();

    let report = engine.run_checkpoint(&control, &cancel).unwrap();
    assert!(report.advanced);
    assert_eq!(report.versions_flushed, 1);

    // Same watermark again: nothing to do.
    let report = engine.run_checkpoint(&control, &cancel).unwrap();
    assert!(!report.advanced);
    assert_eq!(report.versions_flushed, 0);

    // New commit, new checkpoint: only the delta is flushed.
    let b = ctx(&engine, 2);
    engine.put(&b, RowId(2), user(2, "b@x.com", 31)).unwrap();
    engine.commit_txn(&b.txn).unwrap();
    let report = engine.run_checkpoint(&control, &cancel).unwrap();
    assert!(report.advanced);
    assert_eq!(report.versions_flushed, 1);
}

#[test]
fn test_checkpoint_cursor_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let durable = Arc::new(FileDurableStore::open(dir.path()).unwrap());
        let engine = StorageEngine::new(EngineConfig::default(), durable).unwrap();
        engine
            .create_collection(users_name(), users_schema(), vec![])
            .unwrap();
        let c = ctx(&engine, 1);
        engine.put(&c, RowId(1), user(1, "a@x.com", 30)).unwrap();
        engine.commit_txn(&c.txn).unwrap();
        let control = ExecutionContext::control(
            SessionId(9),
            TransactionData::new(TxnId(900), SequenceNumber(0)),
            users_name(),
        );
        engine.run_checkpoint(&control, &CancelSignal::new()).unwrap();
    }

    let durable = Arc::new(FileDurableStore::open(dir.path()).unwrap());
    let records = durable.replay().unwrap();
    assert_eq!(records.len(), 1);

    // A restarted engine resumes its sequence from the durable cursor,
    // so new commits never reuse a flushed sequence number.
    let engine = StorageEngine::new(EngineConfig::default(), durable).unwrap();
    assert_eq!(engine.sequence().current(), SequenceNumber(1));
    assert_eq!(
        engine.checkpoint_coordinator().cursor(),
        SequenceNumber(1)
    );
}

#[test]
fn test_column_chunks_follow_committed_data() {
    let engine = new_engine();
    for i in 0..20u64 {
        let c = ctx(&engine, i + 1);
        engine
            .put(&c, RowId(i), user(i as i64, &format!("u{i}@x.com"), 30))
            .unwrap();
        engine.commit_txn(&c.txn).unwrap();
    }

    let collection = engine.collection(&users_name()).unwrap();
    let config = &engine.config().compression;
    let ages = collection.read_column("age", config).unwrap();
    assert_eq!(ages.len(), 20);
    assert!(ages.iter().all(|v| v == &Datum::Int64(30)));
    // A constant column gets the constant scheme.
    assert_eq!(
        collection.chunk_tag("age"),
        Some(crate::compression::CompressionType::Constant)
    );

    // Delete half the rows and vacuum: chunks are rebuilt from the
    // surviving committed rows.
    for i in 0..10u64 {
        let c = ctx(&engine, 100 + i);
        engine.delete(&c, RowId(i)).unwrap();
        engine.commit_txn(&c.txn).unwrap();
    }
    engine
        .vacuum_sweep(
            &FixedHorizon(engine.sequence().current()),
            &CancelSignal::new(),
        )
        .unwrap();
    let ids = collection.read_column("id", config).unwrap();
    assert_eq!(ids.len(), 10);
}

#[test]
fn test_unknown_collection_errors() {
    let engine = new_engine();
    let missing = CollectionFullName::parse("app.missing").unwrap();
    let c = ExecutionContext::new(
        SessionId(1),
        TransactionData::new(TxnId(1), SequenceNumber(0)),
        missing,
    );
    assert!(matches!(
        engine.get(&c, RowId(1)),
        Err(StorageError::CollectionNotFound { .. })
    ));
}

//! End-to-end scenarios driving the executors, indexes and the lock
//! manager through the engine session.

use std::sync::Arc;

use quarrydb::catalog::{ColumnDef, DataType};
use quarrydb::error::{AbortReason, QuarryError};
use quarrydb::execution::{ExecContext, Executor, NestedLoopJoinExecutor};
use quarrydb::expression::{ColumnRef, CompOp, Condition, Value};
use quarrydb::transaction::Transaction;
use quarrydb::Database;
use tempfile::TempDir;

fn test_db(dir: &TempDir) -> Database {
    Database::create(dir.path().join("db")).unwrap()
}

fn int_string_table(db: &Database, name: &str) {
    db.create_table(
        name,
        &[
            ColumnDef::new("a", DataType::Int32, 4),
            ColumnDef::new("b", DataType::FixedString, 8),
        ],
    )
    .unwrap();
}

fn ctx(db: &Database) -> (ExecContext, Arc<Transaction>) {
    let txn = db.begin_transaction();
    (ExecContext::new(db.lock_manager(), txn.clone()), txn)
}

/// Drain an executor, decoding column `a` (offset 0) of each tuple.
fn collect_a(executor: &mut dyn Executor, ctx: &ExecContext) -> Vec<i32> {
    let mut out = Vec::new();
    while !executor.is_end() {
        let tuple = executor.tuple().unwrap();
        out.push(i32::from_le_bytes(tuple.data[0..4].try_into().unwrap()));
        executor.next(ctx).unwrap();
    }
    out
}

#[test]
fn seq_scan_with_predicate() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir);
    int_string_table(&db, "t");

    let txn = db.begin_transaction();
    for (a, b) in [(1, "aaa"), (2, "bbb"), (3, "ccc")] {
        db.insert_row(&txn, "t", &[Value::Int32(a), Value::Str(b.into())])
            .unwrap();
    }
    db.commit(&txn);

    let table = db.table_meta("t").unwrap();
    let cond = Condition::with_value(table.col("a").unwrap(), CompOp::Gt, Value::Int32(1)).unwrap();
    let mut scan = db.seq_scan_executor("t", vec![cond]).unwrap();
    let (ctx, _txn) = ctx(&db);
    scan.begin(&ctx).unwrap();

    let mut seen = collect_a(&mut scan, &ctx);
    seen.sort();
    assert_eq!(seen, vec![2, 3]);
}

#[test]
fn index_scan_bounded_range() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir);
    int_string_table(&db, "t");
    db.create_index("t", &["a"], None).unwrap();

    let txn = db.begin_transaction();
    for a in 10..=100 {
        db.insert_row(&txn, "t", &[Value::Int32(a), Value::Str("x".into())])
            .unwrap();
    }
    db.commit(&txn);

    let table = db.table_meta("t").unwrap();
    let col_a = table.col("a").unwrap();
    let conds = vec![
        Condition::with_value(col_a, CompOp::Ge, Value::Int32(50)).unwrap(),
        Condition::with_value(col_a, CompOp::Lt, Value::Int32(55)).unwrap(),
    ];
    let mut scan = db.index_scan_executor("t", &["a"], conds).unwrap();
    let (ctx, _txn) = ctx(&db);
    scan.begin(&ctx).unwrap();

    // ascending by a, exactly the five in range
    assert_eq!(collect_a(&mut scan, &ctx), vec![50, 51, 52, 53, 54]);
}

#[test]
fn delete_executor_maintains_heap_and_index() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir);
    int_string_table(&db, "t");
    db.create_index("t", &["a"], Some(4)).unwrap();

    let txn = db.begin_transaction();
    for a in 1..=40 {
        db.insert_row(&txn, "t", &[Value::Int32(a), Value::Str("r".into())])
            .unwrap();
    }
    db.commit(&txn);

    // plan: every even-a rid, plus a positivity predicate to re-verify
    let table = db.table_meta("t").unwrap();
    let (scan_ctx, plan_txn) = ctx(&db);
    let mut scan = db.seq_scan_executor("t", vec![]).unwrap();
    scan.begin(&scan_ctx).unwrap();
    let mut even_rids = Vec::new();
    while !scan.is_end() {
        let tuple = scan.tuple().unwrap();
        let a = i32::from_le_bytes(tuple.data[0..4].try_into().unwrap());
        if a % 2 == 0 {
            even_rids.push(scan.rid().unwrap());
        }
        scan.next(&scan_ctx).unwrap();
    }
    db.commit(&plan_txn);
    // a stale duplicate in the plan must be skipped, not fail
    let dup = even_rids[0];
    even_rids.push(dup);

    let cond = Condition::with_value(table.col("a").unwrap(), CompOp::Gt, Value::Int32(0)).unwrap();
    let mut delete = db.delete_executor("t", vec![cond], even_rids).unwrap();
    let (del_ctx, del_txn) = ctx(&db);
    delete.begin(&del_ctx).unwrap();
    assert!(delete.is_end());
    assert_eq!(delete.deleted_count(), 20);
    db.commit(&del_txn);

    // no surviving row is even
    let (ctx2, _t2) = ctx(&db);
    let mut rescan = db.seq_scan_executor("t", vec![]).unwrap();
    rescan.begin(&ctx2).unwrap();
    let survivors = collect_a(&mut rescan, &ctx2);
    assert_eq!(survivors.len(), 20);
    assert!(survivors.iter().all(|a| a % 2 == 1));

    // index invariants hold and its keys are the odd values ascending
    let indexes = db.table_indexes("t").unwrap();
    let index = &indexes[0];
    index.verify_integrity().unwrap();
    let keys: Vec<i32> = index
        .collect_keys()
        .unwrap()
        .iter()
        .map(|k| i32::from_le_bytes(k[0..4].try_into().unwrap()))
        .collect();
    assert_eq!(keys, (1..=40).filter(|a| a % 2 == 1).collect::<Vec<_>>());
}

#[test]
fn nested_loop_join_on_equality() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir);
    int_string_table(&db, "t");
    db.create_table(
        "u",
        &[
            ColumnDef::new("k", DataType::Int32, 4),
            ColumnDef::new("v", DataType::Int32, 4),
        ],
    )
    .unwrap();

    let txn = db.begin_transaction();
    for (a, b) in [(1, "aaa"), (2, "bbb"), (3, "ccc")] {
        db.insert_row(&txn, "t", &[Value::Int32(a), Value::Str(b.into())])
            .unwrap();
    }
    for (k, v) in [(2, 20), (3, 30), (4, 40)] {
        db.insert_row(&txn, "u", &[Value::Int32(k), Value::Int32(v)])
            .unwrap();
    }
    db.commit(&txn);

    let left = Box::new(db.seq_scan_executor("t", vec![]).unwrap());
    let right = Box::new(db.seq_scan_executor("u", vec![]).unwrap());
    let on = Condition::with_column(
        ColumnRef::new("t", "a"),
        CompOp::Eq,
        ColumnRef::new("u", "k"),
    );
    let mut join = NestedLoopJoinExecutor::new(left, right, vec![on]);
    let (ctx, _txn) = ctx(&db);
    join.begin(&ctx).unwrap();

    assert_eq!(join.tuple_len(), 12 + 8);
    let mut pairs = Vec::new();
    while !join.is_end() {
        let tuple = join.tuple().unwrap();
        let a = i32::from_le_bytes(tuple.data[0..4].try_into().unwrap());
        let k = i32::from_le_bytes(tuple.data[12..16].try_into().unwrap());
        let v = i32::from_le_bytes(tuple.data[16..20].try_into().unwrap());
        assert_eq!(a, k);
        pairs.push((a, v));
        join.next(&ctx).unwrap();
    }
    pairs.sort();
    assert_eq!(pairs, vec![(2, 20), (3, 30)]);
}

#[test]
fn exclusive_table_locks_do_not_wait() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir);
    int_string_table(&db, "t");
    let file_id = db.table_heap("t").unwrap().file_id();
    let locks = db.lock_manager();

    let t1 = db.begin_transaction();
    let t2 = db.begin_transaction();
    locks.lock_exclusive_on_table(&t1, file_id).unwrap();

    // the second requester aborts immediately instead of blocking
    let denied = locks.lock_exclusive_on_table(&t2, file_id);
    assert!(matches!(
        denied,
        Err(QuarryError::TransactionAbort {
            reason: AbortReason::DeadlockPrevention,
            ..
        })
    ));
    db.abort(&t2);

    db.commit(&t1);

    // with the lock set released, a fresh transaction succeeds
    let t3 = db.begin_transaction();
    locks.lock_exclusive_on_table(&t3, file_id).unwrap();
    db.commit(&t3);
}

#[test]
fn order_four_tree_fill_then_drain_through_engine() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir);
    int_string_table(&db, "t");
    db.create_index("t", &["a"], Some(4)).unwrap();

    let txn = db.begin_transaction();
    let mut rids = Vec::new();
    for a in 1..=100 {
        rids.push(
            db.insert_row(&txn, "t", &[Value::Int32(a), Value::Str("k".into())])
                .unwrap(),
        );
    }
    db.commit(&txn);

    let index = db.table_indexes("t").unwrap().remove(0);
    index.verify_integrity().unwrap();

    for a in 1..=50i32 {
        let (del_ctx, del_txn) = ctx(&db);
        let mut delete = db
            .delete_executor("t", vec![], vec![rids[(a - 1) as usize]])
            .unwrap();
        delete.begin(&del_ctx).unwrap();
        assert_eq!(delete.deleted_count(), 1);
        db.commit(&del_txn);

        index.verify_integrity().unwrap();
        let keys: Vec<i32> = index
            .collect_keys()
            .unwrap()
            .iter()
            .map(|k| i32::from_le_bytes(k[0..4].try_into().unwrap()))
            .collect();
        assert_eq!(keys, ((a + 1)..=100).collect::<Vec<_>>());
    }
}

#[test]
fn scans_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let db = Database::create(&path).unwrap();
        int_string_table(&db, "t");
        db.create_index("t", &["a"], None).unwrap();
        let txn = db.begin_transaction();
        for a in 1..=8 {
            db.insert_row(&txn, "t", &[Value::Int32(a), Value::Str("p".into())])
                .unwrap();
        }
        db.commit(&txn);
        db.close().unwrap();
    }

    let db = Database::open(&path).unwrap();
    let table = db.table_meta("t").unwrap();
    let cond = Condition::with_value(table.col("a").unwrap(), CompOp::Ge, Value::Int32(6)).unwrap();
    let mut scan = db.index_scan_executor("t", &["a"], vec![cond]).unwrap();
    let (ctx, _txn) = ctx(&db);
    scan.begin(&ctx).unwrap();
    assert_eq!(collect_a(&mut scan, &ctx), vec![6, 7, 8]);
}

//! Single-writer / multi-reader ordering through the engine's
//! transaction manager: writers wait for readers, queued writers beat
//! late readers, and mutations never interleave.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rimdb::catalog::{ColumnInfo, ColumnType};
use rimdb::exec::Expr;
use rimdb::{Engine, EngineConfig, PlanNode, Value};
use tempfile::tempdir;

fn engine_with_table(dir: &std::path::Path) -> Engine {
    let engine = Engine::open(EngineConfig::new(dir).max_pool_pages(64)).unwrap();
    let txn = engine.begin_write().unwrap();
    let mut ctx = engine.new_context(engine.default_budget());
    engine
        .execute(
            &txn,
            &PlanNode::create_table(
                "t",
                vec![ColumnInfo::new("a", ColumnType::Integer)],
            ),
            &mut ctx,
        )
        .unwrap();
    engine.commit(txn).unwrap();
    engine
}

#[test]
fn writer_waits_for_both_readers_and_beats_late_reader() {
    let dir = tempdir().unwrap();
    let engine = engine_with_table(dir.path());
    let order = Arc::new(Mutex::new(Vec::new()));

    let r1 = engine.begin_read().unwrap();
    let r2 = engine.begin_read().unwrap();

    thread::scope(|scope| {
        let writer = {
            let order = Arc::clone(&order);
            let engine = &engine;
            scope.spawn(move || {
                let txn = engine.begin_write().unwrap();
                order.lock().push("writer");
                engine.commit(txn).unwrap();
            })
        };

        // Give the writer time to queue behind both readers. A new
        // writer attempt must refuse while readers hold the lock.
        thread::sleep(Duration::from_millis(20));
        assert!(engine.try_begin_write().is_none());

        // This reader arrives after the writer queued: it must be held
        // back until the writer is through.
        let late_reader = {
            let order = Arc::clone(&order);
            let engine = &engine;
            scope.spawn(move || {
                let txn = engine.begin_read().unwrap();
                order.lock().push("late-reader");
                engine.commit(txn).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(20));
        engine.commit(r1).unwrap();
        thread::sleep(Duration::from_millis(10));
        engine.commit(r2).unwrap();

        writer.join().unwrap();
        late_reader.join().unwrap();
    });

    assert_eq!(*order.lock(), vec!["writer", "late-reader"]);
}

#[test]
fn concurrent_writers_serialize_all_mutations() {
    let dir = tempdir().unwrap();
    let engine = engine_with_table(dir.path());
    let engine = &engine;

    thread::scope(|scope| {
        for worker in 0..4i64 {
            scope.spawn(move || {
                for i in 0..25i64 {
                    let txn = engine.begin_write().unwrap();
                    let mut ctx = engine.new_context(engine.default_budget());
                    engine
                        .execute(
                            &txn,
                            &PlanNode::insert(
                                "t",
                                vec![],
                                vec![vec![Expr::lit(worker * 100 + i)]],
                            ),
                            &mut ctx,
                        )
                        .unwrap();
                    engine.commit(txn).unwrap();
                }
            });
        }
    });

    let txn = engine.begin_read().unwrap();
    let mut ctx = engine.new_context(engine.default_budget());
    let output = engine
        .execute(&txn, &PlanNode::table_scan("t"), &mut ctx)
        .unwrap();
    engine.commit(txn).unwrap();

    // Every insert landed exactly once.
    assert_eq!(output.rows.len(), 100);
    let mut seen: Vec<i64> = output
        .rows
        .iter()
        .map(|r| match r.values[0] {
            Value::Integer(i) => i,
            _ => panic!("unexpected value"),
        })
        .collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 100);
}

#[test]
fn readers_run_concurrently() {
    let dir = tempdir().unwrap();
    let engine = engine_with_table(dir.path());
    let engine = &engine;
    let concurrent = AtomicU32::new(0);
    let peak = AtomicU32::new(0);
    let (concurrent, peak) = (&concurrent, &peak);

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(move || {
                let txn = engine.begin_read().unwrap();
                let now = concurrent.fetch_add(1, Ordering::AcqRel) + 1;
                peak.fetch_max(now, Ordering::AcqRel);
                thread::sleep(Duration::from_millis(30));
                concurrent.fetch_sub(1, Ordering::AcqRel);
                engine.commit(txn).unwrap();
            });
        }
    });

    assert!(
        peak.load(Ordering::Acquire) >= 2,
        "readers never overlapped"
    );
}

#[test]
fn reader_snapshot_is_stable_under_queued_writer() {
    let dir = tempdir().unwrap();
    let engine = engine_with_table(dir.path());

    {
        let txn = engine.begin_write().unwrap();
        let mut ctx = engine.new_context(engine.default_budget());
        engine
            .execute(
                &txn,
                &PlanNode::insert("t", vec![], vec![vec![Expr::lit(1i64)]]),
                &mut ctx,
            )
            .unwrap();
        engine.commit(txn).unwrap();
    }

    let engine = &engine;
    thread::scope(|scope| {
        let reader = engine.begin_read().unwrap();

        // A writer queues up; the reader's view must not change while it
        // holds its lock.
        let writer = scope.spawn(move || {
            let txn = engine.begin_write().unwrap();
            let mut ctx = engine.new_context(engine.default_budget());
            engine
                .execute(
                    &txn,
                    &PlanNode::insert("t", vec![], vec![vec![Expr::lit(2i64)]]),
                    &mut ctx,
                )
                .unwrap();
            engine.commit(txn).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        let mut ctx = engine.new_context(engine.default_budget());
        let output = engine
            .execute(&reader, &PlanNode::table_scan("t"), &mut ctx)
            .unwrap();
        assert_eq!(output.rows.len(), 1, "writer is still queued");
        engine.commit(reader).unwrap();

        writer.join().unwrap();
    });

    let txn = engine.begin_read().unwrap();
    let mut ctx = engine.new_context(engine.default_budget());
    let output = engine
        .execute(&txn, &PlanNode::table_scan("t"), &mut ctx)
        .unwrap();
    engine.commit(txn).unwrap();
    assert_eq!(output.rows.len(), 2);
}

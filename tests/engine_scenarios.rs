//! End-to-end statement scenarios through the Engine: DDL, DML, the
//! full scan → sort → limit pipeline, aggregation, and graceful
//! shutdown.

use std::time::Duration;

use rimdb::catalog::{ColumnInfo, ColumnType};
use rimdb::exec::{AggregateFunc, AggregateSpec, BinaryOp, Expr, SortKey};
use rimdb::{Engine, EngineConfig, PlanNode, QueryOutput, Value};
use tempfile::tempdir;

fn open_engine(dir: &std::path::Path) -> Engine {
    Engine::open(EngineConfig::new(dir).max_pool_pages(64)).unwrap()
}

fn run(engine: &Engine, plan: &PlanNode) -> QueryOutput {
    let txn = engine.begin_write().unwrap();
    let mut ctx = engine.new_context(engine.default_budget());
    let output = engine.execute(&txn, plan, &mut ctx).unwrap();
    engine.commit(txn).unwrap();
    output
}

fn setup(engine: &Engine) {
    run(
        engine,
        &PlanNode::create_table(
            "t",
            vec![
                ColumnInfo::new("a", ColumnType::Integer),
                ColumnInfo::new("b", ColumnType::Text),
            ],
        ),
    );
    run(
        engine,
        &PlanNode::insert(
            "t",
            vec![],
            vec![
                vec![Expr::lit(1i64), Expr::lit("x")],
                vec![Expr::lit(2i64), Expr::lit("y")],
                vec![Expr::lit(3i64), Expr::lit("z")],
            ],
        ),
    );
}

#[test]
fn select_a_order_by_a_desc_limit_2() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    setup(&engine);

    // SELECT a FROM t ORDER BY a DESC LIMIT 2
    let plan = PlanNode::table_scan("t")
        .project(vec![Expr::col(0)], vec!["a".into()])
        .sort(vec![SortKey::desc(Expr::col(0))])
        .limit(2, 0);

    let output = run(&engine, &plan);
    assert_eq!(output.column_names, vec!["a"]);
    assert_eq!(output.rows.len(), 2);
    assert_eq!(output.rows[0].values[0], Value::Integer(3));
    assert_eq!(output.rows[1].values[0], Value::Integer(2));
}

#[test]
fn filter_and_project_combination() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    setup(&engine);

    // SELECT b FROM t WHERE a >= 2
    let plan = PlanNode::table_scan("t")
        .filter(Expr::binary(BinaryOp::GtEq, Expr::col(0), Expr::lit(2i64)))
        .project(vec![Expr::col(1)], vec!["b".into()]);

    let output = run(&engine, &plan);
    assert_eq!(output.rows.len(), 2);
    assert_eq!(output.rows[0].values[0], Value::Text("y".into()));
    assert_eq!(output.rows[1].values[0], Value::Text("z".into()));
}

#[test]
fn grouped_aggregation_through_engine() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    setup(&engine);
    run(
        &engine,
        &PlanNode::insert(
            "t",
            vec![],
            vec![
                vec![Expr::lit(1i64), Expr::lit("again")],
                vec![Expr::lit(3i64), Expr::lit("again")],
            ],
        ),
    );

    // SELECT a, COUNT(*) AS n FROM t GROUP BY a (ordered for stability)
    let plan = PlanNode::table_scan("t")
        .aggregate(vec![AggregateSpec::count_star("n")], vec![Expr::col(0)])
        .sort(vec![SortKey::asc(Expr::col(0))]);

    let output = run(&engine, &plan);
    assert_eq!(output.rows.len(), 3);
    assert_eq!(
        output.rows[0].values,
        vec![Value::Integer(1), Value::Integer(2)]
    );
    assert_eq!(
        output.rows[2].values,
        vec![Value::Integer(3), Value::Integer(2)]
    );

    // SELECT SUM(a), AVG(a) FROM t
    let plan = PlanNode::table_scan("t").aggregate(
        vec![
            AggregateSpec::new(AggregateFunc::Sum, Some(Expr::col(0)), "total"),
            AggregateSpec::new(AggregateFunc::Avg, Some(Expr::col(0)), "mean"),
        ],
        vec![],
    );
    let output = run(&engine, &plan);
    assert_eq!(output.rows[0].values[0], Value::Integer(10));
    assert_eq!(output.rows[0].values[1], Value::Float(2.0));
}

#[test]
fn multi_statement_transaction_is_atomic_at_the_lock() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    setup(&engine);

    // Several statements under one write transaction.
    let txn = engine.begin_write().unwrap();
    let mut ctx = engine.new_context(engine.default_budget());
    engine
        .execute(
            &txn,
            &PlanNode::insert("t", vec![], vec![vec![Expr::lit(4i64), Expr::lit("w")]]),
            &mut ctx,
        )
        .unwrap();
    let mid = engine
        .execute(&txn, &PlanNode::table_scan("t"), &mut ctx)
        .unwrap();
    assert_eq!(mid.rows.len(), 4, "own writes visible inside the txn");
    engine.commit(txn).unwrap();

    let output = run(&engine, &PlanNode::table_scan("t"));
    assert_eq!(output.rows.len(), 4);
}

#[test]
fn create_drop_recreate_cycle() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    setup(&engine);

    run(&engine, &PlanNode::drop_table("t"));
    assert!(!engine.catalog().table_exists("t"));

    // Recreating gets a fresh, empty table.
    run(
        &engine,
        &PlanNode::create_table("t", vec![ColumnInfo::new("a", ColumnType::Integer)]),
    );
    let output = run(&engine, &PlanNode::table_scan("t"));
    assert!(output.rows.is_empty());
}

#[test]
fn catalog_round_trips_across_reopen() {
    let dir = tempdir().unwrap();
    {
        let engine = open_engine(dir.path());
        setup(&engine);
    }

    let engine = open_engine(dir.path());
    let table = engine.catalog().table("t").unwrap();
    assert_eq!(table.columns.len(), 2);
    assert_eq!(table.columns[1].name, "b");
    assert_eq!(table.columns[1].column_type, ColumnType::Text);
}

#[test]
fn graceful_shutdown_flushes_pages() {
    let dir = tempdir().unwrap();
    {
        let engine = open_engine(dir.path());
        setup(&engine);
        assert!(engine.shutdown(Duration::from_secs(1)));
        assert_eq!(engine.pool().dirty_pages(), 0, "CLOSE_FILES flushed");
    }

    // After a clean shutdown the reopened engine has nothing to replay
    // page-wise beyond idempotent skips.
    let engine = open_engine(dir.path());
    let output = run(&engine, &PlanNode::table_scan("t"));
    assert_eq!(output.rows.len(), 3);
}

#[test]
fn shutdown_waits_for_inflight_statement() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    setup(&engine);
    let engine = &engine;

    std::thread::scope(|scope| {
        // Run a statement series; once shutdown is requested the next
        // statement is refused, never torn mid-flight.
        let worker = scope.spawn(move || {
            let txn = engine.begin_read().unwrap();
            let mut ctx = engine.new_context(engine.default_budget());
            let mut completed = 0u32;
            for _ in 0..50 {
                match engine.execute(&txn, &PlanNode::table_scan("t"), &mut ctx) {
                    Ok(output) => {
                        assert_eq!(output.rows.len(), 3);
                        completed += 1;
                    }
                    Err(_) => break,
                }
            }
            engine.commit(txn).unwrap();
            completed
        });

        std::thread::sleep(Duration::from_millis(5));
        assert!(engine.shutdown(Duration::from_secs(2)));
        assert!(worker.join().unwrap() >= 1);
    });

    assert!(engine.begin_read().is_err());
}

//! Budget enforcement end to end: a query that blows its budget fails
//! with the right violation, and the engine keeps serving afterwards.

use std::time::{Duration, Instant};

use rimdb::catalog::{ColumnInfo, ColumnType};
use rimdb::exec::{BudgetError, BudgetViolation, Expr, SortKey};
use rimdb::{Engine, EngineConfig, PlanNode, QueryBudget, Value};
use tempfile::tempdir;

fn engine_with_rows(dir: &std::path::Path, count: i64) -> Engine {
    let engine = Engine::open(EngineConfig::new(dir).max_pool_pages(256)).unwrap();

    let txn = engine.begin_write().unwrap();
    let mut ctx = engine.new_context(engine.default_budget());
    engine
        .execute(
            &txn,
            &PlanNode::create_table(
                "t",
                vec![
                    ColumnInfo::new("a", ColumnType::Integer),
                    ColumnInfo::new("b", ColumnType::Text),
                ],
            ),
            &mut ctx,
        )
        .unwrap();

    // Insert in batches to keep individual statements reasonable.
    for chunk_start in (0..count).step_by(500) {
        let rows: Vec<Vec<Expr>> = (chunk_start..(chunk_start + 500).min(count))
            .map(|i| vec![Expr::lit(i), Expr::lit(format!("row-{i}").as_str())])
            .collect();
        engine
            .execute(&txn, &PlanNode::insert("t", vec![], rows), &mut ctx)
            .unwrap();
    }
    engine.commit(txn).unwrap();
    engine
}

fn violation_of(err: &eyre::Report) -> BudgetViolation {
    err.downcast_ref::<BudgetError>()
        .unwrap_or_else(|| panic!("expected BudgetError, got: {err:#}"))
        .violation
}

#[test]
fn oversized_sort_fails_with_memory_exceeded_and_engine_survives() {
    let dir = tempdir().unwrap();
    let engine = engine_with_rows(dir.path(), 10_000);

    let budget = QueryBudget {
        max_memory_bytes: 1024,
        ..Default::default()
    };
    let txn = engine.begin_read().unwrap();
    let mut ctx = engine.new_context(budget);
    let err = engine
        .execute(
            &txn,
            &PlanNode::table_scan("t").sort(vec![SortKey::asc(Expr::col(0))]),
            &mut ctx,
        )
        .unwrap_err();
    engine.commit(txn).unwrap();

    assert_eq!(violation_of(&err), BudgetViolation::MemoryExceeded);
    assert!(err.to_string().contains("limit is 1024"));

    // The process (and the engine) keep serving.
    let txn = engine.begin_read().unwrap();
    let mut ctx = engine.new_context(engine.default_budget());
    let output = engine
        .execute(&txn, &PlanNode::table_scan("t").limit(3, 0), &mut ctx)
        .unwrap();
    engine.commit(txn).unwrap();
    assert_eq!(output.rows.len(), 3);

    // The failed query's reservations were returned to the tracker.
    drop(ctx);
    assert_eq!(engine.memory_tracker().used(), 0);
}

#[test]
fn expired_deadline_fails_fast_with_no_partial_rows() {
    let dir = tempdir().unwrap();
    let engine = engine_with_rows(dir.path(), 5_000);

    let budget = QueryBudget {
        max_time: Duration::ZERO,
        ..Default::default()
    };
    let txn = engine.begin_read().unwrap();
    let mut ctx = engine.new_context(budget);

    let began = Instant::now();
    let err = engine
        .execute(&txn, &PlanNode::table_scan("t"), &mut ctx)
        .unwrap_err();
    let wall = began.elapsed();
    engine.commit(txn).unwrap();

    assert_eq!(violation_of(&err), BudgetViolation::Timeout);
    // The failure fires at the first budget check, far inside any
    // reasonable epsilon of the (zero) deadline.
    assert!(wall < Duration::from_millis(500), "took {:?}", wall);
    // Err means the client observed zero rows.
    assert_eq!(ctx.stats().rows_returned, 0);
}

#[test]
fn row_quota_emits_exactly_min_of_n_and_k() {
    let dir = tempdir().unwrap();
    let engine = engine_with_rows(dir.path(), 100);

    // N == K completes cleanly with all rows.
    let budget = QueryBudget {
        max_result_rows: 100,
        ..Default::default()
    };
    let txn = engine.begin_read().unwrap();
    let mut ctx = engine.new_context(budget);
    let output = engine
        .execute(&txn, &PlanNode::table_scan("t"), &mut ctx)
        .unwrap();
    engine.commit(txn).unwrap();
    assert_eq!(output.rows.len(), 100);

    // N > K fails with RowsExceeded after exactly K rows were emitted.
    let budget = QueryBudget {
        max_result_rows: 40,
        ..Default::default()
    };
    let txn = engine.begin_read().unwrap();
    let mut ctx = engine.new_context(budget);
    let err = engine
        .execute(&txn, &PlanNode::table_scan("t"), &mut ctx)
        .unwrap_err();
    engine.commit(txn).unwrap();

    assert_eq!(violation_of(&err), BudgetViolation::RowsExceeded);
    assert_eq!(ctx.stats().rows_returned, 41, "failed on the overrun row");
}

#[test]
fn instruction_budget_caps_scans() {
    let dir = tempdir().unwrap();
    let engine = engine_with_rows(dir.path(), 2_000);

    let budget = QueryBudget {
        max_instructions: 50,
        ..Default::default()
    };
    let txn = engine.begin_read().unwrap();
    let mut ctx = engine.new_context(budget);
    let err = engine
        .execute(&txn, &PlanNode::table_scan("t"), &mut ctx)
        .unwrap_err();
    engine.commit(txn).unwrap();

    assert_eq!(violation_of(&err), BudgetViolation::InstructionsExceeded);
    assert!(err.to_string().contains("limit is 50"));
}

#[test]
fn abort_handle_cancels_cooperatively() {
    let dir = tempdir().unwrap();
    let engine = engine_with_rows(dir.path(), 1_000);

    let txn = engine.begin_read().unwrap();
    let mut ctx = engine.new_context(engine.default_budget());
    ctx.abort_handle().abort();

    let err = engine
        .execute(&txn, &PlanNode::table_scan("t"), &mut ctx)
        .unwrap_err();
    engine.commit(txn).unwrap();

    assert_eq!(violation_of(&err), BudgetViolation::Aborted);
    assert!(err.to_string().contains("aborted"));
}

#[test]
fn limit_inside_quota_is_not_a_violation() {
    let dir = tempdir().unwrap();
    let engine = engine_with_rows(dir.path(), 1_000);

    let budget = QueryBudget {
        max_result_rows: 10,
        ..Default::default()
    };
    let txn = engine.begin_read().unwrap();
    let mut ctx = engine.new_context(budget);
    let output = engine
        .execute(
            &txn,
            &PlanNode::table_scan("t")
                .sort(vec![SortKey::desc(Expr::col(0))])
                .limit(5, 0),
            &mut ctx,
        )
        .unwrap();
    engine.commit(txn).unwrap();

    assert_eq!(output.rows.len(), 5);
    assert_eq!(output.rows[0].values[0], Value::Integer(999));
}

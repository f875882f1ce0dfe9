//! # Executor
//!
//! Turns a plan tree into an operator tree and runs it under an
//! execution context. Structural translation only — table names resolve
//! against the catalog, schema problems (unknown table, unknown column,
//! value-count mismatch, NULL into NOT NULL) surface before any page is
//! touched.
//!
//! ## Pull Loop
//!
//! `ctx.start()` fires at the root, then rows are pulled one at a time;
//! every emitted row records `rows_returned` and runs `check_budget`.
//! `ctx.finalize()` runs on every exit path — success, budget violation,
//! or I/O error — so the stats report is always sealed.
//!
//! ## Mutation Protocol
//!
//! Writes require a write transaction (enforced here, structurally
//! guaranteed exclusive by the transaction manager). Each inserted row:
//!
//! 1. serializes through the query arena,
//! 2. appends its WAL record (slot id predicted as the page's next slot),
//! 3. mutates the cached page and stamps the record's LSN,
//! 4. leaves the page dirty for the pool to write back.
//!
//! The WAL append precedes the page mutation, so a crash between the two
//! replays the insert instead of losing it.

use eyre::{bail, ensure, Result};
use std::path::Path;
use tracing::debug;

use crate::catalog::{Catalog, TableInfo};
use crate::config::ROW_STEP_COST;
use crate::record::{Record, Row, Value};
use crate::storage::{BufferPool, Wal, WalEntry, WalRecordType};
use crate::txn::Transaction;

use super::context::ExecutionContext;
use super::operators::{
    AggregateOp, FilterOp, LimitOp, Operator, ProjectOp, SortOp, TableScanOp,
};
use super::plan::{Expr, PlanNode};

/// Result of one executed statement.
#[derive(Debug, Default)]
pub struct QueryOutput {
    pub column_names: Vec<String>,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

/// Stateless executor over the engine's storage subsystems; constructed
/// per statement.
pub struct Executor<'a> {
    pool: &'a BufferPool,
    wal: &'a Wal,
    catalog: &'a Catalog,
    data_dir: &'a Path,
}

impl<'a> Executor<'a> {
    pub fn new(
        pool: &'a BufferPool,
        wal: &'a Wal,
        catalog: &'a Catalog,
        data_dir: &'a Path,
    ) -> Self {
        Self {
            pool,
            wal,
            catalog,
            data_dir,
        }
    }

    fn catalog_path(&self) -> std::path::PathBuf {
        self.data_dir.join(crate::config::CATALOG_FILE_NAME)
    }

    /// Executes a plan under `txn`. Stats are sealed into `ctx` whether
    /// or not execution succeeds.
    pub fn execute(
        &self,
        txn: &Transaction<'_>,
        plan: &PlanNode,
        ctx: &mut ExecutionContext,
    ) -> Result<QueryOutput> {
        ctx.start();
        let result = self.dispatch(txn, plan, ctx);
        ctx.finalize();
        result
    }

    fn dispatch(
        &self,
        txn: &Transaction<'_>,
        plan: &PlanNode,
        ctx: &mut ExecutionContext,
    ) -> Result<QueryOutput> {
        match plan {
            PlanNode::Insert {
                table,
                columns,
                rows,
            } => {
                self.require_writable(txn, "INSERT")?;
                self.execute_insert(table, columns, rows, ctx)
            }
            PlanNode::CreateTable {
                table,
                columns,
                if_not_exists,
            } => {
                self.require_writable(txn, "CREATE TABLE")?;
                self.execute_create_table(table, columns.clone(), *if_not_exists)
            }
            PlanNode::DropTable { table, if_exists } => {
                self.require_writable(txn, "DROP TABLE")?;
                self.execute_drop_table(table, *if_exists)
            }
            _ => self.execute_query(plan, ctx),
        }
    }

    fn require_writable(&self, txn: &Transaction<'_>, statement: &str) -> Result<()> {
        ensure!(
            !txn.is_read_only(),
            "{} requires a write transaction",
            statement
        );
        Ok(())
    }

    fn execute_query(&self, plan: &PlanNode, ctx: &mut ExecutionContext) -> Result<QueryOutput> {
        let mut root = self.build_operator(plan)?;

        let result: Result<Vec<Row>> = (|| {
            root.open(ctx)?;
            let mut rows = Vec::new();
            while let Some(row) = root.next(ctx)? {
                ctx.record_row_returned();
                ctx.check_budget()?;
                rows.push(row);
            }
            Ok(rows)
        })();

        let column_names = root.column_names();
        root.close(ctx);

        Ok(QueryOutput {
            column_names,
            rows: result?,
            rows_affected: 0,
        })
    }

    fn build_operator(&self, plan: &PlanNode) -> Result<Operator<'a>> {
        Ok(match plan {
            PlanNode::TableScan { table } => {
                let info = self.catalog.require_table(table)?;
                Operator::TableScan(TableScanOp::new(self.pool, info))
            }
            PlanNode::Filter { child, predicate } => Operator::Filter(FilterOp::new(
                self.build_operator(child)?,
                predicate.clone(),
            )),
            PlanNode::Project {
                child,
                exprs,
                names,
            } => {
                ensure!(
                    exprs.len() == names.len(),
                    "projection has {} expressions but {} names",
                    exprs.len(),
                    names.len()
                );
                Operator::Project(ProjectOp::new(
                    self.build_operator(child)?,
                    exprs.clone(),
                    names.clone(),
                ))
            }
            PlanNode::Sort { child, keys } => {
                Operator::Sort(SortOp::new(self.build_operator(child)?, keys.clone()))
            }
            PlanNode::Limit {
                child,
                limit,
                offset,
            } => Operator::Limit(LimitOp::new(self.build_operator(child)?, *limit, *offset)),
            PlanNode::Aggregate {
                child,
                aggregates,
                group_by,
            } => Operator::Aggregate(AggregateOp::new(
                self.build_operator(child)?,
                aggregates.clone(),
                group_by.clone(),
            )),
            PlanNode::Insert { .. } | PlanNode::CreateTable { .. } | PlanNode::DropTable { .. } => {
                bail!("mutation node cannot appear inside a query pipeline")
            }
        })
    }

    fn execute_insert(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Expr>],
        ctx: &mut ExecutionContext,
    ) -> Result<QueryOutput> {
        let info = self.catalog.require_table(table)?;
        let column_order = resolve_insert_columns(&info, columns)?;

        let empty = Row::default();
        let mut affected = 0u64;
        for exprs in rows {
            ensure!(
                exprs.len() == column_order.len(),
                "table '{}' insert has {} values for {} columns",
                table,
                exprs.len(),
                column_order.len()
            );

            // Evaluate into schema order, NULL for unnamed columns.
            let mut values = vec![Value::Null; info.columns.len()];
            for (expr, &target) in exprs.iter().zip(column_order.iter()) {
                values[target] = expr.eval(&empty)?;
            }
            for column in &info.columns {
                if column.not_null && values[column.index as usize].is_null() {
                    bail!(
                        "column '{}' of table '{}' is NOT NULL",
                        column.name,
                        table
                    );
                }
            }

            ctx.record_instructions(ROW_STEP_COST);
            ctx.check_budget()?;
            self.insert_row(&info, Record::new(values), ctx)?;
            affected += 1;
        }

        self.catalog.bump_row_count(info.id, affected as i64);
        debug!(table, rows = affected, "insert complete");

        Ok(QueryOutput {
            rows_affected: affected,
            ..Default::default()
        })
    }

    /// WAL-then-page application of one record.
    fn insert_row(
        &self,
        info: &TableInfo,
        record: Record,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let size = record.serialized_size();
        let buf = ctx.allocator().alloc_bytes(size)?;
        record.serialize_into(buf)?;

        // Last allocated page if it has room, else a fresh one.
        let page_count = self.pool.table_page_count(info.id)?;
        let mut guard = None;
        if page_count > 0 {
            let candidate = self.pool.get_page(info.id, page_count - 1)?;
            if candidate.page().free_space() as usize >= size + crate::config::SLOT_ENTRY_SIZE {
                guard = Some(candidate);
            }
        }
        let mut guard = match guard {
            Some(guard) => guard,
            None => self.pool.allocate_page(info.id)?.1,
        };

        let page_id = guard.page().page_id();
        let slot = guard.page().slot_count();
        let lsn = self.wal.append(
            WalEntry::new(WalRecordType::Insert, info.id, page_id, slot).with_payload(buf),
        )?;

        let page = guard.page_mut();
        let assigned = page.insert_record(buf)?;
        debug_assert_eq!(assigned, slot);
        page.set_lsn(lsn);

        Ok(())
    }

    fn execute_create_table(
        &self,
        table: &str,
        columns: Vec<crate::catalog::ColumnInfo>,
        if_not_exists: bool,
    ) -> Result<QueryOutput> {
        if if_not_exists && self.catalog.table_exists(table) {
            return Ok(QueryOutput::default());
        }

        let table_id = self.catalog.create_table(table, columns)?;
        self.wal.append(
            WalEntry::new(WalRecordType::CreateTable, table_id, 0, 0)
                .with_payload(table.as_bytes()),
        )?;
        self.catalog.save(&self.catalog_path())?;
        debug!(table, table_id, "created table");

        Ok(QueryOutput {
            rows_affected: 0,
            ..Default::default()
        })
    }

    fn execute_drop_table(&self, table: &str, if_exists: bool) -> Result<QueryOutput> {
        if if_exists && !self.catalog.table_exists(table) {
            return Ok(QueryOutput::default());
        }

        let table_id = self.catalog.drop_table(table)?;
        self.pool.drop_table(table_id)?;
        self.wal.append(
            WalEntry::new(WalRecordType::DropTable, table_id, 0, 0).with_payload(table.as_bytes()),
        )?;
        self.catalog.save(&self.catalog_path())?;
        debug!(table, table_id, "dropped table");

        Ok(QueryOutput::default())
    }
}

/// Maps an INSERT's named columns (or the full schema when unnamed) to
/// schema positions, rejecting unknown and duplicate names.
fn resolve_insert_columns(info: &TableInfo, columns: &[String]) -> Result<Vec<usize>> {
    if columns.is_empty() {
        return Ok((0..info.columns.len()).collect());
    }

    let mut order = Vec::with_capacity(columns.len());
    for name in columns {
        let index = info
            .find_column(name)
            .ok_or_else(|| eyre::eyre!("unknown column '{}' in table '{}'", name, info.name))?;
        if order.contains(&index) {
            bail!("column '{}' named twice in insert", name);
        }
        order.push(index);
    }
    Ok(order)
}

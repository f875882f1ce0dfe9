//! # Pull-Based Operators
//!
//! One tagged variant per operator kind, dispatched through the inherent
//! `open`/`next`/`close`/`column_names` methods — no virtual hierarchy,
//! just a match. Each `next` call pulls from the child on demand, so
//! streaming operators run in O(1) memory per row.
//!
//! Budget discipline:
//!
//! - every operator consults `should_stop` at the top of `next` and
//!   surfaces the pending violation via `check_budget`;
//! - the blocking operators (Sort, Aggregate) charge every materialized
//!   row / group against the query allocator and run `check_budget` per
//!   row, so a runaway materialization fails fast with the memory or row
//!   violation instead of exhausting the process;
//! - `close` returns whatever was charged.
//!
//! TableScan walks (page_id, slot) in ascending order, holding one pinned
//! page guard at a time; tombstoned slots and DELETED-flagged records are
//! skipped without surfacing.

use eyre::{ensure, Result};
use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;

use crate::catalog::TableInfo;
use crate::config::{GROUP_ENTRY_OVERHEAD_BYTES, ROW_STEP_COST, SCAN_PAGE_COST};
use crate::record::{encode_group_key, Record, Row, Value};
use crate::storage::{BufferPool, PageGuard};

use super::context::ExecutionContext;
use super::plan::{AggregateFunc, AggregateSpec, Expr, SortKey};

/// Operator tree node. Children are boxed operators of the same enum.
pub enum Operator<'a> {
    TableScan(TableScanOp<'a>),
    Filter(FilterOp<'a>),
    Project(ProjectOp<'a>),
    Sort(SortOp<'a>),
    Limit(LimitOp<'a>),
    Aggregate(AggregateOp<'a>),
}

impl<'a> Operator<'a> {
    pub fn open(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        match self {
            Operator::TableScan(op) => op.open(ctx),
            Operator::Filter(op) => op.child.open(ctx),
            Operator::Project(op) => op.child.open(ctx),
            Operator::Sort(op) => op.open(ctx),
            Operator::Limit(op) => op.child.open(ctx),
            Operator::Aggregate(op) => op.open(ctx),
        }
    }

    pub fn next(&mut self, ctx: &mut ExecutionContext) -> Result<Option<Row>> {
        if ctx.should_stop() {
            ctx.check_budget()?;
        }
        match self {
            Operator::TableScan(op) => op.next(ctx),
            Operator::Filter(op) => op.next(ctx),
            Operator::Project(op) => op.next(ctx),
            Operator::Sort(op) => op.next(ctx),
            Operator::Limit(op) => op.next(ctx),
            Operator::Aggregate(op) => op.next(ctx),
        }
    }

    pub fn close(&mut self, ctx: &mut ExecutionContext) {
        match self {
            Operator::TableScan(op) => op.close(),
            Operator::Filter(op) => op.child.close(ctx),
            Operator::Project(op) => op.child.close(ctx),
            Operator::Sort(op) => op.close(ctx),
            Operator::Limit(op) => op.child.close(ctx),
            Operator::Aggregate(op) => op.close(ctx),
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        match self {
            Operator::TableScan(op) => op.table.column_names(),
            Operator::Filter(op) => op.child.column_names(),
            Operator::Project(op) => op.names.clone(),
            Operator::Sort(op) => op.child.column_names(),
            Operator::Limit(op) => op.child.column_names(),
            Operator::Aggregate(op) => op.output_names(),
        }
    }
}

/// Sequential scan over a table's pages in (page_id, slot) order.
pub struct TableScanOp<'a> {
    pool: &'a BufferPool,
    table: TableInfo,
    page_count: u32,
    next_page: u32,
    next_slot: u16,
    current: Option<PageGuard<'a>>,
}

impl<'a> TableScanOp<'a> {
    pub fn new(pool: &'a BufferPool, table: TableInfo) -> Self {
        Self {
            pool,
            table,
            page_count: 0,
            next_page: 0,
            next_slot: 0,
            current: None,
        }
    }

    fn open(&mut self, _ctx: &mut ExecutionContext) -> Result<()> {
        self.page_count = self.pool.table_page_count(self.table.id)?;
        self.next_page = 0;
        self.next_slot = 0;
        self.current = None;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> Result<Option<Row>> {
        loop {
            if self.current.is_none() {
                if self.next_page >= self.page_count {
                    return Ok(None);
                }
                ctx.record_instructions(SCAN_PAGE_COST);
                self.current = Some(self.pool.get_page(self.table.id, self.next_page)?);
                self.next_page += 1;
                self.next_slot = 0;
            }

            let guard = self.current.as_ref().expect("current page set");
            let page = guard.page();
            while self.next_slot < page.slot_count() {
                let slot = self.next_slot;
                self.next_slot += 1;

                if !page.slot_occupied(slot) {
                    continue;
                }
                let record = Record::deserialize(page.record(slot)?)?;
                if record.is_deleted() {
                    continue;
                }
                ensure!(
                    record.values.len() == self.table.columns.len(),
                    "row in table '{}' has {} columns, schema has {}",
                    self.table.name,
                    record.values.len(),
                    self.table.columns.len()
                );

                ctx.record_row_scanned();
                ctx.record_instructions(ROW_STEP_COST);
                return Ok(Some(Row::new(record.values)));
            }

            self.current = None;
        }
    }

    fn close(&mut self) {
        self.current = None;
    }
}

/// Emits only child rows satisfying the predicate.
pub struct FilterOp<'a> {
    pub(super) child: Box<Operator<'a>>,
    predicate: Expr,
}

impl<'a> FilterOp<'a> {
    pub fn new(child: Operator<'a>, predicate: Expr) -> Self {
        Self {
            child: Box::new(child),
            predicate,
        }
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> Result<Option<Row>> {
        while let Some(row) = self.child.next(ctx)? {
            ctx.record_instructions(ROW_STEP_COST);
            if self.predicate.eval(&row)?.is_true() {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

/// Evaluates expressions against the child row under declared names.
pub struct ProjectOp<'a> {
    pub(super) child: Box<Operator<'a>>,
    exprs: Vec<Expr>,
    pub(super) names: Vec<String>,
}

impl<'a> ProjectOp<'a> {
    pub fn new(child: Operator<'a>, exprs: Vec<Expr>, names: Vec<String>) -> Self {
        Self {
            child: Box::new(child),
            exprs,
            names,
        }
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> Result<Option<Row>> {
        let Some(row) = self.child.next(ctx)? else {
            return Ok(None);
        };
        ctx.record_instructions(ROW_STEP_COST);
        let values = self
            .exprs
            .iter()
            .map(|e| e.eval(&row))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Row::new(values)))
    }
}

/// Blocking in-memory sort. Materializes the whole child with per-row
/// budget checks, sorts once, then streams the buffer.
pub struct SortOp<'a> {
    pub(super) child: Box<Operator<'a>>,
    keys: Vec<SortKey>,
    buffer: Vec<(SmallVec<[Value; 4]>, Row)>,
    position: usize,
    charged: usize,
}

impl<'a> SortOp<'a> {
    pub fn new(child: Operator<'a>, keys: Vec<SortKey>) -> Self {
        Self {
            child: Box::new(child),
            keys,
            buffer: Vec::new(),
            position: 0,
            charged: 0,
        }
    }

    fn open(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        self.child.open(ctx)?;

        while let Some(row) = self.child.next(ctx)? {
            let mut key_values: SmallVec<[Value; 4]> = SmallVec::new();
            for key in &self.keys {
                key_values.push(key.expr.eval(&row)?);
            }

            let bytes =
                row.footprint() + key_values.iter().map(Value::footprint).sum::<usize>();
            ctx.charge_memory(bytes)?;
            self.charged += bytes;
            ctx.check_budget()?;

            self.buffer.push((key_values, row));
        }

        let keys = &self.keys;
        self.buffer.sort_by(|(a, _), (b, _)| {
            for (i, key) in keys.iter().enumerate() {
                let ordering = a[i].total_cmp(&b[i]);
                let ordering = if key.ascending {
                    ordering
                } else {
                    ordering.reverse()
                };
                if !ordering.is_eq() {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });

        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> Result<Option<Row>> {
        ctx.record_instructions(ROW_STEP_COST);
        if self.position >= self.buffer.len() {
            return Ok(None);
        }
        let row = std::mem::take(&mut self.buffer[self.position].1);
        self.position += 1;
        Ok(Some(row))
    }

    fn close(&mut self, ctx: &mut ExecutionContext) {
        self.buffer.clear();
        ctx.release_memory(self.charged);
        self.charged = 0;
        self.child.close(ctx);
    }
}

/// Skips `offset` rows, then emits at most `limit` (negative = unbounded).
pub struct LimitOp<'a> {
    pub(super) child: Box<Operator<'a>>,
    limit: i64,
    offset: i64,
    skipped: i64,
    emitted: i64,
}

impl<'a> LimitOp<'a> {
    pub fn new(child: Operator<'a>, limit: i64, offset: i64) -> Self {
        Self {
            child: Box::new(child),
            limit,
            offset: offset.max(0),
            skipped: 0,
            emitted: 0,
        }
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> Result<Option<Row>> {
        if self.limit >= 0 && self.emitted >= self.limit {
            return Ok(None);
        }

        while self.skipped < self.offset {
            if self.child.next(ctx)?.is_none() {
                return Ok(None);
            }
            self.skipped += 1;
        }

        match self.child.next(ctx)? {
            Some(row) => {
                self.emitted += 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }
}

/// COUNT/SUM/MIN/MAX/AVG with optional DISTINCT, optionally grouped.
/// Blocking: consumes the child into a group table on open.
pub struct AggregateOp<'a> {
    pub(super) child: Box<Operator<'a>>,
    aggregates: Vec<AggregateSpec>,
    group_by: Vec<Expr>,
    groups: Vec<(Vec<Value>, Vec<AggState>)>,
    index: HashMap<Vec<u8>, usize>,
    position: usize,
    charged: usize,
}

impl<'a> AggregateOp<'a> {
    pub fn new(child: Operator<'a>, aggregates: Vec<AggregateSpec>, group_by: Vec<Expr>) -> Self {
        Self {
            child: Box::new(child),
            aggregates,
            group_by,
            groups: Vec::new(),
            index: HashMap::new(),
            position: 0,
            charged: 0,
        }
    }

    fn output_names(&self) -> Vec<String> {
        let child_names = self.child.column_names();
        let mut names = Vec::with_capacity(self.group_by.len() + self.aggregates.len());
        for (i, expr) in self.group_by.iter().enumerate() {
            match expr {
                Expr::Column(index) if *index < child_names.len() => {
                    names.push(child_names[*index].clone())
                }
                _ => names.push(format!("group_{}", i)),
            }
        }
        names.extend(self.aggregates.iter().map(|a| a.output_name.clone()));
        names
    }

    fn open(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        self.child.open(ctx)?;

        let mut key_buf = Vec::new();
        while let Some(row) = self.child.next(ctx)? {
            ctx.record_instructions(ROW_STEP_COST);

            let group_values = self
                .group_by
                .iter()
                .map(|e| e.eval(&row))
                .collect::<Result<Vec<_>>>()?;
            encode_group_key(&group_values, &mut key_buf);

            let group_index = match self.index.get(&key_buf) {
                Some(&i) => i,
                None => {
                    let bytes = GROUP_ENTRY_OVERHEAD_BYTES
                        + group_values.iter().map(Value::footprint).sum::<usize>();
                    ctx.charge_memory(bytes)?;
                    self.charged += bytes;

                    let states = self
                        .aggregates
                        .iter()
                        .map(|spec| AggState::new(spec.func, spec.distinct))
                        .collect();
                    self.groups.push((group_values, states));
                    self.index.insert(key_buf.clone(), self.groups.len() - 1);
                    self.groups.len() - 1
                }
            };

            let states = &mut self.groups[group_index].1;
            for (spec, state) in self.aggregates.iter().zip(states.iter_mut()) {
                let value = match &spec.arg {
                    Some(expr) => Some(expr.eval(&row)?),
                    None => None,
                };
                let extra = state.update(value)?;
                if extra > 0 {
                    ctx.charge_memory(extra)?;
                    self.charged += extra;
                }
            }

            ctx.check_budget()?;
        }

        // A global aggregate over zero rows still produces one row
        // (COUNT = 0, the rest NULL).
        if self.group_by.is_empty() && self.groups.is_empty() {
            let states = self
                .aggregates
                .iter()
                .map(|spec| AggState::new(spec.func, spec.distinct))
                .collect();
            self.groups.push((Vec::new(), states));
        }

        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> Result<Option<Row>> {
        ctx.record_instructions(ROW_STEP_COST);
        let Some((group_values, states)) = self.groups.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;

        let mut values = group_values.clone();
        for state in states {
            values.push(state.finalize());
        }
        Ok(Some(Row::new(values)))
    }

    fn close(&mut self, ctx: &mut ExecutionContext) {
        self.groups.clear();
        self.index.clear();
        ctx.release_memory(self.charged);
        self.charged = 0;
        self.child.close(ctx);
    }
}

/// One aggregate accumulator.
struct AggState {
    func: AggregateFunc,
    seen: Option<HashSet<Vec<u8>>>,
    count: u64,
    sum_int: i64,
    sum_float: f64,
    float_mode: bool,
    extreme: Option<Value>,
}

impl AggState {
    fn new(func: AggregateFunc, distinct: bool) -> Self {
        Self {
            func,
            seen: distinct.then(HashSet::new),
            count: 0,
            sum_int: 0,
            sum_float: 0.0,
            float_mode: false,
            extreme: None,
        }
    }

    /// Folds one input. Returns extra bytes to charge (DISTINCT keys).
    fn update(&mut self, value: Option<Value>) -> Result<usize> {
        // COUNT(*) counts rows, everything else skips NULL inputs.
        let value = match value {
            None => {
                self.count += 1;
                return Ok(0);
            }
            Some(Value::Null) => return Ok(0),
            Some(v) => v,
        };

        let mut charged = 0;
        if let Some(seen) = &mut self.seen {
            let mut key = Vec::new();
            encode_group_key(std::slice::from_ref(&value), &mut key);
            let len = key.len();
            if !seen.insert(key) {
                return Ok(0);
            }
            charged = len + 32;
        }

        self.count += 1;
        match self.func {
            AggregateFunc::Count => {}
            AggregateFunc::Sum | AggregateFunc::Avg => match value {
                Value::Integer(i) => {
                    if self.float_mode {
                        self.sum_float += i as f64;
                    } else {
                        match self.sum_int.checked_add(i) {
                            Some(sum) => self.sum_int = sum,
                            None => {
                                self.float_mode = true;
                                self.sum_float += self.sum_int as f64 + i as f64;
                                self.sum_int = 0;
                            }
                        }
                    }
                }
                Value::Float(f) => {
                    if !self.float_mode {
                        self.float_mode = true;
                        self.sum_float += self.sum_int as f64;
                        self.sum_int = 0;
                    }
                    self.sum_float += f;
                }
                other => eyre::bail!(
                    "cannot aggregate {} values with SUM/AVG",
                    other.column_type().name()
                ),
            },
            AggregateFunc::Min => {
                let replace = match &self.extreme {
                    Some(current) => value.total_cmp(current).is_lt(),
                    None => true,
                };
                if replace {
                    self.extreme = Some(value);
                }
            }
            AggregateFunc::Max => {
                let replace = match &self.extreme {
                    Some(current) => value.total_cmp(current).is_gt(),
                    None => true,
                };
                if replace {
                    self.extreme = Some(value);
                }
            }
        }

        Ok(charged)
    }

    fn finalize(&self) -> Value {
        match self.func {
            AggregateFunc::Count => Value::Integer(self.count as i64),
            AggregateFunc::Sum => {
                if self.count == 0 {
                    Value::Null
                } else if self.float_mode {
                    Value::Float(self.sum_float)
                } else {
                    Value::Integer(self.sum_int)
                }
            }
            AggregateFunc::Avg => {
                if self.count == 0 {
                    Value::Null
                } else {
                    let total = if self.float_mode {
                        self.sum_float
                    } else {
                        self.sum_int as f64
                    };
                    Value::Float(total / self.count as f64)
                }
            }
            AggregateFunc::Min | AggregateFunc::Max => {
                self.extreme.clone().unwrap_or(Value::Null)
            }
        }
    }
}

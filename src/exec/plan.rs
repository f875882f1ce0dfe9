//! # Query Plans
//!
//! Plans are trees of tagged variants — one per operator kind — produced
//! by a trivial structural translation upstream (parsing and planning are
//! collaborators, not part of this core). Leaf DML/DDL statements are
//! plan roots of their own.
//!
//! Expressions are equally minimal: column references are positional
//! (the planner has already resolved names against the catalog),
//! literals, comparisons, boolean connectives, and arithmetic. Comparison
//! with NULL yields NULL, which no predicate accepts.

use eyre::{bail, Result};

use crate::catalog::ColumnInfo;
use crate::record::{Row, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

/// Scalar expression over one row.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Positional column reference.
    Column(usize),
    Literal(Value),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Not(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
}

impl Expr {
    pub fn col(index: usize) -> Self {
        Expr::Column(index)
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn eq(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Eq, lhs, rhs)
    }

    pub fn gt(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Gt, lhs, rhs)
    }

    pub fn lt(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Lt, lhs, rhs)
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::And, lhs, rhs)
    }

    /// Evaluates against a row. Column indices out of range are a plan
    /// translation bug and surface as errors, not panics.
    pub fn eval(&self, row: &Row) -> Result<Value> {
        match self {
            Expr::Column(index) => row
                .values
                .get(*index)
                .cloned()
                .ok_or_else(|| eyre::eyre!("column index {} out of range", index)),
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Not(inner) => {
                let value = inner.eval(row)?;
                if value.is_null() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Boolean(!value.is_true()))
                }
            }
            Expr::IsNull { expr, negated } => {
                let value = expr.eval(row)?;
                Ok(Value::Boolean(value.is_null() != *negated))
            }
            Expr::Binary { op, lhs, rhs } => {
                let left = lhs.eval(row)?;
                let right = rhs.eval(row)?;
                eval_binary(*op, left, right)
            }
        }
    }
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value> {
    use BinaryOp::*;

    match op {
        And => return Ok(Value::Boolean(left.is_true() && right.is_true())),
        Or => return Ok(Value::Boolean(left.is_true() || right.is_true())),
        _ => {}
    }

    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }

    match op {
        Eq | NotEq | Lt | LtEq | Gt | GtEq => {
            let ordering = left.total_cmp(&right);
            let result = match op {
                Eq => ordering.is_eq(),
                NotEq => !ordering.is_eq(),
                Lt => ordering.is_lt(),
                LtEq => ordering.is_le(),
                Gt => ordering.is_gt(),
                GtEq => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Boolean(result))
        }
        Add | Sub | Mul | Div => eval_arithmetic(op, left, right),
        And | Or => unreachable!(),
    }
}

fn eval_arithmetic(op: BinaryOp, left: Value, right: Value) -> Result<Value> {
    use BinaryOp::*;

    match (&left, &right) {
        (Value::Integer(a), Value::Integer(b)) => {
            let result = match op {
                Add => a.checked_add(*b),
                Sub => a.checked_sub(*b),
                Mul => a.checked_mul(*b),
                Div => {
                    if *b == 0 {
                        bail!("division by zero");
                    }
                    a.checked_div(*b)
                }
                _ => unreachable!(),
            };
            result
                .map(Value::Integer)
                .ok_or_else(|| eyre::eyre!("integer overflow in arithmetic"))
        }
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            let a = match left {
                Value::Integer(i) => i as f64,
                Value::Float(f) => f,
                _ => unreachable!(),
            };
            let b = match right {
                Value::Integer(i) => i as f64,
                Value::Float(f) => f,
                _ => unreachable!(),
            };
            let result = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Div => {
                    if b == 0.0 {
                        bail!("division by zero");
                    }
                    a / b
                }
                _ => unreachable!(),
            };
            Ok(Value::Float(result))
        }
        _ => bail!(
            "cannot apply {:?} to {} and {}",
            op,
            left.column_type().name(),
            right.column_type().name()
        ),
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

/// One ORDER BY key.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub expr: Expr,
    pub ascending: bool,
}

impl SortKey {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            ascending: true,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            ascending: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

/// One aggregate expression in an Aggregate node.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub func: AggregateFunc,
    /// `None` is COUNT(*).
    pub arg: Option<Expr>,
    pub distinct: bool,
    pub output_name: String,
}

impl AggregateSpec {
    pub fn new(func: AggregateFunc, arg: Option<Expr>, output_name: impl Into<String>) -> Self {
        Self {
            func,
            arg,
            distinct: false,
            output_name: output_name.into(),
        }
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn count_star(output_name: impl Into<String>) -> Self {
        Self::new(AggregateFunc::Count, None, output_name)
    }
}

/// Plan tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    TableScan {
        table: String,
    },
    Filter {
        child: Box<PlanNode>,
        predicate: Expr,
    },
    Project {
        child: Box<PlanNode>,
        exprs: Vec<Expr>,
        names: Vec<String>,
    },
    Sort {
        child: Box<PlanNode>,
        keys: Vec<SortKey>,
    },
    Limit {
        child: Box<PlanNode>,
        /// Negative means unbounded.
        limit: i64,
        offset: i64,
    },
    Aggregate {
        child: Box<PlanNode>,
        aggregates: Vec<AggregateSpec>,
        group_by: Vec<Expr>,
    },
    Insert {
        table: String,
        /// Empty means full schema order.
        columns: Vec<String>,
        rows: Vec<Vec<Expr>>,
    },
    CreateTable {
        table: String,
        columns: Vec<ColumnInfo>,
        if_not_exists: bool,
    },
    DropTable {
        table: String,
        if_exists: bool,
    },
}

impl PlanNode {
    pub fn table_scan(table: impl Into<String>) -> Self {
        PlanNode::TableScan {
            table: table.into(),
        }
    }

    pub fn filter(self, predicate: Expr) -> Self {
        PlanNode::Filter {
            child: Box::new(self),
            predicate,
        }
    }

    pub fn project(self, exprs: Vec<Expr>, names: Vec<String>) -> Self {
        PlanNode::Project {
            child: Box::new(self),
            exprs,
            names,
        }
    }

    pub fn sort(self, keys: Vec<SortKey>) -> Self {
        PlanNode::Sort {
            child: Box::new(self),
            keys,
        }
    }

    pub fn limit(self, limit: i64, offset: i64) -> Self {
        PlanNode::Limit {
            child: Box::new(self),
            limit,
            offset,
        }
    }

    pub fn aggregate(self, aggregates: Vec<AggregateSpec>, group_by: Vec<Expr>) -> Self {
        PlanNode::Aggregate {
            child: Box::new(self),
            aggregates,
            group_by,
        }
    }

    pub fn insert(
        table: impl Into<String>,
        columns: Vec<String>,
        rows: Vec<Vec<Expr>>,
    ) -> Self {
        PlanNode::Insert {
            table: table.into(),
            columns,
            rows,
        }
    }

    pub fn create_table(table: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        PlanNode::CreateTable {
            table: table.into(),
            columns,
            if_not_exists: false,
        }
    }

    pub fn drop_table(table: impl Into<String>) -> Self {
        PlanNode::DropTable {
            table: table.into(),
            if_exists: false,
        }
    }
}

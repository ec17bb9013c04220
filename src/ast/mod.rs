//! # Resolved Query Tree
//!
//! The input shape of the optimizer: a `SELECT` (or the query shell of an
//! `UPDATE`/`DELETE`) whose table and column references the semantic
//! analyzer has already resolved. Parsing and name resolution happen
//! upstream; everything here is spelled in catalog identifiers plus the
//! positional index of the `FROM` entry a column belongs to.

use crate::common::{ColumnId, TableId, Value};
use serde::{Deserialize, Serialize};

// ============================================================================
// Expressions
// ============================================================================

/// Comparison operators usable in a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// True for the operators that can bound a B+tree key range.
    pub fn is_range(self) -> bool {
        matches!(self, CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge)
    }

    pub fn mirror(self) -> CompareOp {
        match self {
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::Ne => CompareOp::Ne,
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
        }
    }
}

/// A resolved column reference: which `FROM` entry, which column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRef {
    /// Positional index into [`SelectQuery::specs`].
    pub spec: usize,
    pub column: ColumnId,
    pub name: String,
}

/// One sub-range of a `RANGE (r1, r2, ...)` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RangeBound {
    Eq(Value),
    Between(Value, Value),
    Ge(Value),
    Le(Value),
}

impl RangeBound {
    pub fn is_equality(&self) -> bool {
        matches!(self, RangeBound::Eq(_))
    }
}

/// Reference to an entry of [`SelectQuery::subqueries`].
pub type SubqueryRef = usize;

/// A resolved scalar or predicate expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Column(ColumnRef),
    Value(Value),
    Cmp {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Value>,
    },
    RangeList {
        expr: Box<Expr>,
        ranges: Vec<RangeBound>,
    },
    Like {
        expr: Box<Expr>,
        pattern: String,
    },
    Exists(SubqueryRef),
    InSubquery {
        expr: Box<Expr>,
        subquery: SubqueryRef,
    },
    Func {
        name: String,
        args: Vec<Expr>,
    },
    /// `ROWNUM` / `INST_NUM()`: the ordinal of a produced row.
    RowNum,
    /// `ORDERBY_NUM()`: the ordinal of a row after ordering.
    OrderByNum,
}

impl Expr {
    pub fn cmp(op: CompareOp, left: Expr, right: Expr) -> Expr {
        Expr::Cmp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::And(Box::new(left), Box::new(right))
    }

    /// Flatten the top-level conjunction into its conjuncts, in source order.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        self.collect_conjuncts(&mut out);
        out
    }

    fn collect_conjuncts<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        if let Expr::And(l, r) = self {
            l.collect_conjuncts(out);
            r.collect_conjuncts(out);
        } else {
            out.push(self);
        }
    }

    /// Visit every column reference in the expression.
    pub fn for_each_column<F: FnMut(&ColumnRef)>(&self, f: &mut F) {
        match self {
            Expr::Column(c) => f(c),
            Expr::Value(_) | Expr::RowNum | Expr::OrderByNum | Expr::Exists(_) => {}
            Expr::Cmp { left, right, .. } => {
                left.for_each_column(f);
                right.for_each_column(f);
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.for_each_column(f);
                r.for_each_column(f);
            }
            Expr::Not(e) | Expr::IsNull(e) | Expr::IsNotNull(e) => e.for_each_column(f),
            Expr::Between { expr, low, high } => {
                expr.for_each_column(f);
                low.for_each_column(f);
                high.for_each_column(f);
            }
            Expr::InList { expr, .. }
            | Expr::RangeList { expr, .. }
            | Expr::Like { expr, .. }
            | Expr::InSubquery { expr, .. } => expr.for_each_column(f),
            Expr::Func { args, .. } => {
                for a in args {
                    a.for_each_column(f);
                }
            }
        }
    }

    /// Visit every subquery reference in the expression.
    pub fn for_each_subquery<F: FnMut(SubqueryRef)>(&self, f: &mut F) {
        match self {
            Expr::Exists(sq) => f(*sq),
            Expr::InSubquery { expr, subquery } => {
                f(*subquery);
                expr.for_each_subquery(f);
            }
            Expr::Cmp { left, right, .. } => {
                left.for_each_subquery(f);
                right.for_each_subquery(f);
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.for_each_subquery(f);
                r.for_each_subquery(f);
            }
            Expr::Not(e) | Expr::IsNull(e) | Expr::IsNotNull(e) => e.for_each_subquery(f),
            Expr::Between { expr, low, high } => {
                expr.for_each_subquery(f);
                low.for_each_subquery(f);
                high.for_each_subquery(f);
            }
            Expr::InList { expr, .. } | Expr::RangeList { expr, .. } | Expr::Like { expr, .. } => {
                expr.for_each_subquery(f)
            }
            Expr::Func { args, .. } => {
                for a in args {
                    a.for_each_subquery(f);
                }
            }
            _ => {}
        }
    }

    /// True when the expression mentions `ROWNUM` or `ORDERBY_NUM()`.
    pub fn references_rownum(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e, Expr::RowNum | Expr::OrderByNum) {
                found = true;
            }
        });
        found
    }

    /// Pre-order traversal over every node of the expression.
    pub fn walk<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        match self {
            Expr::Cmp { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.walk(f);
                r.walk(f);
            }
            Expr::Not(e) | Expr::IsNull(e) | Expr::IsNotNull(e) => e.walk(f),
            Expr::Between { expr, low, high } => {
                expr.walk(f);
                low.walk(f);
                high.walk(f);
            }
            Expr::InList { expr, .. }
            | Expr::RangeList { expr, .. }
            | Expr::Like { expr, .. }
            | Expr::InSubquery { expr, .. } => expr.walk(f),
            Expr::Func { args, .. } => {
                for a in args {
                    a.walk(f);
                }
            }
            _ => {}
        }
    }

    /// The constant `false` literal, which short-circuits the whole query.
    pub fn is_false_constant(&self) -> bool {
        matches!(self, Expr::Value(Value::Boolean(false)))
    }
}

// ============================================================================
// FROM specs, hints, query shell
// ============================================================================

/// How a `FROM` entry joins the entries before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    /// First entry, or comma-separated cross join.
    None,
    Inner,
    LeftOuter,
    RightOuter,
}

impl JoinKind {
    pub fn is_outer(self) -> bool {
        matches!(self, JoinKind::LeftOuter | JoinKind::RightOuter)
    }
}

/// Join-method hints attached to one `FROM` entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHint {
    pub use_nl: bool,
    pub use_idx: bool,
    pub use_merge: bool,
}

impl NodeHint {
    /// True when no method hint constrains this node.
    pub fn is_empty(&self) -> bool {
        !(self.use_nl || self.use_idx || self.use_merge)
    }
}

/// An object-path dereference: this `FROM` entry was produced by following
/// an object-valued column of an earlier entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStep {
    pub spec: usize,
    pub column: ColumnId,
    pub name: String,
}

/// One `FROM` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FromSpec {
    pub class_id: TableId,
    pub alias: String,
    pub join_kind: JoinKind,
    /// The `ON` condition attached to this entry, when join syntax was used.
    pub on_clause: Option<Expr>,
    pub hint: NodeHint,
    pub path_from: Option<PathStep>,
    /// Earlier entries a correlated derived table depends on.
    pub depends_on: Vec<usize>,
}

impl FromSpec {
    pub fn table(class_id: TableId, alias: &str) -> Self {
        Self {
            class_id,
            alias: alias.to_string(),
            join_kind: JoinKind::None,
            on_clause: None,
            hint: NodeHint::default(),
            path_from: None,
            depends_on: Vec::new(),
        }
    }

    pub fn joined(mut self, kind: JoinKind, on: Expr) -> Self {
        self.join_kind = kind;
        self.on_clause = Some(on);
        self
    }
}

/// Query-level hint flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintSet {
    /// Force textual join order.
    pub ordered: bool,
    pub use_nl: bool,
    pub use_idx: bool,
    pub use_merge: bool,
    pub use_idx_desc: bool,
    pub no_idx_desc: bool,
    pub no_multi_range_opt: bool,
}

/// One `ORDER BY` or `GROUP BY` sort key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub column: ColumnRef,
    pub desc: bool,
}

/// `LIMIT` bounds. The upper bound visible to the optimizer is
/// `offset + count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    pub offset: u64,
    pub count: u64,
}

impl LimitSpec {
    pub fn upper_bound(&self) -> u64 {
        self.offset.saturating_add(self.count)
    }
}

/// Cost summary of an already-compiled correlated subquery. The optimizer
/// treats subqueries as opaque: it needs to know which outer entries they
/// reference, what they cost to re-evaluate, and roughly how many rows
/// they yield.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubquerySummary {
    pub correlated_specs: Vec<usize>,
    pub est_cardinality: Option<f64>,
    pub fixed_cost: f64,
    pub access_cost: f64,
}

/// Which statement shell the query tree came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    Select,
    UpdateShell,
    DeleteShell,
}

/// The resolved query consumed by the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectQuery {
    pub kind: QueryKind,
    /// Normalized statement text; hashed for the plan cache and echoed in
    /// plan dumps.
    pub text: String,
    pub specs: Vec<FromSpec>,
    pub where_clause: Option<Expr>,
    pub select_list: Vec<Expr>,
    pub group_by: Vec<OrderSpec>,
    pub with_rollup: bool,
    pub has_aggregate: bool,
    pub order_by: Vec<OrderSpec>,
    pub distinct: bool,
    pub limit: Option<LimitSpec>,
    /// The `FOR ORDERBY_NUM() ...` predicate, when present.
    pub orderby_for: Option<Expr>,
    pub hints: HintSet,
    pub subqueries: Vec<SubquerySummary>,
}

impl SelectQuery {
    /// A bare `SELECT ... FROM ...` shell, for building queries in code.
    pub fn new(text: &str, specs: Vec<FromSpec>) -> Self {
        Self {
            kind: QueryKind::Select,
            text: text.to_string(),
            specs,
            where_clause: None,
            select_list: Vec::new(),
            group_by: Vec::new(),
            with_rollup: false,
            has_aggregate: false,
            order_by: Vec::new(),
            distinct: false,
            limit: None,
            orderby_for: None,
            hints: HintSet::default(),
            subqueries: Vec::new(),
        }
    }

    /// The row-count upper bound usable for SORT-LIMIT and multi-range
    /// optimization: an explicit `LIMIT`, or a constant upper bound from an
    /// `ORDERBY_NUM() <= n` / `ROWNUM <= n` predicate.
    pub fn upper_bound(&self) -> Option<u64> {
        if let Some(limit) = &self.limit {
            return Some(limit.upper_bound());
        }
        if let Some(pred) = &self.orderby_for {
            return rownum_upper_bound(pred);
        }
        self.where_clause.as_ref().and_then(rownum_upper_bound)
    }
}

/// Extract a constant upper bound from `ROWNUM`/`ORDERBY_NUM` comparisons in
/// a conjunction. `< n` yields `n - 1`; `<= n` and `= n` yield `n`.
pub fn rownum_upper_bound(pred: &Expr) -> Option<u64> {
    let mut upper: Option<u64> = None;
    for conj in pred.conjuncts() {
        if let Expr::Cmp { op, left, right } = conj {
            let (op, bound) = match (left.as_ref(), right.as_ref()) {
                (Expr::RowNum, Expr::Value(v)) | (Expr::OrderByNum, Expr::Value(v)) => (*op, v),
                (Expr::Value(v), Expr::RowNum) | (Expr::Value(v), Expr::OrderByNum) => {
                    (op.mirror(), v)
                }
                _ => continue,
            };
            let n = match bound.as_limit() {
                Some(n) => n,
                None => continue,
            };
            let candidate = match op {
                CompareOp::Lt => n.saturating_sub(1),
                CompareOp::Le | CompareOp::Eq => n,
                _ => continue,
            };
            upper = Some(upper.map_or(candidate, |u| u.min(candidate)));
        }
    }
    upper
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conjunct_flattening() {
        let e = Expr::and(
            Expr::and(
                Expr::cmp(CompareOp::Eq, Expr::RowNum, Expr::Value(Value::Integer(1))),
                Expr::IsNull(Box::new(Expr::RowNum)),
            ),
            Expr::Not(Box::new(Expr::RowNum)),
        );
        assert_eq!(e.conjuncts().len(), 3);
    }

    #[test]
    fn test_rownum_upper_bound_forms() {
        let lt = Expr::cmp(CompareOp::Lt, Expr::RowNum, Expr::Value(Value::Integer(10)));
        assert_eq!(rownum_upper_bound(&lt), Some(9));

        let le = Expr::cmp(
            CompareOp::Le,
            Expr::OrderByNum,
            Expr::Value(Value::Integer(10)),
        );
        assert_eq!(rownum_upper_bound(&le), Some(10));

        // mirrored: 10 >= ORDERBY_NUM()
        let mirrored = Expr::cmp(
            CompareOp::Ge,
            Expr::Value(Value::Integer(10)),
            Expr::OrderByNum,
        );
        assert_eq!(rownum_upper_bound(&mirrored), Some(10));

        // two bounds collapse to the tighter one
        let both = Expr::and(
            Expr::cmp(CompareOp::Le, Expr::RowNum, Expr::Value(Value::Integer(10))),
            Expr::cmp(CompareOp::Lt, Expr::RowNum, Expr::Value(Value::Integer(7))),
        );
        assert_eq!(rownum_upper_bound(&both), Some(6));
    }

    #[test]
    fn test_query_upper_bound_prefers_limit() {
        let mut q = SelectQuery::new("SELECT 1", vec![]);
        q.limit = Some(LimitSpec { offset: 5, count: 20 });
        assert_eq!(q.upper_bound(), Some(25));
    }
}

//! # Selectivity Estimation
//!
//! Recursive selectivity of predicate trees over the query graph. All
//! estimates are fractions in `[0, 1]`; composition clamps at every OR.
//! Distinct counts come from index statistics when the column is indexed,
//! otherwise the operator falls back to a fixed default.

use crate::ast::{CompareOp, Expr, RangeBound};
use crate::common::NodeIdx;
use crate::optimizer::graph::QueryGraph;

/// Default selectivity of an equality with no usable statistics.
pub const DEFAULT_EQUI_SELECTIVITY: f64 = 0.001;
/// Selectivity of `IS NULL`.
pub const IS_NULL_SELECTIVITY: f64 = 0.01;
/// Selectivity of `EXISTS (subquery)`.
pub const EXISTS_SELECTIVITY: f64 = 0.1;
/// Selectivity of `LIKE`, a tunable with a small default.
pub const LIKE_SELECTIVITY: f64 = 0.1;
/// Selectivity of `BETWEEN` and other closed ranges.
pub const BETWEEN_SELECTIVITY: f64 = 0.01;
/// Selectivity of an open comparison (`<`, `>`, ...).
pub const COMPARISON_SELECTIVITY: f64 = 0.1;
/// Cap applied to `IN`-list and range-list unions.
pub const RANGELIST_CAP: f64 = 0.5;
/// Output-cardinality guess for an `IN (subquery)` with no estimate.
pub const DEFAULT_SUBQUERY_CARDINALITY: f64 = 1000.0;
/// Upper bounds above this never produce SORT-LIMIT plans.
pub const SORT_LIMIT_MAX_ROWS: u64 = 1000;

fn clamp(s: f64) -> f64 {
    s.clamp(0.0, 1.0)
}

/// Compute and store the selectivity of every term, then fold sarg
/// selectivities into their nodes.
pub fn assign_term_selectivities(graph: &mut QueryGraph) {
    for i in 0..graph.terms.len() {
        let sel = match &graph.terms[i].expr {
            Some(expr) => expr_selectivity(graph, expr),
            // fabricated edges restrict nothing
            None => 1.0,
        };
        graph.terms[i].selectivity = sel;
    }
    for n in 0..graph.nodes.len() {
        let mut sel = 1.0;
        for t in graph.nodes[n].sargs.iter() {
            sel *= graph.terms[t].selectivity;
        }
        graph.nodes[n].selectivity = clamp(sel);
    }
}

/// Selectivity of an arbitrary predicate expression.
pub fn expr_selectivity(graph: &QueryGraph, expr: &Expr) -> f64 {
    match expr {
        Expr::And(l, r) => clamp(expr_selectivity(graph, l) * expr_selectivity(graph, r)),
        Expr::Or(l, r) => {
            let (a, b) = (expr_selectivity(graph, l), expr_selectivity(graph, r));
            clamp(a + b - a * b)
        }
        Expr::Not(e) => clamp(1.0 - expr_selectivity(graph, e)),
        Expr::Cmp { op, left, right } => comparison_selectivity(graph, *op, left, right),
        Expr::IsNull(_) => IS_NULL_SELECTIVITY,
        Expr::IsNotNull(_) => 1.0 - IS_NULL_SELECTIVITY,
        Expr::Between { .. } => BETWEEN_SELECTIVITY,
        Expr::Like { .. } => LIKE_SELECTIVITY,
        Expr::Exists(_) => EXISTS_SELECTIVITY,
        Expr::InList { expr, list } => {
            let eq = equality_selectivity(graph, expr);
            clamp((list.len() as f64 * eq).min(RANGELIST_CAP))
        }
        Expr::RangeList { expr, ranges } => rangelist_selectivity(graph, expr, ranges),
        Expr::InSubquery { expr, subquery } => {
            let eq = equality_selectivity(graph, expr);
            let card = graph
                .query
                .subqueries
                .get(*subquery)
                .and_then(|s| s.est_cardinality)
                .unwrap_or(DEFAULT_SUBQUERY_CARDINALITY);
            clamp((card * eq).min(RANGELIST_CAP))
        }
        // constants, rownum markers, bare columns and functions restrict
        // nothing by themselves
        _ => 1.0,
    }
}

fn comparison_selectivity(graph: &QueryGraph, op: CompareOp, left: &Expr, right: &Expr) -> f64 {
    match op {
        CompareOp::Eq => {
            let l = indexed_distinct(graph, left);
            let r = indexed_distinct(graph, right);
            let l_is_attr = matches!(left, Expr::Column(_));
            let r_is_attr = matches!(right, Expr::Column(_));
            match (l_is_attr, r_is_attr) {
                // attr = attr: the larger distinct count dominates
                (true, true) => match (l, r) {
                    (Some(a), Some(b)) => 1.0 / (a.max(b) as f64).max(1.0),
                    (Some(a), None) | (None, Some(a)) => 1.0 / (a as f64).max(1.0),
                    (None, None) => DEFAULT_EQUI_SELECTIVITY,
                },
                // attr = const
                (true, false) => l
                    .map(|d| 1.0 / (d as f64).max(1.0))
                    .unwrap_or(DEFAULT_EQUI_SELECTIVITY),
                (false, true) => r
                    .map(|d| 1.0 / (d as f64).max(1.0))
                    .unwrap_or(DEFAULT_EQUI_SELECTIVITY),
                (false, false) => DEFAULT_EQUI_SELECTIVITY,
            }
        }
        CompareOp::Ne => clamp(1.0 - equality_selectivity_sides(graph, left, right)),
        _ => COMPARISON_SELECTIVITY,
    }
}

/// Equality selectivity driven by the column side of a predicate.
fn equality_selectivity(graph: &QueryGraph, expr: &Expr) -> f64 {
    indexed_distinct(graph, expr)
        .map(|d| 1.0 / (d as f64).max(1.0))
        .unwrap_or(DEFAULT_EQUI_SELECTIVITY)
}

fn equality_selectivity_sides(graph: &QueryGraph, left: &Expr, right: &Expr) -> f64 {
    comparison_selectivity(graph, CompareOp::Eq, left, right)
}

fn rangelist_selectivity(graph: &QueryGraph, expr: &Expr, ranges: &[RangeBound]) -> f64 {
    let eq = equality_selectivity(graph, expr);
    let mut sel = 0.0;
    for r in ranges {
        sel += if r.is_equality() { eq } else { BETWEEN_SELECTIVITY };
    }
    clamp(sel.min(RANGELIST_CAP))
}

/// Distinct count of a bare column reference, when the column is indexed.
fn indexed_distinct(graph: &QueryGraph, expr: &Expr) -> Option<u64> {
    let Expr::Column(c) = expr else { return None };
    let node: NodeIdx = c.spec;
    let stats = &graph.nodes.get(node)?.stats;
    if stats.column_indexed(c.column) {
        stats.column_distinct(c.column)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ColumnRef, Expr, FromSpec, SelectQuery};
    use crate::common::Value;
    use crate::optimizer::graph::tests::catalog;
    use crate::optimizer::graph::QueryGraph;

    fn graph_one_table() -> QueryGraph {
        let mut q = SelectQuery::new("SELECT c0 FROM r", vec![FromSpec::table(1, "r")]);
        q.select_list = vec![Expr::Column(ColumnRef {
            spec: 0,
            column: 0,
            name: "c0".into(),
        })];
        QueryGraph::build(&q, &catalog()).unwrap()
    }

    fn col(column: u16) -> Expr {
        Expr::Column(ColumnRef {
            spec: 0,
            column,
            name: format!("c{}", column),
        })
    }

    #[test]
    fn test_equality_on_indexed_column() {
        let g = graph_one_table();
        // c0 is the unique pk of r (1000 rows)
        let e = Expr::cmp(CompareOp::Eq, col(0), Expr::Value(Value::Integer(5)));
        let s = expr_selectivity(&g, &e);
        assert!((s - 0.001).abs() < 1e-9);
    }

    #[test]
    fn test_equality_without_index_uses_default() {
        let g = graph_one_table();
        let e = Expr::cmp(CompareOp::Eq, col(2), Expr::Value(Value::Integer(5)));
        assert_eq!(expr_selectivity(&g, &e), DEFAULT_EQUI_SELECTIVITY);
    }

    #[test]
    fn test_boolean_composition_clamps() {
        let g = graph_one_table();
        let half = Expr::InList {
            expr: Box::new(col(0)),
            list: (0..1000).map(Value::Integer).collect(),
        };
        // capped at 0.5 even though 1000 * 0.001 = 1.0
        assert_eq!(expr_selectivity(&g, &half), 0.5);

        let or = Expr::Or(Box::new(half.clone()), Box::new(half.clone()));
        let s = expr_selectivity(&g, &or);
        assert!(s <= 1.0 && s >= 0.5);

        let not = Expr::Not(Box::new(or));
        let s = expr_selectivity(&g, &not);
        assert!((0.0..=0.5).contains(&s));
    }

    #[test]
    fn test_null_and_range_defaults() {
        let g = graph_one_table();
        assert_eq!(
            expr_selectivity(&g, &Expr::IsNull(Box::new(col(1)))),
            IS_NULL_SELECTIVITY
        );
        assert_eq!(
            expr_selectivity(&g, &Expr::IsNotNull(Box::new(col(1)))),
            1.0 - IS_NULL_SELECTIVITY
        );
        let between = Expr::Between {
            expr: Box::new(col(1)),
            low: Box::new(Expr::Value(Value::Integer(1))),
            high: Box::new(Expr::Value(Value::Integer(9))),
        };
        assert_eq!(expr_selectivity(&g, &between), BETWEEN_SELECTIVITY);
    }

    #[test]
    fn test_rangelist_counts_equalities() {
        let g = graph_one_table();
        let e = Expr::RangeList {
            expr: Box::new(col(0)),
            ranges: vec![
                RangeBound::Eq(Value::Integer(1)),
                RangeBound::Eq(Value::Integer(2)),
                RangeBound::Eq(Value::Integer(3)),
            ],
        };
        let s = expr_selectivity(&g, &e);
        assert!((s - 0.003).abs() < 1e-9);
    }

    #[test]
    fn test_selectivity_always_in_unit_interval() {
        let g = graph_one_table();
        let exprs = vec![
            Expr::cmp(CompareOp::Lt, col(1), Expr::Value(Value::Integer(7))),
            Expr::Like {
                expr: Box::new(col(1)),
                pattern: "a%".into(),
            },
            Expr::Not(Box::new(Expr::IsNull(Box::new(col(0))))),
        ];
        for e in exprs {
            let s = expr_selectivity(&g, &e);
            assert!((0.0..=1.0).contains(&s), "selectivity {} out of range", s);
        }
    }
}

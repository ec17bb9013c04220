//! # Plan Dump
//!
//! Explain output. One walker drives a pluggable [`PlanFormatter`]; the
//! text formatter prints the familiar indented tree, the JSON formatter
//! builds a `serde_json::Value` with the same fields.

use crate::optimizer::graph::{JoinType, QueryGraph};
use crate::optimizer::plan::{
    JoinMethod, MultiRangeOpt, Plan, PlanArena, PlanId, PlanKind, ScanMethod, SortType,
};
use serde_json::{json, Value as Json};
use std::fmt::Write as _;

/// Scan-level fields every formatter receives.
#[derive(Debug, Clone)]
pub struct ScanDump {
    pub method: ScanMethod,
    pub table: String,
    pub index: Option<String>,
    pub key_range_terms: usize,
    pub key_filter_terms: usize,
    pub covered: bool,
    pub descending: bool,
    pub iss: bool,
    pub loose: bool,
    pub multi_range_opt: bool,
}

/// One formatter = one output shape. The walker calls these in tree order.
pub trait PlanFormatter {
    fn enter_scan(&mut self, depth: usize, scan: &ScanDump, cost: f64, cardinality: f64);
    fn enter_sort(&mut self, depth: usize, sort_type: SortType, cost: f64, cardinality: f64);
    fn enter_join(
        &mut self,
        depth: usize,
        join_type: JoinType,
        method: JoinMethod,
        cost: f64,
        cardinality: f64,
    );
    fn enter_follow(&mut self, depth: usize, cost: f64, cardinality: f64);
    fn enter_worst(&mut self, depth: usize);
}

/// Walk `plan`, feeding the formatter.
pub fn walk_plan(
    graph: &QueryGraph,
    arena: &PlanArena,
    plan: PlanId,
    formatter: &mut dyn PlanFormatter,
) {
    walk(graph, arena, plan, 0, formatter);
}

fn walk(
    graph: &QueryGraph,
    arena: &PlanArena,
    plan: PlanId,
    depth: usize,
    f: &mut dyn PlanFormatter,
) {
    let p: &Plan = arena.get(plan);
    let cost = p.cost.total();
    match &p.kind {
        PlanKind::Scan {
            method,
            node,
            index,
            terms,
            kf_terms,
            index_cover,
            index_iss,
            index_loose,
            ..
        } => {
            let node_ref = &graph.nodes[*node];
            let scan = ScanDump {
                method: *method,
                table: node_ref.alias.clone(),
                index: index.map(|ci| node_ref.indexes[ci].stats.name.clone()),
                key_range_terms: terms.cardinality(),
                key_filter_terms: kf_terms.cardinality(),
                covered: *index_cover,
                descending: p.use_iscan_descending,
                iss: *index_iss,
                loose: *index_loose,
                multi_range_opt: p.multi_range_opt == MultiRangeOpt::Use,
            };
            f.enter_scan(depth, &scan, cost, p.cardinality);
        }
        PlanKind::Sort { sort_type, subplan } => {
            f.enter_sort(depth, *sort_type, cost, p.cardinality);
            walk(graph, arena, *subplan, depth + 1, f);
        }
        PlanKind::Join {
            join_type,
            join_method,
            outer,
            inner,
            ..
        } => {
            f.enter_join(depth, *join_type, *join_method, cost, p.cardinality);
            walk(graph, arena, *outer, depth + 1, f);
            walk(graph, arena, *inner, depth + 1, f);
        }
        PlanKind::Follow { head, .. } => {
            f.enter_follow(depth, cost, p.cardinality);
            walk(graph, arena, *head, depth + 1, f);
        }
        PlanKind::Worst => f.enter_worst(depth),
    }
}

// ============================================================================
// Text
// ============================================================================

/// Human-readable indented dump.
#[derive(Default)]
pub struct TextFormatter {
    out: String,
}

impl TextFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> String {
        self.out
    }

    fn line(&mut self, depth: usize, s: &str) {
        for _ in 0..depth {
            self.out.push_str("  ");
        }
        self.out.push_str(s);
        self.out.push('\n');
    }
}

impl PlanFormatter for TextFormatter {
    fn enter_scan(&mut self, depth: usize, scan: &ScanDump, cost: f64, cardinality: f64) {
        let mut s = match (&scan.index, scan.method) {
            (None, _) => format!("sscan({})", scan.table),
            (Some(idx), ScanMethod::IndexOrderByScan) => {
                format!("iscan({} {}) (orderby skip)", scan.table, idx)
            }
            (Some(idx), ScanMethod::IndexGroupByScan) => {
                format!("iscan({} {}) (groupby skip)", scan.table, idx)
            }
            (Some(idx), _) => format!("iscan({} {})", scan.table, idx),
        };
        if scan.key_range_terms > 0 {
            let _ = write!(s, " key_range: {}", scan.key_range_terms);
        }
        if scan.key_filter_terms > 0 {
            let _ = write!(s, " key_filter: {}", scan.key_filter_terms);
        }
        if scan.covered {
            s.push_str(" (covers)");
        }
        if scan.descending {
            s.push_str(" (desc_index)");
        }
        if scan.iss {
            s.push_str(" (index skip scan)");
        }
        if scan.loose {
            s.push_str(" (loose index scan)");
        }
        if scan.multi_range_opt {
            s.push_str(" (multi_range_opt)");
        }
        let _ = write!(s, " cost: {:.2} card: {:.0}", cost, cardinality);
        self.line(depth, &s);
    }

    fn enter_sort(&mut self, depth: usize, sort_type: SortType, cost: f64, cardinality: f64) {
        let name = match sort_type {
            SortType::TempList => "temp",
            SortType::OrderBy => "orderby",
            SortType::GroupBy => "groupby",
            SortType::Distinct => "distinct",
            SortType::Limit => "limit",
        };
        self.line(
            depth,
            &format!("sort({}) cost: {:.2} card: {:.0}", name, cost, cardinality),
        );
    }

    fn enter_join(
        &mut self,
        depth: usize,
        join_type: JoinType,
        method: JoinMethod,
        cost: f64,
        cardinality: f64,
    ) {
        let m = match method {
            JoinMethod::NlJoin => "nl-join",
            JoinMethod::IdxJoin => "idx-join",
            JoinMethod::MergeJoin => "m-join",
        };
        let t = match join_type {
            JoinType::Cross => "cross",
            JoinType::Inner => "inner",
            JoinType::Left => "left",
            JoinType::Right => "right",
        };
        self.line(
            depth,
            &format!("{} ({}) cost: {:.2} card: {:.0}", m, t, cost, cardinality),
        );
    }

    fn enter_follow(&mut self, depth: usize, cost: f64, cardinality: f64) {
        self.line(
            depth,
            &format!("follow cost: {:.2} card: {:.0}", cost, cardinality),
        );
    }

    fn enter_worst(&mut self, depth: usize) {
        self.line(depth, "worst (unoptimized)");
    }
}

// ============================================================================
// JSON
// ============================================================================

/// Structured dump; fields mirror the text formatter.
#[derive(Default)]
pub struct JsonFormatter {
    stack: Vec<(usize, Json)>,
}

impl JsonFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold the visited nodes back into one tree.
    pub fn finish(mut self, query_text: &str) -> Json {
        let mut root = match self.fold(0) {
            Some(v) => v,
            None => Json::Null,
        };
        if let Json::Object(map) = &mut root {
            map.insert("query".to_string(), json!(query_text));
        }
        root
    }

    fn push(&mut self, depth: usize, value: Json) {
        self.stack.push((depth, value));
    }

    fn fold(&mut self, depth: usize) -> Option<Json> {
        if self.stack.is_empty() {
            return None;
        }
        let (d, mut node) = self.stack.remove(0);
        if d != depth {
            return None;
        }
        let mut children = Vec::new();
        while let Some((d2, _)) = self.stack.first() {
            if *d2 == depth + 1 {
                if let Some(child) = self.fold(depth + 1) {
                    children.push(child);
                }
            } else {
                break;
            }
        }
        if !children.is_empty() {
            if let Json::Object(map) = &mut node {
                map.insert("children".to_string(), Json::Array(children));
            }
        }
        Some(node)
    }
}

impl PlanFormatter for JsonFormatter {
    fn enter_scan(&mut self, depth: usize, scan: &ScanDump, cost: f64, cardinality: f64) {
        self.push(
            depth,
            json!({
                "op": if scan.index.is_some() { "iscan" } else { "sscan" },
                "table": scan.table,
                "index": scan.index,
                "key_range_terms": scan.key_range_terms,
                "key_filter_terms": scan.key_filter_terms,
                "covered": scan.covered,
                "descending": scan.descending,
                "index_skip_scan": scan.iss,
                "loose_index_scan": scan.loose,
                "multi_range_opt": scan.multi_range_opt,
                "orderby_skip": scan.method == ScanMethod::IndexOrderByScan,
                "groupby_skip": scan.method == ScanMethod::IndexGroupByScan,
                "cost": cost,
                "cardinality": cardinality,
            }),
        );
    }

    fn enter_sort(&mut self, depth: usize, sort_type: SortType, cost: f64, cardinality: f64) {
        self.push(
            depth,
            json!({
                "op": "sort",
                "sort": format!("{:?}", sort_type).to_lowercase(),
                "cost": cost,
                "cardinality": cardinality,
            }),
        );
    }

    fn enter_join(
        &mut self,
        depth: usize,
        join_type: JoinType,
        method: JoinMethod,
        cost: f64,
        cardinality: f64,
    ) {
        self.push(
            depth,
            json!({
                "op": "join",
                "method": format!("{:?}", method).to_lowercase(),
                "type": format!("{:?}", join_type).to_lowercase(),
                "cost": cost,
                "cardinality": cardinality,
            }),
        );
    }

    fn enter_follow(&mut self, depth: usize, cost: f64, cardinality: f64) {
        self.push(
            depth,
            json!({ "op": "follow", "cost": cost, "cardinality": cardinality }),
        );
    }

    fn enter_worst(&mut self, depth: usize) {
        self.push(depth, json!({ "op": "worst" }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ColumnRef, CompareOp, Expr, FromSpec, SelectQuery};
    use crate::common::Value;
    use crate::optimizer::cost::CostPolicy;
    use crate::optimizer::graph::tests::catalog;
    use crate::optimizer::planner;

    fn sample() -> (QueryGraph, crate::optimizer::planner::SearchResult) {
        let mut q = SelectQuery::new(
            "SELECT c1 FROM r WHERE c0 = 5",
            vec![FromSpec::table(1, "r")],
        );
        q.select_list = vec![Expr::Column(ColumnRef {
            spec: 0,
            column: 1,
            name: "c1".into(),
        })];
        q.where_clause = Some(Expr::cmp(
            CompareOp::Eq,
            Expr::Column(ColumnRef {
                spec: 0,
                column: 0,
                name: "c0".into(),
            }),
            Expr::Value(Value::Integer(5)),
        ));
        let graph = QueryGraph::build(&q, &catalog()).unwrap();
        let result = planner::search(&graph, &CostPolicy::default());
        (graph, result)
    }

    #[test]
    fn test_text_dump_mentions_index() {
        let (graph, result) = sample();
        let mut f = TextFormatter::new();
        walk_plan(&graph, &result.arena, result.plan, &mut f);
        let text = f.finish();
        assert!(text.contains("iscan(r pk_r)"), "dump was: {}", text);
        assert!(text.contains("key_range: 1"));
    }

    #[test]
    fn test_json_dump_round_trips_fields() {
        let (graph, result) = sample();
        let mut f = JsonFormatter::new();
        walk_plan(&graph, &result.arena, result.plan, &mut f);
        let v = f.finish(&graph.query.text);
        assert_eq!(v["op"], "iscan");
        assert_eq!(v["table"], "r");
        assert_eq!(v["index"], "pk_r");
        assert_eq!(v["query"], "SELECT c1 FROM r WHERE c0 = 5");
        // the dump parses back as JSON identically
        let text = serde_json::to_string(&v).unwrap();
        let back: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, v);
    }
}

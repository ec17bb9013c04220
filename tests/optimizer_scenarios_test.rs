//! End-to-end optimizer scenarios: resolved query in, plan + executor tree
//! out, checked against the behavior the engine promises.

use quarry_db::ast::{
    ColumnRef, CompareOp, Expr, FromSpec, JoinKind, LimitSpec, OrderSpec, SelectQuery,
};
use quarry_db::catalog::{ClassStats, ColumnMeta, IndexStats, MemoryCatalog};
use quarry_db::common::Value;
use quarry_db::optimizer::cost::CostPolicy;
use quarry_db::optimizer::plan::{
    cmp_plans, JoinMethod, PlanCompare, PlanKind, ScanMethod, SortType,
};
use quarry_db::optimizer::{
    planner, OptimizeOutcome, OptimizerConfig, QueryGraph, QueryOptimizer,
};
use quarry_db::xasl::{AccessMethod, XaslKind};
use std::sync::Arc;

fn col(spec: usize, column: u16, name: &str) -> Expr {
    Expr::Column(ColumnRef {
        spec,
        column,
        name: name.into(),
    })
}

fn order(spec: usize, column: u16, name: &str, desc: bool) -> OrderSpec {
    OrderSpec {
        column: ColumnRef {
            spec,
            column,
            name: name.into(),
        },
        desc,
    }
}

/// T(a int PK, b int); R(x); S(y indexed, z); both join tables are large
/// enough that index strategies pay off.
fn catalog() -> MemoryCatalog {
    let cat = MemoryCatalog::new();
    cat.register(ClassStats {
        id: 1,
        name: "t".into(),
        ncard: 10_000,
        tcard: 300,
        columns: vec![
            ColumnMeta {
                id: 0,
                name: "a".into(),
                not_null: true,
                distinct: Some(10_000),
            },
            ColumnMeta {
                id: 1,
                name: "b".into(),
                not_null: false,
                distinct: Some(500),
            },
        ],
        indexes: vec![IndexStats {
            id: 100,
            name: "pk_t".into(),
            columns: vec![0],
            col_asc: vec![true],
            unique: true,
            filtered: false,
            height: 2,
            leafs: 60,
            pages: 64,
            keys: 10_000,
            pkeys: vec![10_000],
        }],
    });
    cat.register(ClassStats {
        id: 2,
        name: "r".into(),
        ncard: 2_000,
        tcard: 80,
        columns: vec![ColumnMeta {
            id: 0,
            name: "x".into(),
            not_null: false,
            distinct: Some(2_000),
        }],
        indexes: vec![],
    });
    cat.register(ClassStats {
        id: 3,
        name: "s".into(),
        ncard: 500_000,
        tcard: 20_000,
        columns: vec![
            ColumnMeta {
                id: 0,
                name: "y".into(),
                not_null: false,
                distinct: Some(500_000),
            },
            ColumnMeta {
                id: 1,
                name: "z".into(),
                not_null: false,
                distinct: Some(100),
            },
        ],
        indexes: vec![IndexStats {
            id: 300,
            name: "idx_s_y".into(),
            columns: vec![0],
            col_asc: vec![true],
            unique: false,
            filtered: false,
            height: 3,
            leafs: 4_000,
            pages: 4_100,
            keys: 500_000,
            pkeys: vec![500_000],
        }],
    });
    cat
}

fn optimizer() -> QueryOptimizer {
    QueryOptimizer::new(Arc::new(catalog()), OptimizerConfig::default())
}

// ----------------------------------------------------------------------
// Scenario 1: single-table equality on a unique index
// ----------------------------------------------------------------------

#[test]
fn unique_index_equality_is_a_forced_winner() {
    let mut q = SelectQuery::new(
        "SELECT * FROM t WHERE a = 5",
        vec![FromSpec::table(1, "t")],
    );
    q.select_list = vec![col(0, 0, "a"), col(0, 1, "b")];
    q.where_clause = Some(Expr::cmp(
        CompareOp::Eq,
        col(0, 0, "a"),
        Expr::Value(Value::Integer(5)),
    ));

    let o = optimizer().optimize(&q).ok().expect("plan");
    let plan = o.arena.get(o.plan);
    let PlanKind::Scan {
        index: Some(_),
        index_equi,
        terms,
        ..
    } = &plan.kind
    else {
        panic!("expected index scan, got {:?}", plan.kind);
    };
    assert!(*index_equi, "all unique columns bound by equality");
    assert_eq!(terms.cardinality(), 1);
    assert_eq!(plan.cost.total(), 0.0);

    // the key range carries a = 5
    let specs = o.xasl.all_specs();
    let AccessMethod::Index(ia) = &specs[0].access else {
        panic!("expected index access");
    };
    assert_eq!(ia.index_name, "pk_t");
    assert_eq!(ia.key_ranges.len(), 1);
}

// ----------------------------------------------------------------------
// Scenario 2: two-table equi-join with an index on the inner
// ----------------------------------------------------------------------

#[test]
fn equi_join_uses_correlated_index_inner() {
    let mut q = SelectQuery::new(
        "SELECT * FROM r, s WHERE r.x = s.y",
        vec![FromSpec::table(2, "r"), FromSpec::table(3, "s")],
    );
    q.select_list = vec![col(0, 0, "x"), col(1, 1, "z")];
    q.where_clause = Some(Expr::cmp(CompareOp::Eq, col(0, 0, "x"), col(1, 0, "y")));

    let o = optimizer().optimize(&q).ok().expect("plan");
    let plan = o.arena.get(o.plan);
    let PlanKind::Join {
        join_method,
        outer,
        inner,
        ..
    } = &plan.kind
    else {
        panic!("expected join, got {:?}", plan.kind);
    };
    assert_eq!(*join_method, JoinMethod::IdxJoin);
    assert_eq!(o.arena.get(*outer).scan_node(), Some(0), "seq scan of r drives");
    match &o.arena.get(*inner).kind {
        PlanKind::Scan {
            node,
            index: Some(_),
            terms,
            ..
        } => {
            assert_eq!(*node, 1);
            assert_eq!(terms.cardinality(), 1, "key range is the join edge");
        }
        other => panic!("expected correlated index scan, got {:?}", other),
    }
}

// ----------------------------------------------------------------------
// Scenario 3: order-by skip, ascending and descending
// ----------------------------------------------------------------------

#[test]
fn order_by_rides_the_index() {
    let mut q = SelectQuery::new("SELECT a FROM t ORDER BY a", vec![FromSpec::table(1, "t")]);
    q.select_list = vec![col(0, 0, "a")];
    q.order_by = vec![order(0, 0, "a", false)];

    let o = optimizer().optimize(&q).ok().expect("plan");
    let plan = o.arena.get(o.plan);
    match &plan.kind {
        PlanKind::Scan {
            method: ScanMethod::IndexOrderByScan,
            ..
        } => {}
        other => panic!("expected order-skip scan on pk_t, got {:?}", other),
    }
    assert!(!plan.use_iscan_descending);

    // descending works because a is NOT NULL
    let mut q2 = q.clone();
    q2.order_by = vec![order(0, 0, "a", true)];
    let o2 = optimizer().optimize(&q2).ok().expect("plan");
    let plan2 = o2.arena.get(o2.plan);
    match &plan2.kind {
        PlanKind::Scan {
            method: ScanMethod::IndexOrderByScan,
            ..
        } => {}
        other => panic!("expected order-skip scan, got {:?}", other),
    }
    assert!(plan2.use_iscan_descending);
}

// ----------------------------------------------------------------------
// Scenario 4: multi-range optimization
// ----------------------------------------------------------------------

#[test]
fn in_list_with_limit_uses_multi_range_opt() {
    let mut q = SelectQuery::new(
        "SELECT a FROM t WHERE a IN (1,2,3) ORDER BY a LIMIT 5",
        vec![FromSpec::table(1, "t")],
    );
    q.select_list = vec![col(0, 0, "a")];
    q.where_clause = Some(Expr::InList {
        expr: Box::new(col(0, 0, "a")),
        list: vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)],
    });
    q.order_by = vec![order(0, 0, "a", false)];
    q.limit = Some(LimitSpec { offset: 0, count: 5 });

    let o = optimizer().optimize(&q).ok().expect("plan");
    let specs = o.xasl.all_specs();
    let mro_spec = specs.iter().find_map(|s| match &s.access {
        AccessMethod::Index(ia) if ia.multi_range_opt => Some(ia),
        _ => None,
    });
    let ia = mro_spec.expect("expected a multi-range-optimized index scan");
    let kl = ia.key_limit.as_ref().expect("keylimit");
    assert_eq!(kl.upper, Some(Expr::Value(Value::Integer(5))));

    // and no sort node above the scan
    match &o.xasl.kind {
        XaslKind::ScanChain { .. } => {}
        other => panic!("no sort expected above the MRO scan, got {:?}", other),
    }
}

// ----------------------------------------------------------------------
// Scenario 5: merge join over two sorted lists
// ----------------------------------------------------------------------

#[test]
fn merge_join_builds_two_sorted_lists() {
    let cat = MemoryCatalog::new();
    for (id, name) in [(10u32, "big_r"), (11u32, "big_s")] {
        cat.register(ClassStats {
            id,
            name: name.into(),
            ncard: 800_000,
            tcard: 40_000,
            columns: vec![ColumnMeta {
                id: 0,
                name: "k".into(),
                not_null: false,
                distinct: Some(1_000),
            }],
            indexes: vec![],
        });
    }
    let mut q = SelectQuery::new(
        "SELECT * FROM big_r, big_s WHERE big_r.k = big_s.k",
        vec![FromSpec::table(10, "big_r"), FromSpec::table(11, "big_s")],
    );
    q.select_list = vec![col(0, 0, "k"), col(1, 0, "k")];
    q.where_clause = Some(Expr::cmp(CompareOp::Eq, col(0, 0, "k"), col(1, 0, "k")));
    q.hints.use_merge = true;

    let opt = QueryOptimizer::new(Arc::new(cat), OptimizerConfig::default());
    let o = opt.optimize(&q).ok().expect("plan");

    let plan = o.arena.get(o.plan);
    let PlanKind::Join {
        join_method,
        outer,
        inner,
        join_terms,
        ..
    } = &plan.kind
    else {
        panic!("expected merge join, got {:?}", plan.kind);
    };
    assert_eq!(*join_method, JoinMethod::MergeJoin);
    assert_eq!(join_terms.cardinality(), 1);
    for side in [outer, inner] {
        match &o.arena.get(*side).kind {
            PlanKind::Sort {
                sort_type: SortType::TempList,
                ..
            } => {}
            other => panic!("merge children must be SORT_TEMP, got {:?}", other),
        }
    }

    // after generation both sides are list builds with ASC leading sort
    let XaslKind::ListScan { input, .. } = &o.xasl.kind else {
        panic!("expected list scan over merge, got {:?}", o.xasl.kind);
    };
    let XaslKind::MergeList { outer, inner, merge } = &input.kind else {
        panic!("expected merge list");
    };
    assert!(merge.outer_sort.iter().all(|s| s.asc));
    assert!(merge.inner_sort.iter().all(|s| s.asc));
    for side in [outer, inner] {
        assert!(matches!(side.kind, XaslKind::BuildList { .. }));
    }
}

// ----------------------------------------------------------------------
// Scenario 6: outer-join sarg restriction
// ----------------------------------------------------------------------

#[test]
fn where_sarg_over_outer_inner_filters_after_join() {
    let mut q = SelectQuery::new(
        "SELECT * FROM r LEFT JOIN s ON r.x = s.y WHERE s.z > 0",
        vec![
            FromSpec::table(2, "r"),
            FromSpec::table(3, "s").joined(
                JoinKind::LeftOuter,
                Expr::cmp(CompareOp::Eq, col(0, 0, "x"), col(1, 0, "y")),
            ),
        ],
    );
    q.select_list = vec![col(0, 0, "x"), col(1, 1, "z")];
    q.where_clause = Some(Expr::cmp(
        CompareOp::Gt,
        col(1, 1, "z"),
        Expr::Value(Value::Integer(0)),
    ));

    let o = optimizer().optimize(&q).ok().expect("plan");
    assert!(
        o.xasl.if_pred.is_some(),
        "s.z > 0 must run after outer-null rows are produced"
    );
    for spec in o.xasl.all_specs() {
        if spec.node == 1 {
            assert!(spec.outer_join_inner);
            if let AccessMethod::Index(ia) = &spec.access {
                assert!(
                    ia.key_filter.is_none(),
                    "no WHERE sarg may become a key filter on the inner"
                );
            }
            assert!(
                spec.access_pred.is_none(),
                "no WHERE sarg may become a data filter on the inner"
            );
        }
    }
}

// ----------------------------------------------------------------------
// Properties and boundaries
// ----------------------------------------------------------------------

#[test]
fn costs_are_finite_nonnegative_and_fixed_bounded() {
    let queries = sample_queries();
    let opt = optimizer();
    for q in &queries {
        let o = opt.optimize(q).ok().expect("plan");
        let mut stack = vec![o.plan];
        while let Some(id) = stack.pop() {
            let p = o.arena.get(id);
            let c = &p.cost;
            assert!(c.total().is_finite(), "finite cost for {:?}", p.kind);
            assert!(c.fixed() >= 0.0 && c.variable() >= 0.0);
            assert!(c.fixed() <= c.total() + 1e-9);
            assert!(p.cardinality >= 0.0);
            match &p.kind {
                PlanKind::Sort { subplan, .. } => stack.push(*subplan),
                PlanKind::Join { outer, inner, .. } => {
                    stack.push(*outer);
                    stack.push(*inner);
                }
                PlanKind::Follow { head, .. } => stack.push(*head),
                _ => {}
            }
        }
    }
}

#[test]
fn plan_comparison_is_consistent() {
    let mut q = SelectQuery::new(
        "SELECT a FROM t WHERE b = 3 ORDER BY a",
        vec![FromSpec::table(1, "t")],
    );
    q.select_list = vec![col(0, 0, "a")];
    q.where_clause = Some(Expr::cmp(
        CompareOp::Eq,
        col(0, 1, "b"),
        Expr::Value(Value::Integer(3)),
    ));
    q.order_by = vec![order(0, 0, "a", false)];
    let graph = QueryGraph::build(&q, &catalog()).unwrap();
    let result = planner::search(&graph, &CostPolicy::default());

    // walk every live plan reachable from the winner and cross-compare
    let mut plans = vec![result.plan];
    let mut i = 0;
    while i < plans.len() {
        match &result.arena.get(plans[i]).kind {
            PlanKind::Sort { subplan, .. } => plans.push(*subplan),
            PlanKind::Join { outer, inner, .. } => {
                plans.push(*outer);
                plans.push(*inner);
            }
            PlanKind::Follow { head, .. } => plans.push(*head),
            _ => {}
        }
        i += 1;
    }
    for &a in &plans {
        assert_eq!(
            cmp_plans(&result.arena, &graph, a, a),
            PlanCompare::Eq,
            "compare(a,a) must be EQ"
        );
        for &b in &plans {
            let ab = cmp_plans(&result.arena, &graph, a, b);
            let ba = cmp_plans(&result.arena, &graph, b, a);
            match ab {
                PlanCompare::Lt => assert_eq!(ba, PlanCompare::Gt),
                PlanCompare::Gt => assert_eq!(ba, PlanCompare::Lt),
                PlanCompare::Eq => assert_eq!(ba, PlanCompare::Eq),
                PlanCompare::Unk => {}
            }
        }
    }
}

#[test]
fn zero_cardinality_table_plans_sequentially() {
    let cat = MemoryCatalog::new();
    cat.register(ClassStats {
        id: 5,
        name: "empty".into(),
        ncard: 0,
        tcard: 0,
        columns: vec![ColumnMeta {
            id: 0,
            name: "a".into(),
            not_null: false,
            distinct: Some(0),
        }],
        indexes: vec![],
    });
    let mut q = SelectQuery::new("SELECT a FROM empty", vec![FromSpec::table(5, "empty")]);
    q.select_list = vec![col(0, 0, "a")];
    let opt = QueryOptimizer::new(Arc::new(cat), OptimizerConfig::default());
    let o = opt.optimize(&q).ok().expect("plan");
    let plan = o.arena.get(o.plan);
    assert!(matches!(
        plan.kind,
        PlanKind::Scan {
            method: ScanMethod::SeqScan,
            ..
        }
    ));
    assert_eq!(plan.cardinality, 0.0);
}

#[test]
fn merge_join_disabled_by_configuration() {
    let cat = MemoryCatalog::new();
    for (id, name) in [(10u32, "big_r"), (11u32, "big_s")] {
        cat.register(ClassStats {
            id,
            name: name.into(),
            ncard: 800_000,
            tcard: 40_000,
            columns: vec![ColumnMeta {
                id: 0,
                name: "k".into(),
                not_null: false,
                distinct: Some(1_000),
            }],
            indexes: vec![],
        });
    }
    let mut q = SelectQuery::new(
        "SELECT * FROM big_r, big_s WHERE big_r.k = big_s.k",
        vec![FromSpec::table(10, "big_r"), FromSpec::table(11, "big_s")],
    );
    q.select_list = vec![col(0, 0, "k")];
    q.where_clause = Some(Expr::cmp(CompareOp::Eq, col(0, 0, "k"), col(1, 0, "k")));
    q.hints.use_merge = true;

    let config = OptimizerConfig {
        merge_join_enabled: false,
        ..OptimizerConfig::default()
    };
    let opt = QueryOptimizer::new(Arc::new(cat), config);
    let o = opt.optimize(&q).ok().expect("plan");
    let plan = o.arena.get(o.plan);
    if let PlanKind::Join { join_method, .. } = &plan.kind {
        assert_ne!(*join_method, JoinMethod::MergeJoin);
    }
}

#[test]
fn failure_surface_is_clean() {
    let opt = QueryOptimizer::new(Arc::new(MemoryCatalog::new()), OptimizerConfig::default());
    let mut q = SelectQuery::new("SELECT a FROM ghost", vec![FromSpec::table(99, "ghost")]);
    q.select_list = vec![col(0, 0, "a")];
    match opt.optimize(&q) {
        OptimizeOutcome::Fail(_) => {}
        _ => panic!("missing class must fail cleanly"),
    }
}

fn sample_queries() -> Vec<SelectQuery> {
    let mut out = Vec::new();

    let mut q1 = SelectQuery::new("SELECT b FROM t WHERE a < 100", vec![FromSpec::table(1, "t")]);
    q1.select_list = vec![col(0, 1, "b")];
    q1.where_clause = Some(Expr::cmp(
        CompareOp::Lt,
        col(0, 0, "a"),
        Expr::Value(Value::Integer(100)),
    ));
    out.push(q1);

    let mut q2 = SelectQuery::new(
        "SELECT * FROM r, s WHERE r.x = s.y AND s.z = 1",
        vec![FromSpec::table(2, "r"), FromSpec::table(3, "s")],
    );
    q2.select_list = vec![col(0, 0, "x"), col(1, 1, "z")];
    q2.where_clause = Some(Expr::and(
        Expr::cmp(CompareOp::Eq, col(0, 0, "x"), col(1, 0, "y")),
        Expr::cmp(CompareOp::Eq, col(1, 1, "z"), Expr::Value(Value::Integer(1))),
    ));
    out.push(q2);

    let mut q3 = SelectQuery::new(
        "SELECT a FROM t ORDER BY a LIMIT 7",
        vec![FromSpec::table(1, "t")],
    );
    q3.select_list = vec![col(0, 0, "a")];
    q3.order_by = vec![order(0, 0, "a", false)];
    q3.limit = Some(LimitSpec { offset: 0, count: 7 });
    out.push(q3);

    out
}

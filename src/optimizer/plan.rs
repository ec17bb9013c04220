//! # Plan Model
//!
//! The tagged plan variants produced by the search, the arena that owns
//! them, and the layered plan comparison. Plans reference their children by
//! arena id with refcounts; retired plans go back on a free list so the
//! enumeration loop does not churn the allocator. Plans never point back at
//! the graph or the planner.

use crate::ast::OrderSpec;
use crate::common::{EqClassIdx, NodeIdx, TermIdx};
use crate::optimizer::bitset::Bitset;
use crate::optimizer::cost::Cost;
use crate::optimizer::graph::{JoinType, QueryGraph};
use std::cmp::Ordering;

/// Arena id of a plan.
pub type PlanId = usize;

/// Scan strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ScanMethod {
    SeqScan,
    IndexScan,
    /// Index scan chosen to skip the `ORDER BY` sort.
    IndexOrderByScan,
    /// Index scan chosen to skip the `GROUP BY` sort.
    IndexGroupByScan,
}

/// Join strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JoinMethod {
    NlJoin,
    /// Nested loop whose inner is a correlated index scan on the join
    /// columns.
    IdxJoin,
    MergeJoin,
}

/// Temp-file flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SortType {
    /// Unordered or ordered temp list feeding a join side.
    TempList,
    OrderBy,
    GroupBy,
    Distinct,
    /// In-memory top-K bounded by the query limit.
    Limit,
}

/// Whether a plan uses multi-range optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MultiRangeOpt {
    Use,
    No,
    CannotUse,
    CanUse,
}

/// Per-variant payloads.
#[derive(Debug, Clone)]
pub enum PlanKind {
    Scan {
        method: ScanMethod,
        node: NodeIdx,
        /// Position of the chosen candidate in the node's index list.
        index: Option<usize>,
        /// Key-range terms on the chosen index.
        terms: Bitset,
        /// Key-filter terms evaluated inside the B+tree scan.
        kf_terms: Bitset,
        index_equi: bool,
        index_cover: bool,
        index_iss: bool,
        index_loose: bool,
    },
    Sort {
        sort_type: SortType,
        subplan: PlanId,
    },
    Join {
        join_type: JoinType,
        join_method: JoinMethod,
        outer: PlanId,
        inner: PlanId,
        join_terms: Bitset,
        during_join_terms: Bitset,
        /// Merge outer join only: edges that must re-check on the merged
        /// stream.
        other_outer_join_terms: Bitset,
        after_join_terms: Bitset,
    },
    Follow {
        head: PlanId,
        path_term: TermIdx,
    },
    /// The fallback when search is impossible; infinite cost.
    Worst,
}

/// One candidate execution strategy.
#[derive(Debug, Clone)]
pub struct Plan {
    pub kind: PlanKind,
    pub cost: Cost,
    pub cardinality: f64,
    /// Non-edge terms this plan (not its children) evaluates.
    pub sarged_terms: Bitset,
    /// Correlated subqueries re-evaluated per row of this plan.
    pub subqueries: Bitset,
    /// Interesting order of the output, as an equivalence class.
    pub order: Option<EqClassIdx>,
    /// Sort fields an interesting-order index scan satisfies.
    pub iscan_sort_list: Vec<OrderSpec>,
    /// Set only on the finalized top plan; gates ORDER BY/GROUP BY sorts.
    pub top_rooted: bool,
    /// Scan plans and follow chains over them need no temp files.
    pub well_rooted: bool,
    pub multi_range_opt: MultiRangeOpt,
    pub has_sort_limit: bool,
    pub use_iscan_descending: bool,
}

impl Plan {
    pub fn worst() -> Plan {
        Plan {
            kind: PlanKind::Worst,
            cost: Cost::worst(),
            cardinality: 0.0,
            sarged_terms: Bitset::new(),
            subqueries: Bitset::new(),
            order: None,
            iscan_sort_list: Vec::new(),
            top_rooted: false,
            well_rooted: false,
            multi_range_opt: MultiRangeOpt::No,
            has_sort_limit: false,
            use_iscan_descending: false,
        }
    }

    pub fn is_scan(&self) -> bool {
        matches!(self.kind, PlanKind::Scan { .. })
    }

    pub fn is_index_scan(&self) -> bool {
        matches!(
            self.kind,
            PlanKind::Scan {
                index: Some(_),
                ..
            }
        )
    }

    /// An index scan whose output order the query cares about.
    pub fn is_interesting_order_scan(&self) -> bool {
        matches!(
            self.kind,
            PlanKind::Scan {
                method: ScanMethod::IndexOrderByScan | ScanMethod::IndexGroupByScan,
                ..
            }
        ) || (self.is_index_scan() && self.order.is_some())
    }

    pub fn is_sort(&self) -> bool {
        matches!(self.kind, PlanKind::Sort { .. })
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, PlanKind::Join { .. })
    }

    pub fn scan_node(&self) -> Option<NodeIdx> {
        match &self.kind {
            PlanKind::Scan { node, .. } => Some(*node),
            _ => None,
        }
    }
}

// ============================================================================
// Arena
// ============================================================================

struct Slot {
    plan: Option<Plan>,
    refcount: u32,
}

/// Owns every plan of one optimization; freed wholesale at teardown.
#[derive(Default)]
pub struct PlanArena {
    slots: Vec<Slot>,
    free: Vec<PlanId>,
    allocated: usize,
}

impl PlanArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate with refcount 1.
    pub fn alloc(&mut self, plan: Plan) -> PlanId {
        self.allocated += 1;
        if let Some(id) = self.free.pop() {
            self.slots[id] = Slot {
                plan: Some(plan),
                refcount: 1,
            };
            id
        } else {
            self.slots.push(Slot {
                plan: Some(plan),
                refcount: 1,
            });
            self.slots.len() - 1
        }
    }

    pub fn get(&self, id: PlanId) -> &Plan {
        self.slots[id].plan.as_ref().expect("dangling plan id")
    }

    pub fn get_mut(&mut self, id: PlanId) -> &mut Plan {
        self.slots[id].plan.as_mut().expect("dangling plan id")
    }

    pub fn add_ref(&mut self, id: PlanId) -> PlanId {
        self.slots[id].refcount += 1;
        id
    }

    /// Drop one reference; a plan hitting zero is retired to the free list
    /// along with its references to children.
    pub fn del_ref(&mut self, id: PlanId) {
        let slot = &mut self.slots[id];
        debug_assert!(slot.refcount > 0);
        slot.refcount -= 1;
        if slot.refcount > 0 {
            return;
        }
        let plan = slot.plan.take().expect("double free of plan");
        self.free.push(id);
        match plan.kind {
            PlanKind::Sort { subplan, .. } => self.del_ref(subplan),
            PlanKind::Join { outer, inner, .. } => {
                self.del_ref(outer);
                self.del_ref(inner);
            }
            PlanKind::Follow { head, .. } => self.del_ref(head),
            _ => {}
        }
    }

    /// Total plans ever allocated, for search statistics.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

// ============================================================================
// Comparison
// ============================================================================

/// Four-valued plan comparison result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanCompare {
    Lt,
    Eq,
    Gt,
    Unk,
}

impl PlanCompare {
    pub fn flip(self) -> PlanCompare {
        match self {
            PlanCompare::Lt => PlanCompare::Gt,
            PlanCompare::Gt => PlanCompare::Lt,
            other => other,
        }
    }
}

/// Layered plan comparison. The early layers encode structural knowledge
/// the raw cost numbers cannot see; total cost is the last resort.
pub fn cmp_plans(arena: &PlanArena, graph: &QueryGraph, a_id: PlanId, b_id: PlanId) -> PlanCompare {
    let a = arena.get(a_id);
    let b = arena.get(b_id);

    if matches!(a.kind, PlanKind::Worst) && matches!(b.kind, PlanKind::Worst) {
        return PlanCompare::Eq;
    }
    if matches!(a.kind, PlanKind::Worst) {
        return PlanCompare::Gt;
    }
    if matches!(b.kind, PlanKind::Worst) {
        return PlanCompare::Lt;
    }

    // 1. a SORT-LIMIT wrapper beats the bare plan when a limit exists
    if graph.limit_value.is_some() && a.has_sort_limit != b.has_sort_limit {
        return if a.has_sort_limit {
            PlanCompare::Lt
        } else {
            PlanCompare::Gt
        };
    }

    // 2. an ordered-skip scan beats a sort over a scan of the same node
    if let Some(r) = skip_vs_sorted(arena, a, b) {
        return r;
    }
    if let Some(r) = skip_vs_sorted(arena, b, a) {
        return r.flip();
    }

    // 3. index scans on the same node compare structurally first
    if let (
        PlanKind::Scan {
            node: na,
            index: Some(ia),
            terms: ta,
            kf_terms: ka,
            index_equi: ea,
            index_cover: ca,
            ..
        },
        PlanKind::Scan {
            node: nb,
            index: Some(ib),
            terms: tb,
            kf_terms: kb,
            index_equi: eb,
            index_cover: cb,
            ..
        },
    ) = (&a.kind, &b.kind)
    {
        if na == nb {
            if *ea != *eb {
                return if *ea { PlanCompare::Lt } else { PlanCompare::Gt };
            }
            let mro_a = a.multi_range_opt == MultiRangeOpt::Use;
            let mro_b = b.multi_range_opt == MultiRangeOpt::Use;
            if mro_a != mro_b {
                return if mro_a { PlanCompare::Lt } else { PlanCompare::Gt };
            }
            if *ca != *cb {
                return if *ca { PlanCompare::Lt } else { PlanCompare::Gt };
            }
            // range-term superset with at least as many filters dominates
            if tb.is_subset_of(ta) && ta != tb && ka.cardinality() >= kb.cardinality() {
                return PlanCompare::Lt;
            }
            if ta.is_subset_of(tb) && ta != tb && kb.cardinality() >= ka.cardinality() {
                return PlanCompare::Gt;
            }
            let node = &graph.nodes[*na];
            let pages_a = node.indexes[*ia].stats.pages;
            let pages_b = node.indexes[*ib].stats.pages;
            if pages_a != pages_b {
                return if pages_a < pages_b {
                    PlanCompare::Lt
                } else {
                    PlanCompare::Gt
                };
            }
            match ta.cardinality().cmp(&tb.cardinality()) {
                Ordering::Greater => return PlanCompare::Lt,
                Ordering::Less => return PlanCompare::Gt,
                Ordering::Equal => {}
            }
            match ka.cardinality().cmp(&kb.cardinality()) {
                Ordering::Greater => return PlanCompare::Lt,
                Ordering::Less => return PlanCompare::Gt,
                Ordering::Equal => {}
            }
        }
    }

    // a covering index scan beats a sequential scan of the same node
    if let (PlanKind::Scan { node: na, index: Some(_), index_cover: true, .. },
            PlanKind::Scan { node: nb, index: None, .. }) = (&a.kind, &b.kind)
    {
        if na == nb {
            return PlanCompare::Lt;
        }
    }
    if let (PlanKind::Scan { node: na, index: None, .. },
            PlanKind::Scan { node: nb, index: Some(_), index_cover: true, .. }) = (&a.kind, &b.kind)
    {
        if na == nb {
            return PlanCompare::Gt;
        }
    }

    // 4. total cost decides the rest
    let (ta, tb) = (a.cost.total(), b.cost.total());
    if (ta - tb).abs() < f64::EPSILON {
        PlanCompare::Eq
    } else if ta < tb {
        PlanCompare::Lt
    } else {
        PlanCompare::Gt
    }
}

/// `a` skips a sort that `b` pays for explicitly over the same node.
fn skip_vs_sorted(arena: &PlanArena, a: &Plan, b: &Plan) -> Option<PlanCompare> {
    if !a.is_interesting_order_scan() {
        return None;
    }
    let PlanKind::Sort { sort_type, subplan } = &b.kind else {
        return None;
    };
    if !matches!(sort_type, SortType::OrderBy | SortType::GroupBy) {
        return None;
    }
    let sub = arena.get(*subplan);
    if sub.scan_node() == a.scan_node() && a.scan_node().is_some() {
        Some(PlanCompare::Lt)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FromSpec, SelectQuery};
    use crate::optimizer::graph::tests::catalog;

    fn graph() -> QueryGraph {
        let mut q = SelectQuery::new("SELECT c0 FROM r", vec![FromSpec::table(1, "r")]);
        q.select_list = vec![crate::ast::Expr::Column(crate::ast::ColumnRef {
            spec: 0,
            column: 0,
            name: "c0".into(),
        })];
        QueryGraph::build(&q, &catalog()).unwrap()
    }

    fn scan(cost_total: f64) -> Plan {
        Plan {
            kind: PlanKind::Scan {
                method: ScanMethod::SeqScan,
                node: 0,
                index: None,
                terms: Bitset::new(),
                kf_terms: Bitset::new(),
                index_equi: false,
                index_cover: false,
                index_iss: false,
                index_loose: false,
            },
            cost: Cost::new(0.0, 0.0, cost_total / 2.0, cost_total / 2.0),
            cardinality: 100.0,
            sarged_terms: Bitset::new(),
            subqueries: Bitset::new(),
            order: None,
            iscan_sort_list: Vec::new(),
            top_rooted: false,
            well_rooted: true,
            multi_range_opt: MultiRangeOpt::No,
            has_sort_limit: false,
            use_iscan_descending: false,
        }
    }

    #[test]
    fn test_arena_refcount_and_free_list() {
        let mut arena = PlanArena::new();
        let child = arena.alloc(scan(10.0));
        let child_ref = arena.add_ref(child);
        let parent = arena.alloc(Plan {
            kind: PlanKind::Sort {
                sort_type: SortType::TempList,
                subplan: child_ref,
            },
            ..scan(20.0)
        });
        // child: 1 (alloc) + 1 (parent ref)
        arena.del_ref(child);
        assert_eq!(arena.live(), 2, "parent still holds the child");
        arena.del_ref(parent);
        assert_eq!(arena.live(), 0);

        // the free list hands slots back
        let again = arena.alloc(scan(1.0));
        assert!(again == parent || again == child);
    }

    #[test]
    fn test_cmp_antisymmetric_and_reflexive() {
        let g = graph();
        let mut arena = PlanArena::new();
        let cheap = arena.alloc(scan(10.0));
        let pricey = arena.alloc(scan(90.0));
        assert_eq!(cmp_plans(&arena, &g, cheap, pricey), PlanCompare::Lt);
        assert_eq!(cmp_plans(&arena, &g, pricey, cheap), PlanCompare::Gt);
        assert_eq!(cmp_plans(&arena, &g, cheap, cheap), PlanCompare::Eq);
    }

    #[test]
    fn test_worst_plan_always_loses() {
        let g = graph();
        let mut arena = PlanArena::new();
        let normal = arena.alloc(scan(1e12));
        let worst = arena.alloc(Plan::worst());
        assert_eq!(cmp_plans(&arena, &g, normal, worst), PlanCompare::Lt);
        assert_eq!(cmp_plans(&arena, &g, worst, normal), PlanCompare::Gt);
        assert_eq!(cmp_plans(&arena, &g, worst, worst), PlanCompare::Eq);
    }

    #[test]
    fn test_orderby_skip_beats_sort_over_scan() {
        let g = graph();
        let mut arena = PlanArena::new();

        let mut skip = scan(50.0);
        skip.kind = PlanKind::Scan {
            method: ScanMethod::IndexOrderByScan,
            node: 0,
            index: Some(0),
            terms: Bitset::new(),
            kf_terms: Bitset::new(),
            index_equi: false,
            index_cover: false,
            index_iss: false,
            index_loose: false,
        };
        skip.order = Some(0);
        let skip = arena.alloc(skip);

        let base = arena.alloc(scan(1.0));
        let sorted = arena.alloc(Plan {
            kind: PlanKind::Sort {
                sort_type: SortType::OrderBy,
                subplan: base,
            },
            ..scan(1.0)
        });
        assert_eq!(cmp_plans(&arena, &g, skip, sorted), PlanCompare::Lt);
        assert_eq!(cmp_plans(&arena, &g, sorted, skip), PlanCompare::Gt);
    }
}

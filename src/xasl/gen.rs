//! # Plan-to-XASL Translation
//!
//! Walks the finalized plan and emits the executor tree. The generator
//! owns the predicate slotting: every real term is consumed exactly once,
//! landing in the tightest slot its class and the chosen access path allow.
//! Fake terms are never slotted.

use crate::ast::{CompareOp, Expr};
use crate::common::{NodeIdx, SegIdx, TermIdx};
use crate::error::DbError;
use crate::optimizer::bitset::Bitset;
use crate::optimizer::graph::{JoinType, QueryGraph, TermClass};
use crate::optimizer::plan::{
    JoinMethod, MultiRangeOpt, PlanArena, PlanId, PlanKind, ScanMethod, SortType,
};
use crate::xasl::{
    AccessMethod, AccessSpec, FetchSpec, IndexAccess, KeyLimit, KeyRange, MergeColumn, MergeSpec,
    SortSpec, XaslKind, XaslNode,
};
use crate::Result;
use tracing::trace;

/// Translate `plan` into an executor tree. The tree owns clones of the
/// predicate expressions; the optimizer keeps nothing.
pub fn generate(graph: &QueryGraph, arena: &PlanArena, plan: PlanId) -> Result<XaslNode> {
    let mut generator = Generator {
        graph,
        arena,
        used: graph.fake_terms.clone(),
    };
    let mut root = generator.gen(plan)?;

    // ROWNUM-family predicates always run last
    let instnum_terms = generator.take_class(TermClass::TotallyAfterJoin);
    root.instnum_pred = generator.conjunction(&instnum_terms);

    // anything still unclaimed lands on the top if-pred; the slotting
    // invariant says this should already be empty for well-formed plans
    let leftovers: Vec<TermIdx> = (0..graph.terms.len())
        .filter(|&t| !generator.used.contains(t))
        .collect();
    if !leftovers.is_empty() {
        trace!(count = leftovers.len(), "residual terms slotted at root");
        let pred = generator.conjunction(&leftovers);
        root.if_pred = generator.and_opt(root.if_pred.take(), pred);
        for t in leftovers {
            generator.used.add(t);
        }
    }

    root.projected = graph.final_segs.iter().collect();
    generator.attach_key_limit(plan, &mut root);
    Ok(root)
}

struct Generator<'a> {
    graph: &'a QueryGraph,
    arena: &'a PlanArena,
    /// Terms already slotted somewhere; slotting is exactly-once.
    used: Bitset,
}

impl<'a> Generator<'a> {
    fn gen(&mut self, plan: PlanId) -> Result<XaslNode> {
        let p = self.arena.get(plan);
        match &p.kind {
            PlanKind::Scan { .. } => {
                let spec = self.make_access_spec(plan, None, false)?;
                let mut node = XaslNode::new(XaslKind::ScanChain { specs: vec![spec] });
                node.subqueries = p.subqueries.iter().collect();
                node.projected = self.scan_projection(plan);
                Ok(node)
            }
            PlanKind::Sort { sort_type, subplan } => self.gen_sort(*sort_type, *subplan, plan),
            PlanKind::Join {
                join_method: JoinMethod::MergeJoin,
                ..
            } => self.gen_merge_join(plan),
            PlanKind::Join { .. } => self.gen_nl_join(plan),
            PlanKind::Follow { head, path_term } => self.gen_follow(*head, *path_term),
            PlanKind::Worst => self.gen_worst(),
        }
    }

    // ------------------------------------------------------------------
    // Scans
    // ------------------------------------------------------------------

    /// Build the access spec for a scan plan. `join_edge_ranges` carries
    /// the join-edge terms a correlated index join uses as key columns;
    /// `join_inner` marks a spec running with the outer row in scope, the
    /// only place a join edge may sink below the join itself.
    fn make_access_spec(
        &mut self,
        plan: PlanId,
        join_edge_ranges: Option<&Bitset>,
        join_inner: bool,
    ) -> Result<AccessSpec> {
        let p = self.arena.get(plan).clone();
        let PlanKind::Scan {
            method,
            node,
            index,
            terms,
            kf_terms,
            index_cover,
            index_iss,
            index_loose,
            ..
        } = &p.kind
        else {
            return Err(DbError::Internal("access spec from non-scan plan".into()));
        };
        let n = *node;
        let node_ref = &self.graph.nodes[n];

        let access = match index {
            None => AccessMethod::Sequential,
            Some(ci) => {
                let cand = &node_ref.indexes[*ci];

                let mut key_ranges = Vec::new();
                let mut range_terms = Bitset::new();
                for t in terms.iter().chain(
                    join_edge_ranges
                        .map(|b| b.iter().collect::<Vec<_>>())
                        .unwrap_or_default(),
                ) {
                    if range_terms.contains(t) {
                        continue;
                    }
                    range_terms.add(t);
                }
                for t in range_terms.iter() {
                    if !self.claim(t) {
                        continue;
                    }
                    let column = self.index_column_of_term(cand, t).unwrap_or(0);
                    if let Some(expr) = &self.graph.terms[t].expr {
                        key_ranges.push(KeyRange {
                            column,
                            pred: expr.clone(),
                        });
                    }
                }
                key_ranges.sort_by_key(|kr| kr.column);

                // key filters: the plan's choices, plus join edges a
                // covering or multi-range scan can evaluate in the index
                let mut kf_list: Vec<TermIdx> =
                    kf_terms.iter().filter(|&t| self.claim(t)).collect();
                if join_inner && (*index_cover || p.multi_range_opt == MultiRangeOpt::Use) {
                    for t in 0..self.graph.terms.len() {
                        let term = &self.graph.terms[t];
                        if term.class == TermClass::Join
                            && term.nodes.contains(n)
                            && term
                                .segments
                                .intersection(&node_ref.segs)
                                .is_subset_of(&cand.index_segs)
                            && self.claim(t)
                        {
                            kf_list.push(t);
                        }
                    }
                }
                let key_filter = self.conjunction(&kf_list);

                let mro = p.multi_range_opt == MultiRangeOpt::Use;
                AccessMethod::Index(IndexAccess {
                    index_id: cand.stats.id,
                    index_name: cand.stats.name.clone(),
                    key_ranges,
                    key_filter,
                    covering: *index_cover,
                    iss: *index_iss,
                    loose_prefix: if *index_loose {
                        Some(cand.ils_prefix_len.max(0) as usize)
                    } else {
                        None
                    },
                    multi_range_opt: mro,
                    descending: p.use_iscan_descending,
                    orderby_skip: *method == ScanMethod::IndexOrderByScan,
                    groupby_skip: *method == ScanMethod::IndexGroupByScan,
                    key_limit: cand.key_limit.filter(|_| mro).map(|u| KeyLimit {
                        lower: None,
                        upper: Some(Expr::Value(crate::common::Value::Integer(u as i64))),
                    }),
                })
            }
        };

        // whatever sargs the index did not consume become the data filter
        let residual: Vec<TermIdx> = node_ref.sargs.iter().filter(|&t| self.claim(t)).collect();
        let access_pred = self.conjunction(&residual);

        Ok(AccessSpec {
            node: n,
            class_id: node_ref.class_id,
            class_name: node_ref.alias.clone(),
            access,
            access_pred,
            out_segs: node_ref.segs.iter().collect(),
            outer_join_inner: false,
        })
    }

    fn index_column_of_term(
        &self,
        cand: &crate::optimizer::index::IndexCandidate,
        t: TermIdx,
    ) -> Option<usize> {
        for (pos, seg) in cand.seg_idxs.iter().enumerate() {
            let Some(seg) = seg else { continue };
            if self.graph.terms[t].segments.contains(*seg)
                || self.graph.terms[t]
                    .index_segs
                    .iter()
                    .flatten()
                    .any(|s| s == seg)
            {
                return Some(pos);
            }
        }
        None
    }

    fn scan_projection(&self, plan: PlanId) -> Vec<SegIdx> {
        match &self.arena.get(plan).kind {
            PlanKind::Scan { node, .. } => self.graph.nodes[*node].segs.iter().collect(),
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Sorts
    // ------------------------------------------------------------------

    fn gen_sort(&mut self, sort_type: SortType, subplan: PlanId, plan: PlanId) -> Result<XaslNode> {
        let input = self.gen(subplan)?;
        let projected = input.projected.clone();
        let order = self.arena.get(plan).order;

        let sort: Vec<SortSpec> = match sort_type {
            SortType::TempList => match order {
                Some(eq) => self
                    .eqclass_position(eq, &projected)
                    .map(|pos| vec![SortSpec { pos, asc: true }])
                    .unwrap_or_default(),
                None => Vec::new(),
            },
            SortType::OrderBy | SortType::Limit => {
                self.sort_specs_from_columns(&self.graph.query.order_by, &projected)
            }
            SortType::GroupBy => {
                self.sort_specs_from_columns(&self.graph.query.group_by, &projected)
            }
            SortType::Distinct => (0..projected.len())
                .map(|pos| SortSpec { pos, asc: true })
                .collect(),
        };

        let limit = if sort_type == SortType::Limit {
            self.graph.limit_value
        } else {
            None
        };

        let mut node = XaslNode::new(XaslKind::BuildList {
            input: Box::new(input),
            prefix_exprs: Vec::new(),
            sort,
            limit,
        });
        node.projected = projected;
        node.subqueries = self.arena.get(plan).subqueries.iter().collect();
        Ok(node)
    }

    fn sort_specs_from_columns(
        &self,
        columns: &[crate::ast::OrderSpec],
        projected: &[SegIdx],
    ) -> Vec<SortSpec> {
        columns
            .iter()
            .filter_map(|o| {
                let seg = self.graph.lookup_seg(o.column.spec, o.column.column)?;
                let pos = projected.iter().position(|&s| s == seg)?;
                Some(SortSpec { pos, asc: !o.desc })
            })
            .collect()
    }

    fn eqclass_position(&self, eq: usize, projected: &[SegIdx]) -> Option<usize> {
        let class = &self.graph.eqclasses[eq];
        projected
            .iter()
            .position(|s| class.segs.contains(*s))
    }

    // ------------------------------------------------------------------
    // Joins
    // ------------------------------------------------------------------

    fn gen_nl_join(&mut self, plan: PlanId) -> Result<XaslNode> {
        let p = self.arena.get(plan).clone();
        let PlanKind::Join {
            join_type,
            join_method,
            outer,
            inner,
            join_terms,
            during_join_terms,
            after_join_terms,
            ..
        } = &p.kind
        else {
            return Err(DbError::Internal("nl join from non-join plan".into()));
        };

        let outer_node = self.gen(*outer)?;
        let inner_plan = self.arena.get(*inner);

        // fake edges order the search; they never evaluate
        let real_edges: Bitset = join_terms
            .iter()
            .filter(|&t| !self.graph.terms[t].is_fake())
            .collect();

        let mut inner_spec = match (&inner_plan.kind, join_method) {
            (PlanKind::Scan { .. }, JoinMethod::IdxJoin) => {
                // edge terms drive the inner key range
                self.make_access_spec(*inner, Some(&real_edges), true)?
            }
            (PlanKind::Scan { .. }, _) => {
                let mut spec = self.make_access_spec(*inner, None, true)?;
                // a plain nested loop evaluates the edges as the inner's
                // data filter, where both rows are in scope
                let edges: Vec<TermIdx> =
                    real_edges.iter().filter(|&t| self.claim(t)).collect();
                let edge_pred = self.conjunction(&edges);
                spec.access_pred = self.and_opt(spec.access_pred.take(), edge_pred);
                spec
            }
            _ => {
                // materialized inner: scan its list per outer row
                let inner_node = self.gen(*inner)?;
                let edges: Vec<TermIdx> =
                    real_edges.iter().filter(|&t| self.claim(t)).collect();
                let edge_pred = self.conjunction(&edges);
                let inner_first_node = self.leftmost_node(*inner);
                AccessSpec {
                    node: inner_first_node.unwrap_or(0),
                    class_id: inner_first_node
                        .map(|n| self.graph.nodes[n].class_id)
                        .unwrap_or(0),
                    class_name: inner_first_node
                        .map(|n| self.graph.nodes[n].alias.clone())
                        .unwrap_or_default(),
                    out_segs: inner_node.projected.clone(),
                    access: AccessMethod::List(Box::new(inner_node)),
                    access_pred: edge_pred,
                    outer_join_inner: false,
                }
            }
        };
        if *join_type == JoinType::Left {
            inner_spec.outer_join_inner = true;
        }

        // splice the inner into the outer's pipeline when the outer is a
        // bare scan chain; anything predicated or materialized becomes a
        // list the pipeline reads
        let spliceable = matches!(outer_node.kind, XaslKind::ScanChain { .. })
            && outer_node.if_pred.is_none()
            && outer_node.after_join_pred.is_none()
            && outer_node.instnum_pred.is_none();
        let mut node = if spliceable {
            let XaslNode {
                kind: XaslKind::ScanChain { mut specs },
                subqueries,
                projected,
                ..
            } = outer_node
            else {
                return Err(DbError::Internal("scan chain shape changed".into()));
            };
            specs.push(inner_spec);
            let mut n = XaslNode::new(XaslKind::ScanChain { specs });
            n.subqueries = subqueries;
            n.projected = projected;
            n
        } else {
            let projected = outer_node.projected.clone();
            let outer_spec = AccessSpec {
                node: self.leftmost_node_of_tree(&outer_node).unwrap_or(0),
                class_id: 0,
                class_name: String::new(),
                out_segs: projected.clone(),
                access: AccessMethod::List(Box::new(outer_node)),
                access_pred: None,
                outer_join_inner: false,
            };
            let mut n = XaslNode::new(XaslKind::ScanChain {
                specs: vec![outer_spec, inner_spec],
            });
            n.projected = projected;
            n
        };

        // inner projection joins the pipeline's output
        if let PlanKind::Scan { node: inner_n, .. } = &inner_plan.kind {
            let mut projected = node.projected.clone();
            projected.extend(self.graph.nodes[*inner_n].segs.iter());
            node.projected = projected;
        }

        let during: Vec<TermIdx> = during_join_terms.iter().filter(|&t| self.claim(t)).collect();
        node.after_join_pred = self.conjunction(&during);

        // WHERE predicates over the null-extended side filter padded rows
        // after the join has emitted them
        let after: Vec<TermIdx> = after_join_terms.iter().filter(|&t| self.claim(t)).collect();
        let sarged: Vec<TermIdx> = p.sarged_terms.iter().filter(|&t| self.claim(t)).collect();
        let if_pred = self.and_opt(self.conjunction(&after), self.conjunction(&sarged));
        node.if_pred = self.and_opt(node.if_pred.take(), if_pred);

        let mut subqueries: Vec<usize> = node.subqueries.clone();
        subqueries.extend(p.subqueries.iter());
        subqueries.dedup();
        node.subqueries = subqueries;
        Ok(node)
    }

    fn gen_merge_join(&mut self, plan: PlanId) -> Result<XaslNode> {
        let p = self.arena.get(plan).clone();
        let PlanKind::Join {
            join_type,
            outer,
            inner,
            join_terms,
            other_outer_join_terms,
            during_join_terms,
            after_join_terms,
            ..
        } = &p.kind
        else {
            return Err(DbError::Internal("merge join from non-join plan".into()));
        };
        let eq = p.order;

        // both children arrive as sorted temp-list builds
        let mut outer_list = self.gen(*outer)?;
        let mut inner_list = self.gen(*inner)?;

        // the merge columns lead both lists; composite join expressions are
        // materialized as extra leading columns
        let merge_edges: Vec<TermIdx> = join_terms
            .iter()
            .filter(|&t| !self.graph.terms[t].is_fake())
            .filter(|&t| self.claim(t))
            .collect();

        let mut drop_prefix = 0usize;
        let (outer_pos, inner_pos) = match eq.and_then(|e| {
            let class = &self.graph.eqclasses[e];
            if class.segs.is_empty() {
                None
            } else {
                let op = self.eqclass_position(e, &outer_list.projected);
                let ip = self.eqclass_position(e, &inner_list.projected);
                op.zip(ip)
            }
        }) {
            Some(pair) => pair,
            None => {
                // composite keys: prepend the two sides as computed columns
                if let Some(&t) = merge_edges.first() {
                    if let Some(Expr::Cmp { left, right, .. }) = &self.graph.terms[t].expr {
                        self.prepend_expr(&mut outer_list, left.as_ref().clone());
                        self.prepend_expr(&mut inner_list, right.as_ref().clone());
                        drop_prefix = 1;
                    }
                }
                (0, 0)
            }
        };

        let unique = self.merge_side_unique(*inner, eq);
        let merge = MergeSpec {
            cols: vec![MergeColumn {
                outer_pos,
                inner_pos,
                unique,
            }],
            outer_sort: vec![SortSpec {
                pos: outer_pos,
                asc: true,
            }],
            inner_sort: vec![SortSpec {
                pos: inner_pos,
                asc: true,
            }],
            left_outer: *join_type == JoinType::Left,
        };

        let mut projected = outer_list.projected.clone();
        projected.extend(inner_list.projected.iter().copied());

        let merged = XaslNode::new(XaslKind::MergeList {
            outer: Box::new(outer_list),
            inner: Box::new(inner_list),
            merge,
        });

        // a final list scan pulls the merged columns, dropping the
        // join-expression prefix from projection
        let mut node = XaslNode::new(XaslKind::ListScan {
            input: Box::new(merged),
            drop_prefix,
        });
        node.projected = projected;

        let during: Vec<TermIdx> = during_join_terms.iter().filter(|&t| self.claim(t)).collect();
        let other_outer: Vec<TermIdx> = other_outer_join_terms
            .iter()
            .filter(|&t| self.claim(t))
            .collect();
        node.after_join_pred =
            self.and_opt(self.conjunction(&during), self.conjunction(&other_outer));

        let after: Vec<TermIdx> = after_join_terms.iter().filter(|&t| self.claim(t)).collect();
        let sarged: Vec<TermIdx> = p.sarged_terms.iter().filter(|&t| self.claim(t)).collect();
        node.if_pred = self.and_opt(self.conjunction(&after), self.conjunction(&sarged));
        node.subqueries = p.subqueries.iter().collect();
        Ok(node)
    }

    fn prepend_expr(&self, list: &mut XaslNode, expr: Expr) {
        if let XaslKind::BuildList {
            prefix_exprs, sort, ..
        } = &mut list.kind
        {
            prefix_exprs.insert(0, expr);
            for s in sort.iter_mut() {
                s.pos += 1;
            }
            sort.insert(0, SortSpec { pos: 0, asc: true });
        }
    }

    fn merge_side_unique(&self, inner: PlanId, eq: Option<usize>) -> bool {
        let Some(eq) = eq else { return false };
        let Some(n) = self.leftmost_node(inner) else {
            return false;
        };
        let Some(seg) = self.graph.eqclasses[eq].seg_on_node(self.graph, n) else {
            return false;
        };
        let column = self.graph.segments[seg].column;
        self.graph.nodes[n]
            .stats
            .indexes
            .iter()
            .any(|i| i.unique && i.columns == vec![column])
    }

    // ------------------------------------------------------------------
    // Follow, worst
    // ------------------------------------------------------------------

    fn gen_follow(&mut self, head: PlanId, path_term: TermIdx) -> Result<XaslNode> {
        let input = self.gen(head)?;
        let term = &self.graph.terms[path_term];
        self.used.add(path_term);
        let tail = term
            .tail
            .ok_or_else(|| DbError::Internal("path term without tail node".into()))?;
        let oid_seg = term
            .segments
            .first()
            .ok_or_else(|| DbError::Internal("path term without oid segment".into()))?;

        let sargs: Vec<TermIdx> = self.graph.nodes[tail]
            .sargs
            .iter()
            .filter(|&t| self.claim(t))
            .collect();
        let pred = self.conjunction(&sargs);

        let mut projected = input.projected.clone();
        projected.extend(self.graph.nodes[tail].segs.iter());

        let mut node = XaslNode::new(XaslKind::Fetch {
            input: Box::new(input),
            spec: FetchSpec {
                node: tail,
                class_id: self.graph.nodes[tail].class_id,
                oid_seg,
                pred,
            },
        });
        node.projected = projected;
        Ok(node)
    }

    fn gen_worst(&mut self) -> Result<XaslNode> {
        // cross-join of sequential scans in appearance order; every sarg
        // becomes a data filter so results stay correct, if slow
        let mut specs = Vec::new();
        for n in 0..self.graph.nodes.len() {
            let node_ref = &self.graph.nodes[n];
            let sargs: Vec<TermIdx> = node_ref.sargs.iter().filter(|&t| self.claim(t)).collect();
            specs.push(AccessSpec {
                node: n,
                class_id: node_ref.class_id,
                class_name: node_ref.alias.clone(),
                access: AccessMethod::Sequential,
                access_pred: self.conjunction(&sargs),
                out_segs: node_ref.segs.iter().collect(),
                outer_join_inner: false,
            });
        }
        let claimed: Vec<TermIdx> = (0..self.graph.terms.len())
            .filter(|&t| self.claim(t))
            .collect();
        let rest: Vec<TermIdx> = claimed
            .into_iter()
            .filter(|&t| self.graph.terms[t].class != TermClass::TotallyAfterJoin)
            .collect();
        let mut node = XaslNode::new(XaslKind::ScanChain { specs });
        node.if_pred = self.conjunction(&rest);
        node.projected = self.graph.final_segs.iter().collect();
        Ok(node)
    }

    // ------------------------------------------------------------------
    // Keylimit
    // ------------------------------------------------------------------

    /// Compile `(lower, upper)` keylimit registers from the ROWNUM-family
    /// predicates and attach them to the qualifying index scan. Only INNER
    /// joins and interesting-order scans carry keylimits.
    fn attach_key_limit(&self, plan: PlanId, root: &mut XaslNode) {
        if !self.plan_all_inner(plan) {
            return;
        }
        let mut uppers: Vec<Expr> = Vec::new();
        let mut lowers: Vec<Expr> = Vec::new();
        let mut sources: Vec<&Expr> = Vec::new();
        if let Some(p) = &root.instnum_pred {
            sources.push(p);
        }
        if let Some(p) = &self.graph.query.orderby_for {
            sources.push(p);
        }
        for source in sources {
            for conj in source.conjuncts() {
                let Expr::Cmp { op, left, right } = conj else { continue };
                let (op, bound) = match (left.as_ref(), right.as_ref()) {
                    (Expr::RowNum, b) | (Expr::OrderByNum, b) => (*op, b),
                    (b, Expr::RowNum) | (b, Expr::OrderByNum) => (op.mirror(), b),
                    _ => continue,
                };
                match op {
                    CompareOp::Le | CompareOp::Lt | CompareOp::Eq => uppers.push(bound.clone()),
                    CompareOp::Ge | CompareOp::Gt => lowers.push(bound.clone()),
                    CompareOp::Ne => {}
                }
            }
        }
        if uppers.is_empty() && lowers.is_empty() {
            return;
        }
        let upper = collapse(uppers, "LEAST");
        let lower = collapse(lowers, "GREATEST");

        // attach to the first interesting-order index spec
        attach_to_first_ordered_spec(root, KeyLimit { lower, upper });
    }

    fn plan_all_inner(&self, plan: PlanId) -> bool {
        let p = self.arena.get(plan);
        match &p.kind {
            PlanKind::Join {
                join_type,
                outer,
                inner,
                ..
            } => {
                matches!(join_type, JoinType::Inner)
                    && self.plan_all_inner(*outer)
                    && self.plan_all_inner(*inner)
            }
            PlanKind::Sort { subplan, .. } => self.plan_all_inner(*subplan),
            PlanKind::Follow { head, .. } => self.plan_all_inner(*head),
            _ => true,
        }
    }

    fn leftmost_node(&self, plan: PlanId) -> Option<NodeIdx> {
        match &self.arena.get(plan).kind {
            PlanKind::Scan { node, .. } => Some(*node),
            PlanKind::Sort { subplan, .. } => self.leftmost_node(*subplan),
            PlanKind::Join { outer, .. } => self.leftmost_node(*outer),
            PlanKind::Follow { head, .. } => self.leftmost_node(*head),
            PlanKind::Worst => None,
        }
    }

    fn leftmost_node_of_tree(&self, node: &XaslNode) -> Option<NodeIdx> {
        node.all_specs().first().map(|s| s.node)
    }

    // ------------------------------------------------------------------
    // Term plumbing
    // ------------------------------------------------------------------

    /// Claim a term for a slot; false when it was already slotted or is
    /// fake. Exactly-once slotting hangs on this.
    fn claim(&mut self, t: TermIdx) -> bool {
        if self.used.contains(t) {
            return false;
        }
        self.used.add(t);
        true
    }

    fn take_class(&mut self, class: TermClass) -> Vec<TermIdx> {
        (0..self.graph.terms.len())
            .filter(|&t| self.graph.terms[t].class == class)
            .filter(|&t| self.claim(t))
            .collect()
    }

    fn conjunction(&self, terms: &[TermIdx]) -> Option<Expr> {
        let mut exprs = terms
            .iter()
            .filter_map(|&t| self.graph.terms[t].expr.clone());
        let first = exprs.next()?;
        Some(exprs.fold(first, Expr::and))
    }

    fn and_opt(&self, a: Option<Expr>, b: Option<Expr>) -> Option<Expr> {
        match (a, b) {
            (Some(a), Some(b)) => Some(Expr::and(a, b)),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

fn collapse(mut bounds: Vec<Expr>, func: &str) -> Option<Expr> {
    match bounds.len() {
        0 => None,
        1 => bounds.pop(),
        _ => Some(Expr::Func {
            name: func.to_string(),
            args: bounds,
        }),
    }
}

fn attach_to_first_ordered_spec(node: &mut XaslNode, limit: KeyLimit) {
    fn visit(node: &mut XaslNode, limit: &KeyLimit) -> bool {
        match &mut node.kind {
            XaslKind::ScanChain { specs } => {
                for spec in specs {
                    match &mut spec.access {
                        AccessMethod::Index(ia)
                            if ia.orderby_skip || ia.multi_range_opt || ia.groupby_skip =>
                        {
                            ia.key_limit = Some(match ia.key_limit.take() {
                                None => limit.clone(),
                                Some(existing) => KeyLimit {
                                    lower: existing.lower.or_else(|| limit.lower.clone()),
                                    upper: match (existing.upper, limit.upper.clone()) {
                                        (Some(a), Some(b)) => Some(Expr::Func {
                                            name: "LEAST".to_string(),
                                            args: vec![a, b],
                                        }),
                                        (a, b) => a.or(b),
                                    },
                                },
                            });
                            return true;
                        }
                        AccessMethod::List(list) => {
                            if visit(list, limit) {
                                return true;
                            }
                        }
                        _ => {}
                    }
                }
                false
            }
            XaslKind::BuildList { input, .. }
            | XaslKind::ListScan { input, .. }
            | XaslKind::Fetch { input, .. } => visit(input, limit),
            XaslKind::MergeList { .. } => false,
        }
    }
    visit(node, &limit);
}

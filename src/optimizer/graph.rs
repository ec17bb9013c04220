//! # Query Graph Builder
//!
//! Translates the resolved query tree into the graph the planner searches:
//! nodes (table references), segments (attribute references), terms
//! (classified predicate conjuncts), equivalence classes, and partitions
//! (connected components of the join graph). All cross-references are dense
//! indices into the graph's own vectors; sets of them are bitsets.
//!
//! Construction order matters: nodes, then segments, then terms (which need
//! both), then equivalence classes (union-find over equi-join terms), then
//! dependency sets, then per-node index analysis, then partitions.

use crate::ast::{
    ColumnRef, CompareOp, Expr, FromSpec, JoinKind, NodeHint, SelectQuery, SubquerySummary,
};
use crate::catalog::{ClassStats, StatsSource};
use crate::common::{
    ColumnId, EqClassIdx, NodeIdx, PartitionIdx, SegIdx, SubqueryIdx, TermIdx,
};
use crate::error::DbError;
use crate::optimizer::bitset::Bitset;
use crate::optimizer::index::{self, IndexCandidate};
use crate::optimizer::selectivity;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Join graphs wider than this fall back to the worst plan; memo subscripts
/// are single machine words.
pub const MAX_JOIN_NODES: usize = 64;

// ============================================================================
// Entities
// ============================================================================

/// Join type carried by join terms and join plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JoinType {
    Cross,
    Inner,
    Left,
    Right,
}

impl JoinType {
    pub fn is_outer(self) -> bool {
        matches!(self, JoinType::Left | JoinType::Right)
    }
}

/// The classification of a term, which decides where it may legally be
/// evaluated in the final tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TermClass {
    /// An object-path dereference edge.
    Path,
    /// A join edge.
    Join,
    /// A single-node restriction, evaluable during the node's scan.
    Sarg,
    /// Evaluable only once all referenced nodes are joined.
    Other,
    /// Fabricated dependency edge for a correlated derived table.
    DepLink,
    /// Fabricated dependency edge that also acts as a join edge.
    DepJoin,
    /// ON-clause predicate on the preserved side of an outer join.
    DuringJoin,
    /// WHERE predicate over an outer join's null-extended side.
    AfterJoin,
    /// Predicate on `ROWNUM`/`ORDERBY_NUM`, evaluated after everything.
    TotallyAfterJoin,
    /// Fabricated edge keeping an outer-joined node connected when its ON
    /// clause supplies no usable join term.
    DummyJoin,
}

impl TermClass {
    /// Edges participate in join enumeration.
    pub fn is_edge(self) -> bool {
        matches!(
            self,
            TermClass::Path
                | TermClass::Join
                | TermClass::DepLink
                | TermClass::DepJoin
                | TermClass::DummyJoin
        )
    }

    /// Fake terms are never evaluated at runtime and never slotted.
    pub fn is_fake(self) -> bool {
        matches!(
            self,
            TermClass::DepLink | TermClass::DepJoin | TermClass::DummyJoin
        )
    }

    pub fn is_dep(self) -> bool {
        matches!(self, TermClass::DepLink | TermClass::DepJoin)
    }
}

/// A table reference in `FROM`.
#[derive(Debug, Clone)]
pub struct Node {
    pub idx: NodeIdx,
    /// Relative index within the owning partition, assigned with partitions.
    pub rel_idx: usize,
    pub class_id: crate::common::TableId,
    pub alias: String,
    pub stats: Arc<ClassStats>,
    /// Segments emanating from this node.
    pub segs: Bitset,
    /// Equivalence classes touching this node.
    pub eqclasses: Bitset,
    /// Sarg terms applying to this node; scan output satisfies all of them.
    pub sargs: Bitset,
    /// Product of sarg selectivities.
    pub selectivity: f64,
    /// Subqueries re-evaluated per row of this node.
    pub subqueries: Bitset,
    /// Correlated derived-table dependencies.
    pub dep_set: Bitset,
    /// Nodes that must be in a partial plan before this node joins it.
    pub outer_dep_set: Bitset,
    /// Nodes this right-outer node precedes.
    pub right_dep_set: Bitset,
    pub join_kind: JoinKind,
    pub hint: NodeHint,
    pub sargable: bool,
    pub sort_limit_candidate: bool,
    pub ncard: u64,
    pub tcard: u64,
    pub partition: Option<PartitionIdx>,
    /// Usable index candidates, filled by index analysis.
    pub indexes: Vec<IndexCandidate>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.alias
    }
}

/// An attribute reference of one node.
#[derive(Debug, Clone)]
pub struct Segment {
    pub idx: SegIdx,
    pub node: NodeIdx,
    pub column: ColumnId,
    pub name: String,
    pub eqclass: Option<EqClassIdx>,
    /// Terms referencing this segment.
    pub terms: Bitset,
    /// Indexable terms in which this segment can drive a key column.
    pub index_terms: Bitset,
    pub not_null: bool,
    /// Cached per-attribute distinct count.
    pub distinct: Option<u64>,
    /// For path segments, the node reached by dereferencing this attribute.
    pub tail: Option<NodeIdx>,
}

/// Flags refined from the term's expression shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermFlags {
    /// The operator is `=`.
    pub equal_op: bool,
    /// `RANGE (r1, r2, ...)` or `IN`-list predicate.
    pub rangelist: bool,
    /// Usable as a merge-join edge.
    pub mergeable_edge: bool,
    /// Top-level OR predicate.
    pub or_pred: bool,
}

/// One conjunct of `WHERE`/`ON`, after flattening, or a fabricated edge.
#[derive(Debug, Clone)]
pub struct Term {
    pub idx: TermIdx,
    /// The predicate expression; `None` only for fabricated edges.
    pub expr: Option<Expr>,
    pub class: TermClass,
    /// Nodes touched by the term.
    pub nodes: Bitset,
    /// Segments touched by the term.
    pub segments: Bitset,
    pub selectivity: f64,
    /// Tiebreaker among equal-selectivity terms; lower ranks first.
    pub rank: i32,
    pub join_type: JoinType,
    /// 0 for `WHERE`; `spec + 1` for the ON clause of that spec.
    pub location: usize,
    pub subqueries: Bitset,
    pub eqclass: Option<EqClassIdx>,
    pub head: Option<NodeIdx>,
    pub tail: Option<NodeIdx>,
    /// Number of sides (0..=2) that can drive an index key column.
    pub can_use_index: usize,
    pub index_segs: [Option<SegIdx>; 2],
    pub flags: TermFlags,
}

impl Term {
    pub fn is_edge(&self) -> bool {
        self.class.is_edge()
    }

    pub fn is_fake(&self) -> bool {
        self.class.is_fake()
    }

    /// True when the term may appear inside an access spec or key filter.
    pub fn is_sarg(&self) -> bool {
        matches!(self.class, TermClass::Sarg)
    }
}

/// A maximal set of segments related by equality joins. A class fabricated
/// for a composite merge term has an empty segment set and carries the term
/// instead; never both.
#[derive(Debug, Clone)]
pub struct EqClass {
    pub idx: EqClassIdx,
    pub segs: Bitset,
    pub term: Option<TermIdx>,
}

impl EqClass {
    /// The representative segment of this class on `node`, if any.
    pub fn seg_on_node(&self, graph: &QueryGraph, node: NodeIdx) -> Option<SegIdx> {
        self.segs.iter().find(|&s| graph.segments[s].node == node)
    }
}

/// A connected component of the join graph.
#[derive(Debug, Clone)]
pub struct Partition {
    pub idx: PartitionIdx,
    pub nodes: Bitset,
    pub edges: Bitset,
    /// Dependency terms crossing into this partition.
    pub dependencies: Bitset,
    /// Starting offset of this partition's slice of the join memo array.
    pub m_offset: usize,
}

/// A correlated subquery, pinned later to the deepest covering plan node.
#[derive(Debug, Clone)]
pub struct SubqueryRec {
    pub idx: SubqueryIdx,
    pub nodes: Bitset,
    pub terms: Bitset,
    pub summary: SubquerySummary,
}

/// Whether SORT-LIMIT plans may be generated for this query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortLimitUse {
    /// SORT-LIMIT plans cannot be created.
    Invalid,
    /// SORT-LIMIT plans should be created.
    Use,
    /// Conditions hold but the user supplied no usable limit.
    Possible,
}

// ============================================================================
// The graph
// ============================================================================

/// The owning container of one optimization's entities.
#[derive(Debug, Clone)]
pub struct QueryGraph {
    pub query: SelectQuery,
    pub nodes: Vec<Node>,
    pub segments: Vec<Segment>,
    pub terms: Vec<Term>,
    pub eqclasses: Vec<EqClass>,
    pub partitions: Vec<Partition>,
    pub subqueries: Vec<SubqueryRec>,
    /// Segments the top-level plan must project.
    pub final_segs: Bitset,
    /// All fabricated (never-evaluated) terms, for quick exclusion.
    pub fake_terms: Bitset,
    /// A constant-false conjunct was found; the query returns no rows.
    pub bail_out: bool,
    /// Nodes that must stay inside a SORT-LIMIT plan's node set.
    pub sort_limit_nodes: Bitset,
    pub use_sort_limit: SortLimitUse,
    /// Stopping cardinality from `LIMIT`/`ORDERBY_NUM`, when present.
    pub limit_value: Option<u64>,
    /// Number of edge terms.
    pub nedges: usize,
}

impl QueryGraph {
    /// Build the graph for `query`, reading statistics from `stats`.
    pub fn build(query: &SelectQuery, stats: &dyn StatsSource) -> Result<QueryGraph> {
        if query.specs.is_empty() {
            return Err(DbError::Optimizer("query has no FROM entries".into()));
        }
        if query.specs.len() > MAX_JOIN_NODES {
            return Err(DbError::NotImplemented(format!(
                "{} table references exceed the join enumeration width",
                query.specs.len()
            )));
        }

        let mut builder = GraphBuilder::new(query.clone());
        builder.build_nodes(stats)?;
        builder.build_segments();
        builder.build_terms()?;
        builder.build_dummy_joins();
        builder.build_dependency_terms();
        builder.build_outer_dep_sets();
        builder.assign_eqclasses();
        builder.attach_sargs();
        builder.build_subquery_records();
        let mut graph = builder.finish();
        graph.limit_value = graph.query.upper_bound();

        selectivity::assign_term_selectivities(&mut graph);
        index::analyze_node_indexes(&mut graph);
        graph.build_partitions();
        graph.detect_sort_limit();

        debug!(
            nodes = graph.nodes.len(),
            segments = graph.segments.len(),
            terms = graph.terms.len(),
            eqclasses = graph.eqclasses.len(),
            partitions = graph.partitions.len(),
            "query graph built"
        );
        Ok(graph)
    }

    pub fn node(&self, i: NodeIdx) -> &Node {
        &self.nodes[i]
    }

    pub fn term(&self, i: TermIdx) -> &Term {
        &self.terms[i]
    }

    pub fn segment(&self, i: SegIdx) -> &Segment {
        &self.segments[i]
    }

    /// Find the segment for `(node, column)`, if the query references it.
    pub fn lookup_seg(&self, node: NodeIdx, column: ColumnId) -> Option<SegIdx> {
        self.nodes[node]
            .segs
            .iter()
            .find(|&s| self.segments[s].column == column)
    }

    /// The set of nodes a column-ref expression touches.
    pub fn expr_nodes(&self, expr: &Expr) -> Bitset {
        let mut set = Bitset::new();
        expr.for_each_column(&mut |c: &ColumnRef| {
            set.add(c.spec);
        });
        set
    }

    /// The set of segments an expression touches.
    pub fn expr_segs(&self, expr: &Expr) -> Bitset {
        let mut set = Bitset::new();
        expr.for_each_column(&mut |c: &ColumnRef| {
            if let Some(s) = self.lookup_seg(c.spec, c.column) {
                set.add(s);
            }
        });
        set
    }

    /// All join edges connecting `placed` with `next`, with no node outside
    /// `placed ∪ {next}`.
    pub fn edges_between(&self, placed: &Bitset, next: NodeIdx) -> Vec<TermIdx> {
        let mut joined = placed.clone();
        joined.add(next);
        self.terms
            .iter()
            .filter(|t| {
                t.is_edge()
                    && t.nodes.contains(next)
                    && t.nodes.intersects(placed)
                    && t.nodes.is_subset_of(&joined)
            })
            .map(|t| t.idx)
            .collect()
    }

    fn build_partitions(&mut self) {
        // union-find over nodes, connected by edge terms
        let n = self.nodes.len();
        let mut parent: Vec<usize> = (0..n).collect();
        fn find(parent: &mut Vec<usize>, i: usize) -> usize {
            if parent[i] != i {
                let root = find(parent, parent[i]);
                parent[i] = root;
            }
            parent[i]
        }
        for t in &self.terms {
            if !t.is_edge() {
                continue;
            }
            let mut members = t.nodes.iter();
            if let Some(first) = members.next() {
                for m in members {
                    let (a, b) = (find(&mut parent, first), find(&mut parent, m));
                    if a != b {
                        parent[a] = b;
                    }
                }
            }
        }

        let mut roots: HashMap<usize, PartitionIdx> = HashMap::new();
        let mut partitions: Vec<Partition> = Vec::new();
        for i in 0..n {
            let root = find(&mut parent, i);
            let pidx = *roots.entry(root).or_insert_with(|| {
                partitions.push(Partition {
                    idx: partitions.len(),
                    nodes: Bitset::new(),
                    edges: Bitset::new(),
                    dependencies: Bitset::new(),
                    m_offset: 0,
                });
                partitions.len() - 1
            });
            partitions[pidx].nodes.add(i);
            self.nodes[i].partition = Some(pidx);
        }

        for t in &self.terms {
            if let Some(head) = t.nodes.first() {
                let pidx = self.nodes[head].partition.unwrap_or(0);
                if t.is_edge() {
                    partitions[pidx].edges.add(t.idx);
                } else if t.class.is_dep() {
                    partitions[pidx].dependencies.add(t.idx);
                }
            }
        }

        // relative node indices and memo offsets; a partition of k nodes
        // owns 2^k memo slots
        let mut offset = 0usize;
        for p in partitions.iter_mut() {
            for (rel, node) in p.nodes.iter().enumerate() {
                self.nodes[node].rel_idx = rel;
            }
            p.m_offset = offset;
            offset += 1usize << p.nodes.cardinality().min(MAX_JOIN_NODES);
        }

        self.nedges = partitions.iter().map(|p| p.edges.cardinality()).sum();
        self.partitions = partitions;
    }

    fn detect_sort_limit(&mut self) {
        if self.query.order_by.is_empty()
            || !self.query.group_by.is_empty()
            || self.query.has_aggregate
            || self.query.kind != crate::ast::QueryKind::Select
        {
            self.use_sort_limit = SortLimitUse::Invalid;
            return;
        }

        // every ORDER BY column must resolve to a segment; the nodes those
        // segments emanate from can never leave a SORT-LIMIT plan
        let mut nodes = Bitset::new();
        for spec in &self.query.order_by.clone() {
            match self.lookup_seg(spec.column.spec, spec.column.column) {
                Some(s) => nodes.add(self.segments[s].node),
                None => {
                    self.use_sort_limit = SortLimitUse::Invalid;
                    return;
                }
            }
        }
        self.sort_limit_nodes = nodes.clone();
        for n in nodes.iter() {
            self.nodes[n].sort_limit_candidate = true;
        }
        self.use_sort_limit = match self.limit_value {
            Some(n) if n > 0 && n <= selectivity::SORT_LIMIT_MAX_ROWS => SortLimitUse::Use,
            _ => SortLimitUse::Possible,
        };
        trace!(
            use_sort_limit = ?self.use_sort_limit,
            nodes = ?self.sort_limit_nodes,
            "sort-limit candidacy"
        );
    }
}

// ============================================================================
// Builder
// ============================================================================

struct GraphBuilder {
    query: SelectQuery,
    nodes: Vec<Node>,
    segments: Vec<Segment>,
    terms: Vec<Term>,
    eqclasses: Vec<EqClass>,
    subqueries: Vec<SubqueryRec>,
    seg_lookup: HashMap<(NodeIdx, ColumnId), SegIdx>,
    final_segs: Bitset,
    fake_terms: Bitset,
    bail_out: bool,
}

impl GraphBuilder {
    fn new(query: SelectQuery) -> Self {
        Self {
            query,
            nodes: Vec::new(),
            segments: Vec::new(),
            terms: Vec::new(),
            eqclasses: Vec::new(),
            subqueries: Vec::new(),
            seg_lookup: HashMap::new(),
            final_segs: Bitset::new(),
            fake_terms: Bitset::new(),
            bail_out: false,
        }
    }

    fn build_nodes(&mut self, stats: &dyn StatsSource) -> Result<()> {
        let specs: Vec<FromSpec> = self.query.specs.clone();
        for (idx, spec) in specs.iter().enumerate() {
            let class_stats = stats.class_stats(spec.class_id)?;
            self.nodes.push(Node {
                idx,
                rel_idx: 0,
                class_id: spec.class_id,
                alias: spec.alias.clone(),
                ncard: class_stats.ncard,
                tcard: class_stats.tcard,
                stats: class_stats,
                segs: Bitset::new(),
                eqclasses: Bitset::new(),
                sargs: Bitset::new(),
                selectivity: 1.0,
                subqueries: Bitset::new(),
                dep_set: spec.depends_on.iter().copied().collect(),
                outer_dep_set: Bitset::new(),
                right_dep_set: Bitset::new(),
                join_kind: spec.join_kind,
                hint: spec.hint,
                sargable: true,
                sort_limit_candidate: false,
                partition: None,
                indexes: Vec::new(),
            });
        }
        Ok(())
    }

    fn intern_seg(&mut self, node: NodeIdx, column: ColumnId, name: &str) -> SegIdx {
        if let Some(&s) = self.seg_lookup.get(&(node, column)) {
            return s;
        }
        let stats = &self.nodes[node].stats;
        let meta = stats.column(column);
        let idx = self.segments.len();
        self.segments.push(Segment {
            idx,
            node,
            column,
            name: name.to_string(),
            eqclass: None,
            terms: Bitset::new(),
            index_terms: Bitset::new(),
            not_null: meta.map(|m| m.not_null).unwrap_or(false),
            distinct: stats.column_distinct(column),
            tail: None,
        });
        self.seg_lookup.insert((node, column), idx);
        self.nodes[node].segs.add(idx);
        idx
    }

    fn intern_expr_segs(&mut self, expr: &Expr) -> Bitset {
        let mut refs: Vec<ColumnRef> = Vec::new();
        expr.for_each_column(&mut |c: &ColumnRef| refs.push(c.clone()));
        let mut set = Bitset::new();
        for c in refs {
            set.add(self.intern_seg(c.spec, c.column, &c.name));
        }
        set
    }

    fn build_segments(&mut self) {
        // projection first: these segments must survive to the top plan
        for expr in self.query.select_list.clone() {
            let segs = self.intern_expr_segs(&expr);
            self.final_segs.union_with(&segs);
        }
        for spec in self.query.order_by.clone() {
            let s = self.intern_seg(spec.column.spec, spec.column.column, &spec.column.name);
            self.final_segs.add(s);
        }
        for spec in self.query.group_by.clone() {
            let s = self.intern_seg(spec.column.spec, spec.column.column, &spec.column.name);
            self.final_segs.add(s);
        }
        // path steps give rise to tail-linked segments
        for (idx, spec) in self.query.specs.clone().iter().enumerate() {
            if let Some(path) = &spec.path_from {
                let s = self.intern_seg(path.spec, path.column, &path.name);
                self.segments[s].tail = Some(idx);
            }
        }
    }

    fn next_term_idx(&self) -> TermIdx {
        self.terms.len()
    }

    fn push_term(&mut self, mut term: Term) -> TermIdx {
        let idx = self.next_term_idx();
        term.idx = idx;
        if term.is_fake() {
            self.fake_terms.add(idx);
        }
        for s in term.segments.iter().collect::<Vec<_>>() {
            self.segments[s].terms.add(idx);
        }
        self.terms.push(term);
        idx
    }

    fn build_terms(&mut self) -> Result<()> {
        // path edges first, in spec order
        for (idx, spec) in self.query.specs.clone().iter().enumerate() {
            if let Some(path) = &spec.path_from {
                let seg = self.intern_seg(path.spec, path.column, &path.name);
                let mut nodes = Bitset::unit(path.spec);
                nodes.add(idx);
                self.push_term(Term {
                    idx: 0,
                    expr: None,
                    class: TermClass::Path,
                    nodes,
                    segments: Bitset::unit(seg),
                    selectivity: 1.0,
                    rank: 0,
                    join_type: JoinType::Inner,
                    location: 0,
                    subqueries: Bitset::new(),
                    eqclass: None,
                    head: Some(path.spec),
                    tail: Some(idx),
                    can_use_index: 0,
                    index_segs: [None, None],
                    flags: TermFlags::default(),
                });
            }
        }

        // WHERE conjuncts, location 0
        if let Some(where_clause) = self.query.where_clause.clone() {
            for conj in where_clause.conjuncts() {
                self.add_predicate_term(conj, 0)?;
            }
        }
        // ON conjuncts, location spec+1
        for (idx, spec) in self.query.specs.clone().iter().enumerate() {
            if let Some(on) = &spec.on_clause {
                for conj in on.conjuncts() {
                    self.add_predicate_term(conj, idx + 1)?;
                }
            }
        }
        Ok(())
    }

    /// Classify one conjunct and create its term.
    fn add_predicate_term(&mut self, expr: &Expr, location: usize) -> Result<TermIdx> {
        if expr.is_false_constant() {
            self.bail_out = true;
        }

        let segments = self.intern_expr_segs(expr);
        let mut nodes = Bitset::new();
        for s in segments.iter() {
            nodes.add(self.segments[s].node);
        }
        let mut subqueries = Bitset::new();
        expr.for_each_subquery(&mut |sq| {
            subqueries.add(sq);
        });
        // a subquery's correlated references count as touched nodes
        for sq in subqueries.iter() {
            if let Some(summary) = self.query.subqueries.get(sq) {
                for &spec in &summary.correlated_specs {
                    nodes.add(spec);
                }
            }
        }

        let mut flags = TermFlags::default();
        let mut can_use_index = 0usize;
        let mut index_segs: [Option<SegIdx>; 2] = [None, None];
        let mut head = None;
        let mut tail = None;
        let mut join_type = JoinType::Inner;
        // binary predicate whose sides each touch a single, distinct node
        let mut join_capable = false;

        match expr {
            Expr::Cmp { op, left, right } => {
                flags.equal_op = *op == CompareOp::Eq;
                let lsegs = self.intern_expr_segs(left);
                let rsegs = self.intern_expr_segs(right);
                let lnodes: Bitset = lsegs.iter().map(|s| self.segments[s].node).collect();
                let rnodes: Bitset = rsegs.iter().map(|s| self.segments[s].node).collect();
                join_capable = lnodes.cardinality() == 1
                    && rnodes.cardinality() == 1
                    && !lnodes.intersects(&rnodes);
                flags.mergeable_edge = flags.equal_op && join_capable;
                if join_capable {
                    head = lnodes.first();
                    tail = rnodes.first();
                }

                let lseg = self.single_column_seg(left);
                let rseg = self.single_column_seg(right);
                match (lseg, rseg) {
                    (Some(l), Some(r)) if self.segments[l].node != self.segments[r].node => {
                        can_use_index = 2;
                        index_segs = [Some(l), Some(r)];
                    }
                    (Some(l), None) if self.expr_is_node_free(right, self.segments[l].node) => {
                        can_use_index = 1;
                        index_segs = [Some(l), None];
                    }
                    (None, Some(r)) if self.expr_is_node_free(left, self.segments[r].node) => {
                        can_use_index = 1;
                        index_segs = [Some(r), None];
                    }
                    _ => {}
                }
            }
            Expr::Or(_, _) => flags.or_pred = true,
            Expr::InList { expr: e, .. } | Expr::RangeList { expr: e, .. } => {
                flags.rangelist = true;
                if let Some(s) = self.single_column_seg(e) {
                    can_use_index = 1;
                    index_segs = [Some(s), None];
                }
            }
            Expr::Between { expr: e, .. } | Expr::Like { expr: e, .. } => {
                if let Some(s) = self.single_column_seg(e) {
                    can_use_index = 1;
                    index_segs = [Some(s), None];
                }
            }
            Expr::IsNull(e) | Expr::IsNotNull(e) => {
                if let Some(s) = self.single_column_seg(e) {
                    can_use_index = 1;
                    index_segs = [Some(s), None];
                }
            }
            _ => {}
        }

        // outer-join context of the ON clause this conjunct lives in
        let on_spec_kind = if location > 0 {
            Some(self.query.specs[location - 1].join_kind)
        } else {
            None
        };

        let class = self.classify(expr, &nodes, location, on_spec_kind, join_capable);

        if class == TermClass::Join {
            if let Some(kind) = on_spec_kind {
                join_type = match kind {
                    JoinKind::LeftOuter => JoinType::Left,
                    JoinKind::RightOuter => JoinType::Right,
                    _ => JoinType::Inner,
                };
            }
            if head.is_none() {
                head = nodes.first();
                tail = nodes.iter().nth(1);
            }
        } else if class != TermClass::Path {
            head = None;
            tail = None;
        }
        // merge edges must be genuine inner equi-joins over two nodes
        if class != TermClass::Join || join_type != JoinType::Inner || nodes.cardinality() != 2 {
            flags.mergeable_edge = false;
        }

        let rank = if flags.equal_op {
            0
        } else if flags.rangelist {
            1
        } else {
            2
        };

        Ok(self.push_term(Term {
            idx: 0,
            expr: Some(expr.clone()),
            class,
            nodes,
            segments,
            selectivity: 1.0,
            rank,
            join_type,
            location,
            subqueries,
            eqclass: None,
            head,
            tail,
            can_use_index,
            index_segs,
            flags,
        }))
    }

    fn classify(
        &self,
        expr: &Expr,
        nodes: &Bitset,
        location: usize,
        on_spec_kind: Option<JoinKind>,
        join_capable: bool,
    ) -> TermClass {
        if expr.references_rownum() {
            return TermClass::TotallyAfterJoin;
        }
        let ncard = nodes.cardinality();
        if ncard == 0 {
            return TermClass::Other;
        }

        match on_spec_kind {
            // ON clause of an outer join
            Some(kind) if kind.is_outer() => {
                let on_spec = location - 1;
                if ncard == 1 && nodes.contains(on_spec) {
                    // restriction on the null-extended side: legal at its scan
                    TermClass::Sarg
                } else if !nodes.contains(on_spec) {
                    // only the preserved side: fires while joining
                    TermClass::DuringJoin
                } else if ncard == 2 && join_capable {
                    TermClass::Join
                } else {
                    TermClass::DuringJoin
                }
            }
            // ON of an inner join, or plain WHERE
            _ => {
                if location == 0 && self.where_term_over_outer_inner(nodes) {
                    // WHERE predicate over a null-extended node filters the
                    // padded rows after the join produced them
                    return TermClass::AfterJoin;
                }
                if ncard == 1 {
                    TermClass::Sarg
                } else if ncard == 2 && join_capable {
                    TermClass::Join
                } else {
                    TermClass::Other
                }
            }
        }
    }

    /// True when a WHERE conjunct touches a null-extended node and
    /// therefore may only run after the join. A left-outer spec
    /// null-extends itself; a right-outer spec null-extends everything
    /// textually before it.
    fn where_term_over_outer_inner(&self, nodes: &Bitset) -> bool {
        nodes.iter().any(|n| {
            self.query.specs[n].join_kind == JoinKind::LeftOuter
                || self
                    .query
                    .specs
                    .iter()
                    .enumerate()
                    .any(|(i, s)| s.join_kind == JoinKind::RightOuter && n < i)
        })
    }

    fn single_column_seg(&mut self, expr: &Expr) -> Option<SegIdx> {
        match expr {
            Expr::Column(c) => Some(self.intern_seg(c.spec, c.column, &c.name)),
            _ => None,
        }
    }

    /// True when `expr` references no columns of `node`.
    fn expr_is_node_free(&self, expr: &Expr, node: NodeIdx) -> bool {
        let mut free = true;
        expr.for_each_column(&mut |c: &ColumnRef| {
            if c.spec == node {
                free = false;
            }
        });
        free
    }

    /// Outer-joined specs whose ON clause produced no edge get a fabricated
    /// dummy join so enumeration keeps them adjacent to their left side.
    fn build_dummy_joins(&mut self) {
        for idx in 1..self.nodes.len() {
            let kind = self.query.specs[idx].join_kind;
            if !kind.is_outer() {
                continue;
            }
            let has_edge = self
                .terms
                .iter()
                .any(|t| t.is_edge() && t.nodes.contains(idx) && t.nodes.cardinality() > 1);
            if has_edge {
                continue;
            }
            let mut nodes = Bitset::unit(idx - 1);
            nodes.add(idx);
            let join_type = if kind == JoinKind::RightOuter {
                JoinType::Right
            } else {
                JoinType::Left
            };
            self.push_term(Term {
                idx: 0,
                expr: None,
                class: TermClass::DummyJoin,
                nodes,
                segments: Bitset::new(),
                selectivity: 1.0,
                rank: 0,
                join_type,
                location: idx + 1,
                subqueries: Bitset::new(),
                eqclass: None,
                head: Some(idx - 1),
                tail: Some(idx),
                can_use_index: 0,
                index_segs: [None, None],
                flags: TermFlags::default(),
            });
        }
    }

    /// Correlated derived tables get dependency edges so the planner never
    /// places them before their antecedents.
    fn build_dependency_terms(&mut self) {
        for idx in 0..self.nodes.len() {
            let deps = self.nodes[idx].dep_set.clone();
            if deps.is_empty() {
                continue;
            }
            let mut nodes = deps.clone();
            nodes.add(idx);
            let head = deps.first();
            self.push_term(Term {
                idx: 0,
                expr: None,
                class: TermClass::DepLink,
                nodes,
                segments: Bitset::new(),
                selectivity: 1.0,
                rank: 0,
                join_type: JoinType::Inner,
                location: 0,
                subqueries: Bitset::new(),
                eqclass: None,
                head,
                tail: Some(idx),
                can_use_index: 0,
                index_segs: [None, None],
                flags: TermFlags::default(),
            });
            let mut outer = self.nodes[idx].outer_dep_set.clone();
            outer.union_with(&deps);
            self.nodes[idx].outer_dep_set = outer;
        }
    }

    /// Dependency sets that freeze outer-join order: a left-outer node joins
    /// after everything textually before it; a right-outer node nulls the
    /// entries before it, so they all wait for it instead.
    fn build_outer_dep_sets(&mut self) {
        let n = self.nodes.len();
        for idx in 0..n {
            match self.query.specs[idx].join_kind {
                JoinKind::LeftOuter => {
                    for prev in 0..idx {
                        self.nodes[idx].outer_dep_set.add(prev);
                    }
                }
                JoinKind::RightOuter => {
                    for prev in 0..idx {
                        self.nodes[prev].outer_dep_set.add(idx);
                        self.nodes[idx].right_dep_set.add(prev);
                    }
                }
                _ => {}
            }
        }
        // transitive closure over the per-node sets
        let mut changed = true;
        while changed {
            changed = false;
            for idx in 0..n {
                let deps = self.nodes[idx].outer_dep_set.clone();
                let mut merged = deps.clone();
                for d in deps.iter() {
                    merged.union_with(&self.nodes[d].outer_dep_set);
                }
                if merged != self.nodes[idx].outer_dep_set {
                    self.nodes[idx].outer_dep_set = merged;
                    changed = true;
                }
            }
        }
    }

    /// Union-find over equi-join terms whose two sides are single segments;
    /// composite merge terms get a synthetic class of their own.
    fn assign_eqclasses(&mut self) {
        let mut seg_root: Vec<SegIdx> = (0..self.segments.len()).collect();
        fn find(root: &mut Vec<SegIdx>, s: SegIdx) -> SegIdx {
            if root[s] != s {
                let r = find(root, root[s]);
                root[s] = r;
            }
            root[s]
        }

        for t in &self.terms {
            if t.class == TermClass::Join && t.flags.equal_op && t.can_use_index == 2 {
                if let (Some(a), Some(b)) = (t.index_segs[0], t.index_segs[1]) {
                    let (ra, rb) = (find(&mut seg_root, a), find(&mut seg_root, b));
                    if ra != rb {
                        seg_root[ra] = rb;
                    }
                }
            }
        }

        let mut class_of_root: HashMap<SegIdx, EqClassIdx> = HashMap::new();
        let joinable: Bitset = self
            .terms
            .iter()
            .filter(|t| t.class == TermClass::Join && t.flags.equal_op && t.can_use_index == 2)
            .flat_map(|t| t.index_segs.iter().flatten().copied())
            .collect();
        for s in joinable.iter() {
            let root = find(&mut seg_root, s);
            let idx = *class_of_root.entry(root).or_insert_with(|| {
                self.eqclasses.push(EqClass {
                    idx: self.eqclasses.len(),
                    segs: Bitset::new(),
                    term: None,
                });
                self.eqclasses.len() - 1
            });
            self.eqclasses[idx].segs.add(s);
            self.segments[s].eqclass = Some(idx);
            let node = self.segments[s].node;
            self.nodes[node].eqclasses.add(idx);
        }

        // wire terms to their classes; complex merge terms get synthetic ones
        for i in 0..self.terms.len() {
            let t = &self.terms[i];
            if t.class != TermClass::Join || !t.flags.equal_op {
                continue;
            }
            if t.can_use_index == 2 {
                let eq = t.index_segs[0].and_then(|s| self.segments[s].eqclass);
                self.terms[i].eqclass = eq;
            } else if t.flags.mergeable_edge {
                self.eqclasses.push(EqClass {
                    idx: self.eqclasses.len(),
                    segs: Bitset::new(),
                    term: Some(i),
                });
                self.terms[i].eqclass = Some(self.eqclasses.len() - 1);
            }
        }

        // segments driving indexable terms remember them
        for t in &self.terms {
            if t.can_use_index > 0 {
                for s in t.index_segs.iter().flatten() {
                    self.segments[*s].index_terms.add(t.idx);
                }
            }
        }
    }

    fn attach_sargs(&mut self) {
        for i in 0..self.terms.len() {
            if self.terms[i].class == TermClass::Sarg {
                if let Some(node) = self.terms[i].nodes.first() {
                    self.nodes[node].sargs.add(i);
                }
            }
        }
    }

    fn build_subquery_records(&mut self) {
        for (idx, summary) in self.query.subqueries.clone().iter().enumerate() {
            let nodes: Bitset = summary.correlated_specs.iter().copied().collect();
            let terms: Bitset = self
                .terms
                .iter()
                .filter(|t| t.subqueries.contains(idx))
                .map(|t| t.idx)
                .collect();
            for n in nodes.iter() {
                self.nodes[n].subqueries.add(idx);
            }
            self.subqueries.push(SubqueryRec {
                idx,
                nodes,
                terms,
                summary: summary.clone(),
            });
        }
    }

    fn finish(self) -> QueryGraph {
        QueryGraph {
            query: self.query,
            nodes: self.nodes,
            segments: self.segments,
            terms: self.terms,
            eqclasses: self.eqclasses,
            partitions: Vec::new(),
            subqueries: self.subqueries,
            final_segs: self.final_segs,
            fake_terms: self.fake_terms,
            bail_out: self.bail_out,
            sort_limit_nodes: Bitset::new(),
            use_sort_limit: SortLimitUse::Invalid,
            limit_value: None,
            nedges: 0,
        }
    }
}

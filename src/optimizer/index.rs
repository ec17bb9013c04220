//! # Index Analysis
//!
//! Matches each node's terms against the indexes the catalog reports for
//! its class, producing one [`IndexCandidate`] per usable index. The
//! candidate carries everything the planner needs to build index-scan
//! variants: per-column equal/other term sets, covering and unique flags,
//! skip-scan and loose-scan candidacy, and order-by/group-by skip results.

use crate::ast::OrderSpec;
use crate::catalog::IndexStats;
use crate::common::{NodeIdx, SegIdx};
use crate::optimizer::bitset::Bitset;
use crate::optimizer::graph::{QueryGraph, TermClass};
use tracing::trace;

/// Row limit above which multi-range optimization is not worth a heap.
pub const MULTI_RANGE_OPT_LIMIT: u64 = 100;

/// One usable index on one node, annotated with term matches.
#[derive(Debug, Clone)]
pub struct IndexCandidate {
    /// B+tree statistics copied out of the class entry.
    pub stats: IndexStats,
    /// Per index column: the graph segment, when the query references it.
    pub seg_idxs: Vec<Option<SegIdx>>,
    /// Per index column: equality terms usable on that column.
    pub seg_equal_terms: Vec<Bitset>,
    /// Per index column: non-equality terms usable on that column.
    pub seg_other_terms: Vec<Bitset>,
    /// Union of all terms constrained by the index.
    pub terms: Bitset,
    /// Segments supplied by the index.
    pub index_segs: Bitset,
    /// Unique index with every key column bound by an equality.
    pub all_unique_columns_equi: bool,
    /// The index alone supplies every segment the node must produce.
    pub cover_segments: bool,
    /// First column unconstrained, a later column constrained.
    pub is_iss_candidate: bool,
    /// Loose-scan prefix length, or -1 when loose scan does not apply.
    pub ils_prefix_len: i32,
    /// The `ORDER BY` can be elided by scanning this index.
    pub orderby_skip: bool,
    /// The `GROUP BY` can be elided by scanning this index.
    pub groupby_skip: bool,
    /// The skip requires scanning the index in reverse.
    pub use_descending: bool,
    /// Index position of the range-list column, or -1.
    pub rangelist_seg_idx: i32,
    /// Index position where the sort columns begin for multi-range
    /// optimization, or -1.
    pub first_sort_column: i32,
    /// Row limit attached by keylimit extraction.
    pub key_limit: Option<u64>,
}

impl IndexCandidate {
    /// Number of leading columns bound by equality terms.
    pub fn equality_prefix_len(&self) -> usize {
        self.seg_equal_terms
            .iter()
            .take_while(|s| !s.is_empty())
            .count()
    }

    /// True when some term constrains the leading column.
    pub fn first_column_constrained(&self) -> bool {
        self.seg_equal_terms
            .first()
            .map(|s| !s.is_empty())
            .unwrap_or(false)
            || self
                .seg_other_terms
                .first()
                .map(|s| !s.is_empty())
                .unwrap_or(false)
    }
}

/// Analyze every node's indexes. Runs after terms and selectivities exist.
pub fn analyze_node_indexes(graph: &mut QueryGraph) {
    for n in 0..graph.nodes.len() {
        let candidates = analyze_one_node(graph, n);
        graph.nodes[n].indexes = candidates;
    }
}

fn analyze_one_node(graph: &QueryGraph, n: NodeIdx) -> Vec<IndexCandidate> {
    let node = &graph.nodes[n];
    let mut out = Vec::new();

    for stats in node.stats.indexes.clone() {
        let ncols = stats.columns.len();
        let seg_idxs: Vec<Option<SegIdx>> = stats
            .columns
            .iter()
            .map(|&c| graph.lookup_seg(n, c))
            .collect();

        let mut seg_equal_terms = vec![Bitset::new(); ncols];
        let mut seg_other_terms = vec![Bitset::new(); ncols];
        let mut terms = Bitset::new();
        let mut rangelist_seg_idx = -1i32;

        for (pos, seg) in seg_idxs.iter().enumerate() {
            let Some(seg) = *seg else { continue };
            for t in graph.segments[seg].index_terms.iter() {
                let term = &graph.terms[t];
                let usable = match term.class {
                    TermClass::Sarg => node.sargs.contains(t),
                    // join edges drive correlated index joins
                    TermClass::Join => term.index_segs.iter().flatten().any(|&s| s == seg),
                    _ => false,
                };
                if !usable {
                    continue;
                }
                if term.flags.equal_op {
                    seg_equal_terms[pos].add(t);
                } else {
                    if term.flags.rangelist && rangelist_seg_idx < 0 {
                        rangelist_seg_idx = pos as i32;
                    }
                    seg_other_terms[pos].add(t);
                }
                terms.add(t);
            }
        }

        let index_segs: Bitset = seg_idxs.iter().flatten().copied().collect();
        let cover_segments = !index_segs.is_empty() && node.segs.is_subset_of(&index_segs);

        let all_unique_columns_equi = stats.unique
            && (0..ncols).all(|i| seg_idxs[i].is_some() && !seg_equal_terms[i].is_empty());

        let first_constrained =
            !seg_equal_terms[0].is_empty() || !seg_other_terms[0].is_empty();
        let is_iss_candidate = !stats.filtered
            && ncols > 1
            && !first_constrained
            && seg_equal_terms[1..].iter().any(|s| !s.is_empty());

        let ils_prefix_len = loose_scan_prefix(graph, n, &stats, cover_segments, &terms);

        let (orderby_skip, ob_desc) =
            sort_prefix_match(graph, n, &stats, &graph.query.order_by, 0);
        let (groupby_skip, gb_desc) = if graph.query.with_rollup {
            (false, false)
        } else {
            sort_prefix_match(graph, n, &stats, &graph.query.group_by, 0)
        };
        let use_descending = (orderby_skip && ob_desc) || (groupby_skip && gb_desc);

        let mut cand = IndexCandidate {
            stats,
            seg_idxs,
            seg_equal_terms,
            seg_other_terms,
            terms,
            index_segs,
            all_unique_columns_equi,
            cover_segments,
            is_iss_candidate,
            ils_prefix_len,
            orderby_skip,
            groupby_skip,
            use_descending,
            rangelist_seg_idx,
            first_sort_column: -1,
            key_limit: None,
        };
        // loose scan and skip scan are mutually exclusive
        if cand.ils_prefix_len > 0 {
            cand.is_iss_candidate = false;
        }
        check_multi_range_opt(graph, n, &mut cand);

        trace!(
            node = n,
            index = %cand.stats.name,
            terms = cand.terms.cardinality(),
            covering = cand.cover_segments,
            iss = cand.is_iss_candidate,
            ils = cand.ils_prefix_len,
            orderby_skip = cand.orderby_skip,
            "index candidate"
        );
        out.push(cand);
    }
    out
}

/// A loose scan returns the distinct prefix tuples of a covering index.
/// It applies only with no key range and no key filter, and only when the
/// query asks for distinct prefixes (DISTINCT or a prefix GROUP BY).
fn loose_scan_prefix(
    graph: &QueryGraph,
    n: NodeIdx,
    stats: &IndexStats,
    covering: bool,
    terms: &Bitset,
) -> i32 {
    if !covering || !terms.is_empty() || stats.filtered {
        return -1;
    }
    let wanted: Vec<SegIdx> = if graph.query.distinct {
        graph
            .final_segs
            .intersection(&graph.nodes[n].segs)
            .iter()
            .collect()
    } else if !graph.query.group_by.is_empty() {
        graph
            .query
            .group_by
            .iter()
            .filter(|o| o.column.spec == n)
            .filter_map(|o| graph.lookup_seg(n, o.column.column))
            .collect()
    } else {
        return -1;
    };
    if wanted.is_empty() {
        return -1;
    }
    // every wanted segment must sit inside the leading prefix of the index
    let mut prefix = 0usize;
    for w in &wanted {
        let col = graph.segments[*w].column;
        match stats.columns.iter().position(|&c| c == col) {
            Some(pos) => prefix = prefix.max(pos + 1),
            None => return -1,
        }
    }
    if prefix == wanted.len() {
        prefix as i32
    } else {
        -1
    }
}

/// Do the given sort columns form a prefix of the index columns starting at
/// `start`, either all-forward or all-reversed? Returns (match, reversed).
pub fn sort_prefix_match(
    graph: &QueryGraph,
    n: NodeIdx,
    stats: &IndexStats,
    sort: &[OrderSpec],
    start: usize,
) -> (bool, bool) {
    if sort.is_empty() || sort.iter().any(|o| o.column.spec != n) {
        return (false, false);
    }
    if start + sort.len() > stats.columns.len() {
        return (false, false);
    }
    let mut forward = true;
    let mut reversed = true;
    for (i, spec) in sort.iter().enumerate() {
        let pos = start + i;
        if stats.columns[pos] != spec.column.column {
            return (false, false);
        }
        let col_asc = stats.col_asc.get(pos).copied().unwrap_or(true);
        let want_asc = !spec.desc;
        if col_asc == want_asc {
            reversed = false;
        } else {
            forward = false;
        }
    }
    if forward {
        (true, false)
    } else if reversed {
        // a reversed scan loses NULLs unless the leading attribute cannot
        // be NULL or a sarg already excludes NULLs
        let first_seg = graph.lookup_seg(n, stats.columns[start]);
        let null_safe = match first_seg {
            Some(s) => {
                graph.segments[s].not_null
                    || graph.nodes[n].sargs.iter().any(|t| {
                        matches!(
                            graph.terms[t].expr,
                            Some(crate::ast::Expr::IsNotNull(_))
                        ) && graph.terms[t].segments.contains(s)
                    })
            }
            None => false,
        };
        if !graph.query.hints.no_idx_desc && null_safe {
            (true, true)
        } else {
            (false, false)
        }
    } else {
        (false, false)
    }
}

/// Multi-range optimization: top-K rows across disjoint key ranges via a
/// heap. All preconditions of the executor's merged-range scan must hold.
fn check_multi_range_opt(graph: &QueryGraph, n: NodeIdx, cand: &mut IndexCandidate) {
    if graph.query.hints.no_multi_range_opt
        || graph.query.has_aggregate
        || cand.rangelist_seg_idx < 0
    {
        return;
    }
    let r = cand.rangelist_seg_idx as usize;
    // exactly one range-list column, every earlier column equality-bound
    if cand.seg_other_terms[r].cardinality() != 1 {
        return;
    }
    if (0..r).any(|i| cand.seg_equal_terms[i].is_empty()) {
        return;
    }
    if cand
        .seg_other_terms
        .iter()
        .enumerate()
        .any(|(i, s)| i != r && !s.is_empty())
    {
        return;
    }
    // a finite, specified upper bound
    let upper = match graph.limit_value {
        Some(u) if u > 0 && u <= MULTI_RANGE_OPT_LIMIT => u,
        _ => return,
    };
    // no data filter: every sarg of the node must be consumed by the index
    if !graph.nodes[n].sargs.is_subset_of(&cand.terms) {
        return;
    }
    // sort columns must continue the index from the range-list column
    let (matched, reversed) =
        sort_prefix_match(graph, n, &cand.stats, &graph.query.order_by, r);
    if !matched {
        return;
    }
    cand.first_sort_column = r as i32;
    cand.key_limit = Some(upper);
    cand.use_descending = reversed;
}

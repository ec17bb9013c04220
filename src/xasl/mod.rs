//! # Executor Tree (XASL)
//!
//! The tree handed to the executor. The optimizer's last act is to
//! translate the winning plan into this shape; after that the tree is the
//! caller's property and the optimizer keeps no pointers into it.
//!
//! Predicates arrive pre-split into their evaluation slots: key ranges
//! bound the B+tree walk, key filters run inside the index scan, access
//! predicates run after the row fetch, if-predicates after row assembly,
//! and after-join / instnum predicates after a join emits a row.

pub mod gen;

use crate::ast::Expr;
use crate::common::{IndexId, NodeIdx, SegIdx, SubqueryIdx, TableId};
use serde::{Deserialize, Serialize};

pub use gen::generate;

/// One sort key of a temp-list build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Output-column position in the list being sorted.
    pub pos: usize,
    pub asc: bool,
}

/// Keylimit registers attached to an index scan: scan at most `upper` and
/// skip below `lower`. Multiple upper bounds collapse with `LEAST`,
/// multiple lower bounds with `GREATEST`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyLimit {
    pub lower: Option<Expr>,
    pub upper: Option<Expr>,
}

/// One column's key-range contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Index-column position the term binds.
    pub column: usize,
    pub pred: Expr,
}

/// Index access details of an access spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexAccess {
    pub index_id: IndexId,
    pub index_name: String,
    pub key_ranges: Vec<KeyRange>,
    pub key_filter: Option<Expr>,
    pub covering: bool,
    pub iss: bool,
    /// Loose-scan prefix length, when loose scanning.
    pub loose_prefix: Option<usize>,
    pub multi_range_opt: bool,
    pub descending: bool,
    pub orderby_skip: bool,
    pub groupby_skip: bool,
    pub key_limit: Option<KeyLimit>,
}

/// How one access spec reads its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AccessMethod {
    Sequential,
    Index(IndexAccess),
    /// Scan a list file built by a subtree; the inner side of a nested
    /// loop over a materialized input.
    List(Box<XaslNode>),
}

/// One table (or list) access inside a scan chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessSpec {
    pub node: NodeIdx,
    pub class_id: TableId,
    pub class_name: String,
    pub access: AccessMethod,
    /// Data filter evaluated after the row is fetched.
    pub access_pred: Option<Expr>,
    /// Segments this spec must produce.
    pub out_segs: Vec<SegIdx>,
    /// The join null-extends this side; the executor emits a padded row
    /// when no match survives the access predicates.
    pub outer_join_inner: bool,
}

/// Merge-join column pairing: `(outer_position, inner_position, unique)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeColumn {
    pub outer_pos: usize,
    pub inner_pos: usize,
    pub unique: bool,
}

/// Merge-join wiring between two sorted lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSpec {
    pub cols: Vec<MergeColumn>,
    /// Both sides are always sorted ascending on the merge columns.
    pub outer_sort: Vec<SortSpec>,
    pub inner_sort: Vec<SortSpec>,
    pub left_outer: bool,
}

/// Object-path dereference executed per row of the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSpec {
    pub node: NodeIdx,
    pub class_id: TableId,
    /// The object-valued segment supplying the OID to fetch.
    pub oid_seg: SegIdx,
    /// Sargs gating the fetch.
    pub pred: Option<Expr>,
}

/// The operator payload of one tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum XaslKind {
    /// Pipelined nested-loop chain; outermost spec first. Each deeper spec
    /// restarts once per row of the specs before it.
    ScanChain { specs: Vec<AccessSpec> },
    /// Materialize a subtree into a (possibly sorted, possibly limited)
    /// list file.
    BuildList {
        input: Box<XaslNode>,
        /// Expressions prepended as leading columns, for composite merge
        /// keys.
        prefix_exprs: Vec<Expr>,
        sort: Vec<SortSpec>,
        /// Top-K bound for SORT-LIMIT builds.
        limit: Option<u64>,
    },
    /// Merge two sorted list files.
    MergeList {
        outer: Box<XaslNode>,
        inner: Box<XaslNode>,
        merge: MergeSpec,
    },
    /// Scan a list produced below, dropping `drop_prefix` leading columns
    /// from projection.
    ListScan {
        input: Box<XaslNode>,
        drop_prefix: usize,
    },
    /// Per-row object fetch (path step) over the input.
    Fetch {
        input: Box<XaslNode>,
        spec: FetchSpec,
    },
}

/// One node of the executor tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XaslNode {
    pub kind: XaslKind,
    /// Evaluated after row assembly, before projection.
    pub if_pred: Option<Expr>,
    /// Evaluated when a join emits a row; suppresses padded rows that fail.
    pub after_join_pred: Option<Expr>,
    /// `ROWNUM`-family predicate, evaluated last.
    pub instnum_pred: Option<Expr>,
    /// Correlated subqueries re-evaluated once per row of this node.
    pub subqueries: Vec<SubqueryIdx>,
    /// Output columns, as graph segments.
    pub projected: Vec<SegIdx>,
}

impl XaslNode {
    pub fn new(kind: XaslKind) -> XaslNode {
        XaslNode {
            kind,
            if_pred: None,
            after_join_pred: None,
            instnum_pred: None,
            subqueries: Vec::new(),
            projected: Vec::new(),
        }
    }

    /// Every access spec in the tree, depth-first.
    pub fn all_specs(&self) -> Vec<&AccessSpec> {
        let mut out = Vec::new();
        self.collect_specs(&mut out);
        out
    }

    fn collect_specs<'a>(&'a self, out: &mut Vec<&'a AccessSpec>) {
        match &self.kind {
            XaslKind::ScanChain { specs } => {
                for s in specs {
                    out.push(s);
                    if let AccessMethod::List(list) = &s.access {
                        list.collect_specs(out);
                    }
                }
            }
            XaslKind::BuildList { input, .. }
            | XaslKind::ListScan { input, .. }
            | XaslKind::Fetch { input, .. } => input.collect_specs(out),
            XaslKind::MergeList { outer, inner, .. } => {
                outer.collect_specs(out);
                inner.collect_specs(out);
            }
        }
    }

    /// Conjunction of every predicate slot in the tree, for auditing that
    /// no conjunct was dropped or duplicated.
    pub fn all_slotted_preds(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        self.collect_preds(&mut out);
        out
    }

    fn collect_preds<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        for p in [&self.if_pred, &self.after_join_pred, &self.instnum_pred]
            .into_iter()
            .flatten()
        {
            out.push(p);
        }
        for spec in self.direct_specs() {
            if let Some(p) = &spec.access_pred {
                out.push(p);
            }
            if let AccessMethod::Index(ia) = &spec.access {
                for kr in &ia.key_ranges {
                    out.push(&kr.pred);
                }
                if let Some(kf) = &ia.key_filter {
                    out.push(kf);
                }
            }
        }
        match &self.kind {
            XaslKind::ScanChain { specs } => {
                for s in specs {
                    if let AccessMethod::List(list) = &s.access {
                        list.collect_preds(out);
                    }
                }
            }
            XaslKind::BuildList { input, .. }
            | XaslKind::ListScan { input, .. } => input.collect_preds(out),
            XaslKind::Fetch { input, spec } => {
                if let Some(p) = &spec.pred {
                    out.push(p);
                }
                input.collect_preds(out);
            }
            XaslKind::MergeList { outer, inner, .. } => {
                outer.collect_preds(out);
                inner.collect_preds(out);
            }
        }
    }

    fn direct_specs(&self) -> &[AccessSpec] {
        match &self.kind {
            XaslKind::ScanChain { specs } => specs,
            _ => &[],
        }
    }
}

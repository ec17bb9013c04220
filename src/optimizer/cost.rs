//! # Cost Model
//!
//! Cost attribution for candidate plans. Costs split two ways: fixed
//! (paid once, e.g. building a temp file) versus variable (paid per scan
//! restart), and CPU versus I/O. Join operators recombine their children's
//! halves according to how often the inner side re-runs.
//!
//! Every tunable lives on a [`CostPolicy`] owned by the running
//! optimization, so tests can bend the model without touching process
//! state.

use crate::ast::SubquerySummary;
use crate::catalog::IndexStats;
use crate::Config;

/// CPU weight per object visited.
pub const CPU_WEIGHT: f64 = 0.0025;
/// Fixed charge for creating a temp file.
pub const TEMP_SETUP_COST: f64 = 5.0;
/// Discount on object-fetch I/O for partial ranges.
pub const FUDGE_FACTOR: f64 = 0.7;
/// Per-page charge for re-scanning a non-grouped inner.
pub const NONGROUPED_SCAN_COST: f64 = 0.1;
/// I/O discount applied to external-sort merge passes that mostly hit the
/// OS cache.
pub const SORT_IO_CACHE_DISCOUNT: f64 = 0.5;

/// Per-invocation cost tunables.
#[derive(Debug, Clone)]
pub struct CostPolicy {
    pub cpu_weight: f64,
    pub temp_setup_cost: f64,
    pub fudge_factor: f64,
    pub nongrouped_scan_cost: f64,
    pub buffer_pool_pages: f64,
    pub sort_buffer_pages: f64,
    pub page_size: f64,
    /// Bytes charged per projected segment when estimating list widths.
    pub seg_width: f64,
}

impl Default for CostPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CostPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cpu_weight: CPU_WEIGHT,
            temp_setup_cost: TEMP_SETUP_COST,
            fudge_factor: FUDGE_FACTOR,
            nongrouped_scan_cost: NONGROUPED_SCAN_COST,
            buffer_pool_pages: config.buffer_pool_pages as f64,
            sort_buffer_pages: config.sort_buffer_pages as f64,
            page_size: config.page_size as f64,
            seg_width: 16.0,
        }
    }

    /// Pages occupied by a list of `objects` rows of `nsegs` columns.
    pub fn list_pages(&self, objects: f64, nsegs: usize) -> f64 {
        let width = (nsegs as f64).max(1.0) * self.seg_width;
        ((objects.max(0.0) * width) / self.page_size).ceil().max(1.0)
    }
}

// ============================================================================
// Cost
// ============================================================================

/// Fixed/variable CPU and I/O cost of one plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cost {
    pub fixed_cpu: f64,
    pub fixed_io: f64,
    pub variable_cpu: f64,
    pub variable_io: f64,
}

impl Cost {
    pub const ZERO: Cost = Cost {
        fixed_cpu: 0.0,
        fixed_io: 0.0,
        variable_cpu: 0.0,
        variable_io: 0.0,
    };

    /// The worst-plan sentinel.
    pub fn worst() -> Cost {
        Cost {
            fixed_cpu: f64::INFINITY,
            fixed_io: f64::INFINITY,
            variable_cpu: f64::INFINITY,
            variable_io: f64::INFINITY,
        }
    }

    pub fn new(fixed_cpu: f64, fixed_io: f64, variable_cpu: f64, variable_io: f64) -> Cost {
        Cost {
            fixed_cpu,
            fixed_io,
            variable_cpu,
            variable_io,
        }
    }

    pub fn fixed(&self) -> f64 {
        self.fixed_cpu + self.fixed_io
    }

    pub fn variable(&self) -> f64 {
        self.variable_cpu + self.variable_io
    }

    pub fn total(&self) -> f64 {
        self.fixed() + self.variable()
    }

    pub fn is_worst(&self) -> bool {
        self.total().is_infinite()
    }
}

// ============================================================================
// Scan costs
// ============================================================================

/// Sequential scan: one pass over the heap.
pub fn seq_scan_cost(policy: &CostPolicy, ncard: u64, tcard: u64) -> Cost {
    Cost::new(
        0.0,
        0.0,
        ncard as f64 * policy.cpu_weight,
        tcard as f64,
    )
}

/// Inputs of one index-scan costing.
#[derive(Debug, Clone, Copy)]
pub struct IndexScanShape {
    /// Product of selectivities of the key-range terms.
    pub range_selectivity: f64,
    /// Number of leading index columns constrained by the key range.
    pub range_columns: usize,
    /// Index-skip scan re-seeks once per distinct first-column value.
    pub iss: bool,
    /// Unique index with every key column equality-bound.
    pub unique_equi: bool,
    /// Covering scans never touch the heap.
    pub covering: bool,
}

/// Index scan: B+tree traversal, leaf walk, then object fetches under a
/// piecewise buffer-pool model.
pub fn index_scan_cost(
    policy: &CostPolicy,
    stats: &IndexStats,
    ncard: u64,
    opages: u64,
    shape: &IndexScanShape,
) -> Cost {
    // a fully-bound unique key wins outright
    if shape.unique_equi {
        return Cost::ZERO;
    }

    let ncard_f = (ncard as f64).max(1.0);
    // floor-clamp the index selectivity at one key
    let floor = if shape.range_columns > 0 {
        1.0 / stats.pkey(shape.range_columns) as f64
    } else if stats.keys > 0 {
        1.0 / stats.keys as f64
    } else {
        1.0 / ncard_f
    };
    let sel = shape.range_selectivity.clamp(floor.min(1.0), 1.0);

    let objects = sel * ncard_f;
    let leaf_pages = (sel * stats.leafs as f64).ceil();
    let mut index_io = stats.height as f64 + leaf_pages;
    if shape.iss {
        index_io += stats.pkey(1) as f64 * (stats.height as f64 + 1.0);
    }

    let opages_f = opages as f64;
    let mut fetch_io = if shape.covering {
        0.0
    } else if sel < 0.3 {
        opages_f * sel
    } else if sel < 0.8 {
        opages_f * (0.8 * sel + 0.36)
    } else {
        opages_f
    };
    // when the index outgrows the buffer pool, re-fetches stop hitting cache
    if index_io > policy.buffer_pool_pages && opages_f > 0.0 {
        let cap = opages_f * (1.0 - (policy.buffer_pool_pages - index_io) / opages_f);
        fetch_io = fetch_io.min(cap.max(0.0));
    }
    if sel < 1.0 {
        fetch_io *= policy.fudge_factor;
    }

    Cost::new(0.0, 0.0, objects * policy.cpu_weight, index_io + fetch_io)
}

// ============================================================================
// Sort cost
// ============================================================================

/// Cost of building a (possibly sorted) temp list over `sub`.
///
/// Callers handle the inherit cases (already-sorted input, SORT-LIMIT)
/// before asking for a real sort.
pub fn sort_cost(policy: &CostPolicy, sub: &Cost, objects: f64, pages: f64) -> Cost {
    let fixed = sub.total() + policy.temp_setup_cost;
    let mut cpu = objects * policy.cpu_weight;
    let mut io = 0.0;
    if pages <= policy.sort_buffer_pages {
        if objects > 1.0 {
            cpu += policy.cpu_weight * objects * objects.log2();
        }
    } else {
        io += pages;
        let passes = (pages / 4.0).max(1.0).log(3.0).max(0.0);
        io += pages * passes * SORT_IO_CACHE_DISCOUNT;
    }
    Cost::new(fixed, 0.0, cpu, io)
}

// ============================================================================
// Join costs
// ============================================================================

/// Inputs of one nested-loop costing.
#[derive(Debug, Clone, Copy)]
pub struct NlJoinShape {
    /// The inner is a correlated index scan keyed by the join columns.
    pub correlated_index: bool,
    /// Heap pages of the inner node.
    pub inner_pages: f64,
    /// The join null-extends, forcing a full inner re-scan per outer row.
    pub outer_join: bool,
}

/// Nested-loop join cost: the inner's variable half is paid once per outer
/// row; fixed halves are paid once.
pub fn nl_join_cost(
    policy: &CostPolicy,
    outer: &Cost,
    outer_card: f64,
    inner: &Cost,
    shape: &NlJoinShape,
    pinned_subqueries: &[&SubquerySummary],
) -> Cost {
    let fixed_cpu = outer.fixed_cpu + inner.fixed_cpu;
    let fixed_io = outer.fixed_io + inner.fixed_io;

    let (inner_cpu, inner_io) = if shape.correlated_index {
        (
            outer_card * inner.variable_cpu,
            (outer.variable_io * inner.variable_io).min(2.0 * shape.inner_pages),
        )
    } else {
        let runs = outer_card.max(1.0);
        (runs * inner.variable_cpu, runs * inner.variable_io)
    };

    let mut variable_cpu = outer.variable_cpu + inner_cpu;
    let mut variable_io = outer.variable_io + inner_io;

    if shape.outer_join {
        variable_io += outer_card * shape.inner_pages * policy.nongrouped_scan_cost;
    }
    for sq in pinned_subqueries {
        variable_cpu += outer_card * (sq.fixed_cost + sq.access_cost);
    }

    Cost::new(fixed_cpu, fixed_io, variable_cpu, variable_io)
}

/// Merge join: both inputs once, plus a quadratic-ish merge CPU charge on
/// the group cross products.
pub fn merge_join_cost(
    policy: &CostPolicy,
    outer: &Cost,
    outer_card: f64,
    inner: &Cost,
    inner_card: f64,
) -> Cost {
    Cost::new(
        outer.fixed_cpu + inner.fixed_cpu,
        outer.fixed_io + inner.fixed_io,
        outer.variable_cpu
            + inner.variable_cpu
            + (outer_card / 2.0) * (inner_card / 2.0) * policy.cpu_weight,
        outer.variable_io + inner.variable_io,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IndexStats;

    fn policy() -> CostPolicy {
        CostPolicy::default()
    }

    fn index(keys: u64, leafs: u64) -> IndexStats {
        IndexStats {
            id: 1,
            name: "idx".into(),
            columns: vec![0, 1],
            col_asc: vec![true, true],
            unique: false,
            filtered: false,
            height: 3,
            leafs,
            pages: leafs + 4,
            keys,
            pkeys: vec![100, keys],
        }
    }

    #[test]
    fn test_seq_scan_cost_shape() {
        let c = seq_scan_cost(&policy(), 10_000, 250);
        assert_eq!(c.fixed(), 0.0);
        assert_eq!(c.variable_io, 250.0);
        assert!((c.variable_cpu - 25.0).abs() < 1e-9);
        assert!(c.fixed() <= c.total());
    }

    #[test]
    fn test_unique_equi_scan_is_free() {
        let shape = IndexScanShape {
            range_selectivity: 0.0001,
            range_columns: 2,
            iss: false,
            unique_equi: true,
            covering: false,
        };
        let c = index_scan_cost(&policy(), &index(10_000, 64), 10_000, 250, &shape);
        assert_eq!(c.total(), 0.0);
    }

    #[test]
    fn test_selective_index_beats_seq_scan() {
        let shape = IndexScanShape {
            range_selectivity: 0.001,
            range_columns: 1,
            iss: false,
            unique_equi: false,
            covering: false,
        };
        let iscan = index_scan_cost(&policy(), &index(10_000, 64), 10_000, 250, &shape);
        let seq = seq_scan_cost(&policy(), 10_000, 250);
        assert!(iscan.total() < seq.total());
    }

    #[test]
    fn test_iss_pays_per_first_column_reseek() {
        let stats = index(10_000, 64);
        let base = IndexScanShape {
            range_selectivity: 0.01,
            range_columns: 1,
            iss: false,
            unique_equi: false,
            covering: false,
        };
        let with_iss = IndexScanShape { iss: true, ..base };
        let plain = index_scan_cost(&policy(), &stats, 10_000, 250, &base);
        let iss = index_scan_cost(&policy(), &stats, 10_000, 250, &with_iss);
        // pkeys[0] = 100 distinct first-column values, (height + 1) each
        assert!((iss.variable_io - plain.variable_io - 100.0 * 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_sort_cost_in_memory_vs_spill() {
        let sub = Cost::ZERO;
        let p = policy();
        let small = sort_cost(&p, &sub, 1_000.0, 4.0);
        assert_eq!(small.variable_io, 0.0);
        assert!(small.fixed() >= p.temp_setup_cost);

        let big = sort_cost(&p, &sub, 1_000_000.0, 4_000.0);
        assert!(big.variable_io >= 4_000.0);
    }

    #[test]
    fn test_nl_join_multiplies_inner_variable() {
        let p = policy();
        let outer = Cost::new(0.0, 0.0, 2.5, 50.0);
        let inner = Cost::new(0.0, 0.0, 1.0, 10.0);
        let shape = NlJoinShape {
            correlated_index: false,
            inner_pages: 10.0,
            outer_join: false,
        };
        let c = nl_join_cost(&p, &outer, 100.0, &inner, &shape, &[]);
        assert!((c.variable_cpu - (2.5 + 100.0)).abs() < 1e-9);
        assert!((c.variable_io - (50.0 + 1000.0)).abs() < 1e-9);
    }

    #[test]
    fn test_correlated_index_join_caps_inner_io() {
        let p = policy();
        let outer = Cost::new(0.0, 0.0, 2.5, 50.0);
        let inner = Cost::new(0.0, 0.0, 0.01, 4.0);
        let shape = NlJoinShape {
            correlated_index: true,
            inner_pages: 10.0,
            outer_join: false,
        };
        let c = nl_join_cost(&p, &outer, 1_000.0, &inner, &shape, &[]);
        // min(50 * 4, 2 * 10) = 20
        assert!((c.variable_io - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_join_cost_symmetric_io() {
        let p = policy();
        let a = Cost::new(5.0, 5.0, 1.0, 10.0);
        let b = Cost::new(5.0, 5.0, 2.0, 20.0);
        let c = merge_join_cost(&p, &a, 100.0, &b, 200.0);
        assert_eq!(c.variable_io, 30.0);
        assert!((c.variable_cpu - (3.0 + 50.0 * 100.0 * p.cpu_weight)).abs() < 1e-9);
    }

    #[test]
    fn test_worst_cost_sentinel() {
        assert!(Cost::worst().is_worst());
        assert!(!Cost::ZERO.is_worst());
    }
}

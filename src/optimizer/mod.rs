//! # Cost-Based Query Optimizer
//!
//! The optimizer core: turns a resolved query tree into an annotated
//! physical plan and the executor tree for it.
//!
//! The pipeline has four stages, leaves first:
//!
//! 1. **Query graph** ([`graph`]): nodes, segments, classified terms,
//!    equivalence classes, partitions. Reads catalog statistics.
//! 2. **Selectivity & cost** ([`selectivity`], [`cost`]): pure scoring
//!    functions over the graph, tunables on a per-invocation policy.
//! 3. **Planner** ([`planner`]): dynamic-programming search over node
//!    subsets, memoized by subset and interesting order.
//! 4. **XASL generation** ([`crate::xasl`]): the winning plan becomes the
//!    executor tree, predicates split into their evaluation slots.
//!
//! One optimization is single-threaded and deterministic for a given graph
//! and statistics snapshot. Statistics may be stale; that skews costs, not
//! correctness.

use crate::ast::SelectQuery;
use crate::catalog::StatsSource;
use crate::error::DbError;
use crate::Config;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// Submodules
pub mod bitset;
pub mod cost;
pub mod dump;
pub mod graph;
pub mod index;
pub mod plan;
pub mod planner;
pub mod selectivity;

// Re-exports
pub use cost::{Cost, CostPolicy};
pub use dump::{JsonFormatter, PlanFormatter, TextFormatter};
pub use graph::QueryGraph;
pub use plan::{Plan, PlanArena, PlanId};

// ============================================================================
// Optimization level
// ============================================================================

/// The level parameter packs the optimization switch and the dump flags.
pub const OPT_LEVEL_DEFAULT: u32 = 1;
/// Dump a one-line summary of the chosen plan.
pub const OPT_LEVEL_SIMPLE_DUMP: u32 = 0x100;
/// Dump the full plan tree.
pub const OPT_LEVEL_DETAILED_DUMP: u32 = 0x200;

pub fn optimization_enabled(level: u32) -> bool {
    (level & 0xff) != 0
}

pub fn plan_dump_enabled(level: u32) -> bool {
    level >= 0x100
}

pub fn simple_dump(level: u32) -> bool {
    level & OPT_LEVEL_SIMPLE_DUMP != 0
}

pub fn detailed_dump(level: u32) -> bool {
    level & OPT_LEVEL_DETAILED_DUMP != 0
}

/// Plan-dump output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    Text,
    Json,
}

/// Optimizer configuration, one per engine instance.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Optimization level; 0 disables cost-based search entirely.
    pub level: u32,
    /// When false, merge-join candidates are never generated.
    pub merge_join_enabled: bool,
    /// Whether per-query timers run during search.
    pub collect_exec_stats: bool,
    /// Emit the plan dump in this format after optimization.
    pub trace_format: Option<TraceFormat>,
    /// Engine sizing the cost model reads.
    pub engine: Config,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            level: OPT_LEVEL_DEFAULT,
            merge_join_enabled: true,
            collect_exec_stats: false,
            trace_format: None,
            engine: Config::default(),
        }
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// A finished optimization: every piece a caller may want to inspect.
pub struct Optimization {
    pub graph: QueryGraph,
    pub arena: PlanArena,
    pub plan: PlanId,
    pub xasl: crate::xasl::XaslNode,
}

impl Optimization {
    /// Human-readable plan dump.
    pub fn dump_text(&self) -> String {
        let mut f = TextFormatter::new();
        dump::walk_plan(&self.graph, &self.arena, self.plan, &mut f);
        format!("Query: {}\n{}", self.graph.query.text, f.finish())
    }

    /// Structured plan dump.
    pub fn dump_json(&self) -> serde_json::Value {
        let mut f = JsonFormatter::new();
        dump::walk_plan(&self.graph, &self.arena, self.plan, &mut f);
        f.finish(&self.graph.query.text)
    }
}

/// What an optimization attempt produced.
pub enum OptimizeOutcome {
    /// Normal result.
    Ok(Box<Optimization>),
    /// The input was too large or unusual for cost-based search; the
    /// caller falls back to its unoptimized nested-loop product of
    /// sequential scans.
    WorstPlan,
    /// Allocation, catalog, or precondition failure. The query tree is
    /// untouched and the caller may retry or surface the error.
    Fail(DbError),
}

impl OptimizeOutcome {
    pub fn ok(self) -> Option<Box<Optimization>> {
        match self {
            OptimizeOutcome::Ok(o) => Some(o),
            _ => None,
        }
    }
}

/// Counters kept across one optimizer instance.
#[derive(Debug, Clone, Default)]
pub struct OptimizerStatistics {
    pub queries_optimized: u64,
    pub worst_plans: u64,
    pub failures: u64,
    pub plans_allocated: u64,
    pub total_optimization_time: Duration,
}

// ============================================================================
// Entry point
// ============================================================================

/// The optimizer instance an engine embeds: statistics source plus
/// configuration, shareable across sessions.
pub struct QueryOptimizer {
    stats_source: Arc<dyn StatsSource>,
    config: OptimizerConfig,
    stats: RwLock<OptimizerStatistics>,
}

impl QueryOptimizer {
    pub fn new(stats_source: Arc<dyn StatsSource>, config: OptimizerConfig) -> Self {
        Self {
            stats_source,
            config,
            stats: RwLock::new(OptimizerStatistics::default()),
        }
    }

    /// Optimize one resolved query.
    pub fn optimize(&self, query: &SelectQuery) -> OptimizeOutcome {
        let started = self.config.collect_exec_stats.then(Instant::now);

        if !optimization_enabled(self.config.level) {
            self.bump(|s| s.worst_plans += 1);
            return OptimizeOutcome::WorstPlan;
        }

        let graph = match QueryGraph::build(query, self.stats_source.as_ref()) {
            Ok(g) => g,
            Err(DbError::NotImplemented(msg)) => {
                warn!(%msg, "unsupported construct, returning worst plan");
                self.bump(|s| s.worst_plans += 1);
                return OptimizeOutcome::WorstPlan;
            }
            Err(e) => {
                self.bump(|s| s.failures += 1);
                return OptimizeOutcome::Fail(e);
            }
        };

        if graph.bail_out {
            // a constant-false conjunct: nothing to optimize
            debug!("false conjunct detected, returning worst plan");
            self.bump(|s| s.worst_plans += 1);
            return OptimizeOutcome::WorstPlan;
        }

        let policy = CostPolicy::from_config(&self.config.engine);
        let result =
            planner::search_with_options(&graph, &policy, self.config.merge_join_enabled);

        let xasl = match crate::xasl::generate(&graph, &result.arena, result.plan) {
            Ok(x) => x,
            Err(e) => {
                self.bump(|s| s.failures += 1);
                return OptimizeOutcome::Fail(e);
            }
        };

        let optimization = Optimization {
            graph,
            arena: result.arena,
            plan: result.plan,
            xasl,
        };

        if plan_dump_enabled(self.config.level) {
            match self.config.trace_format.unwrap_or(TraceFormat::Text) {
                TraceFormat::Text => debug!(plan = %optimization.dump_text(), "chosen plan"),
                TraceFormat::Json => {
                    debug!(plan = %optimization.dump_json(), "chosen plan")
                }
            }
        }

        self.bump(|s| {
            s.queries_optimized += 1;
            s.plans_allocated += optimization.arena.allocated() as u64;
            if let Some(t) = started {
                s.total_optimization_time += t.elapsed();
            }
        });
        OptimizeOutcome::Ok(Box::new(optimization))
    }

    pub fn statistics(&self) -> OptimizerStatistics {
        self.stats.read().unwrap().clone()
    }

    fn bump<F: FnOnce(&mut OptimizerStatistics)>(&self, f: F) {
        f(&mut self.stats.write().unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ColumnRef, CompareOp, Expr, FromSpec, SelectQuery};
    use crate::catalog::MemoryCatalog;
    use crate::common::Value;
    use crate::optimizer::graph::tests::catalog;

    fn optimizer() -> QueryOptimizer {
        QueryOptimizer::new(Arc::new(catalog()), OptimizerConfig::default())
    }

    fn pk_query() -> SelectQuery {
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
        q
    }

    #[test]
    fn test_end_to_end_ok() {
        let opt = optimizer();
        let outcome = opt.optimize(&pk_query());
        let o = outcome.ok().expect("expected a plan");
        assert_eq!(o.arena.get(o.plan).cost.total(), 0.0);
        assert!(!o.xasl.all_specs().is_empty());
        assert_eq!(opt.statistics().queries_optimized, 1);
    }

    #[test]
    fn test_disabled_level_returns_worst() {
        let config = OptimizerConfig {
            level: 0,
            ..OptimizerConfig::default()
        };
        let opt = QueryOptimizer::new(Arc::new(catalog()), config);
        assert!(matches!(opt.optimize(&pk_query()), OptimizeOutcome::WorstPlan));
        assert_eq!(opt.statistics().worst_plans, 1);
    }

    #[test]
    fn test_missing_class_fails_cleanly() {
        let opt = QueryOptimizer::new(Arc::new(MemoryCatalog::new()), OptimizerConfig::default());
        match opt.optimize(&pk_query()) {
            OptimizeOutcome::Fail(DbError::Catalog(_)) => {}
            _ => panic!("expected catalog failure"),
        }
        assert_eq!(opt.statistics().failures, 1);
    }

    #[test]
    fn test_false_conjunct_short_circuits() {
        let mut q = pk_query();
        q.where_clause = Some(Expr::Value(Value::Boolean(false)));
        let opt = optimizer();
        assert!(matches!(opt.optimize(&q), OptimizeOutcome::WorstPlan));
    }

    #[test]
    fn test_level_bit_helpers() {
        assert!(optimization_enabled(1));
        assert!(!optimization_enabled(0x100));
        assert!(plan_dump_enabled(0x101));
        assert!(simple_dump(0x101));
        assert!(detailed_dump(0x201));
        assert!(!detailed_dump(0x101));
    }
}

//! # Plan and Result Caches
//!
//! Process-wide caches around the optimizer. The plan cache maps a SHA-1
//! fingerprint of the normalized query text to a finished executor tree
//! plus the classes it touches; entries are refcounted so an executor can
//! keep one alive across an invalidation. The result cache keys persisted
//! result lists by `(fingerprint, parameter tuple)`. A per-transaction
//! modified-class set drives invalidation of both at transaction cleanup.

use crate::common::{TableId, TransactionId, Value};
use crate::xasl::XaslNode;
use dashmap::DashMap;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Fingerprint
// ============================================================================

/// SHA-1 over the normalized query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryFingerprint(pub [u8; 20]);

impl QueryFingerprint {
    /// Normalize (case-fold, collapse whitespace) and hash.
    pub fn of_query_text(text: &str) -> QueryFingerprint {
        let normalized = text
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let digest = Sha1::digest(normalized.as_bytes());
        QueryFingerprint(digest.into())
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ============================================================================
// Plan cache
// ============================================================================

/// One cached compilation. Stays alive while any executor holds a fix on
/// it, even after the cache drops it.
pub struct CacheEntry {
    pub fingerprint: QueryFingerprint,
    pub xasl: XaslNode,
    /// Plan dump captured at compile time, for EXPLAIN of cached queries.
    pub plan_text: String,
    /// Classes the plan reads; intersection with a modified set kills it.
    pub classes: HashSet<TableId>,
    fix_count: AtomicU32,
}

impl CacheEntry {
    pub fn fix_count(&self) -> u32 {
        self.fix_count.load(Ordering::Acquire)
    }
}

/// A fixed (in-use) cache entry; unfixes on drop.
pub struct FixedEntry {
    entry: Arc<CacheEntry>,
}

impl FixedEntry {
    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }
}

impl Drop for FixedEntry {
    fn drop(&mut self) {
        self.entry.fix_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fingerprint-keyed cache of compiled plans.
pub struct PlanCache {
    entries: RwLock<HashMap<QueryFingerprint, Arc<CacheEntry>>>,
    max_entries: usize,
}

impl PlanCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    /// Look up and fix in one step, so invalidation cannot race the fix.
    pub fn probe(&self, fingerprint: &QueryFingerprint) -> Option<FixedEntry> {
        let entries = self.entries.read();
        let entry = entries.get(fingerprint)?.clone();
        entry.fix_count.fetch_add(1, Ordering::AcqRel);
        Some(FixedEntry { entry })
    }

    /// Insert a fresh compilation; returns it fixed. A racing insert of
    /// the same fingerprint keeps the first entry.
    pub fn insert(
        &self,
        fingerprint: QueryFingerprint,
        xasl: XaslNode,
        plan_text: String,
        classes: HashSet<TableId>,
    ) -> FixedEntry {
        let mut entries = self.entries.write();
        if entries.len() >= self.max_entries && !entries.contains_key(&fingerprint) {
            // drop an arbitrary unfixed victim
            if let Some(victim) = entries
                .iter()
                .find(|(_, e)| e.fix_count() == 0)
                .map(|(k, _)| *k)
            {
                entries.remove(&victim);
            }
        }
        let entry = entries
            .entry(fingerprint)
            .or_insert_with(|| {
                Arc::new(CacheEntry {
                    fingerprint,
                    xasl,
                    plan_text,
                    classes,
                    fix_count: AtomicU32::new(0),
                })
            })
            .clone();
        entry.fix_count.fetch_add(1, Ordering::AcqRel);
        FixedEntry { entry }
    }

    /// Drop every entry whose class set intersects `modified`. Entries in
    /// use stay alive through their fixes but leave the table.
    pub fn invalidate_classes(&self, modified: &HashSet<TableId>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.classes.is_disjoint(modified));
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!(dropped, "plan cache entries invalidated");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

// ============================================================================
// Result cache
// ============================================================================

/// Canonical key for a parameter tuple.
fn param_key(params: &[Value]) -> String {
    let mut key = String::new();
    for p in params {
        key.push_str(&p.to_string());
        key.push('\u{1f}');
    }
    key
}

/// A persisted query result.
pub type ResultList = Arc<Vec<Vec<Value>>>;

struct ResultEntry {
    rows: ResultList,
    classes: HashSet<TableId>,
}

/// `(plan, parameter tuple)`-keyed cache of materialized results.
#[derive(Default)]
pub struct ResultCache {
    entries: DashMap<(QueryFingerprint, String), ResultEntry>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &QueryFingerprint, params: &[Value]) -> Option<ResultList> {
        self.entries
            .get(&(*fingerprint, param_key(params)))
            .map(|e| e.rows.clone())
    }

    pub fn put(
        &self,
        fingerprint: QueryFingerprint,
        params: &[Value],
        rows: ResultList,
        classes: HashSet<TableId>,
    ) {
        self.entries
            .insert((fingerprint, param_key(params)), ResultEntry { rows, classes });
    }

    /// Results over a mutated class are stale; drop them.
    pub fn invalidate_classes(&self, modified: &HashSet<TableId>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.classes.is_disjoint(modified));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Transaction tracking
// ============================================================================

/// Modified-class bookkeeping per transaction, applied to both caches at
/// cleanup.
#[derive(Default)]
pub struct TransactionTracker {
    modified: DashMap<TransactionId, HashSet<TableId>>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_modified(&self, txn: TransactionId, class: TableId) {
        self.modified.entry(txn).or_default().insert(class);
    }

    /// End-of-transaction sweep: invalidate anything the transaction
    /// touched, then forget the set.
    pub fn cleanup(
        &self,
        txn: TransactionId,
        plan_cache: &PlanCache,
        result_cache: &ResultCache,
    ) -> usize {
        let Some((_, modified)) = self.modified.remove(&txn) else {
            return 0;
        };
        plan_cache.invalidate_classes(&modified) + result_cache.invalidate_classes(&modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xasl::{XaslKind, XaslNode};

    fn dummy_xasl() -> XaslNode {
        XaslNode::new(XaslKind::ScanChain { specs: vec![] })
    }

    #[test]
    fn test_fingerprint_normalizes_whitespace_and_case() {
        let a = QueryFingerprint::of_query_text("SELECT  *  FROM t");
        let b = QueryFingerprint::of_query_text("select * from T");
        let c = QueryFingerprint::of_query_text("select * from u");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 40);
    }

    #[test]
    fn test_plan_cache_fix_and_invalidate() {
        let cache = PlanCache::new(16);
        let fp = QueryFingerprint::of_query_text("select * from t where a = ?");
        let fixed = cache.insert(fp, dummy_xasl(), "sscan(t)".into(), HashSet::from([7]));
        assert_eq!(fixed.entry().fix_count(), 1);

        let again = cache.probe(&fp).expect("hit");
        assert_eq!(again.entry().fix_count(), 2);

        // invalidating class 7 removes the entry from the table even while
        // fixed; the fixed handles keep the payload alive
        assert_eq!(cache.invalidate_classes(&HashSet::from([7])), 1);
        assert!(cache.probe(&fp).is_none());
        assert_eq!(again.entry().plan_text, "sscan(t)");

        drop(again);
        assert_eq!(fixed.entry().fix_count(), 1);
    }

    #[test]
    fn test_plan_cache_eviction_skips_fixed() {
        let cache = PlanCache::new(1);
        let fp1 = QueryFingerprint::of_query_text("q1");
        let fp2 = QueryFingerprint::of_query_text("q2");
        let fixed = cache.insert(fp1, dummy_xasl(), String::new(), HashSet::new());
        // fp1 is fixed, so inserting fp2 cannot evict it
        let _f2 = cache.insert(fp2, dummy_xasl(), String::new(), HashSet::new());
        assert!(cache.probe(&fp1).is_some());
        drop(fixed);
    }

    #[test]
    fn test_result_cache_param_sensitivity() {
        let cache = ResultCache::new();
        let fp = QueryFingerprint::of_query_text("select * from t where a = ?");
        let rows: ResultList = Arc::new(vec![vec![Value::Integer(1)]]);
        cache.put(fp, &[Value::Integer(5)], rows.clone(), HashSet::from([7]));

        assert!(cache.get(&fp, &[Value::Integer(5)]).is_some());
        assert!(cache.get(&fp, &[Value::Integer(6)]).is_none());

        assert_eq!(cache.invalidate_classes(&HashSet::from([8])), 0);
        assert_eq!(cache.invalidate_classes(&HashSet::from([7])), 1);
        assert!(cache.get(&fp, &[Value::Integer(5)]).is_none());
    }

    #[test]
    fn test_transaction_cleanup_sweeps_both_caches() {
        let plans = PlanCache::new(16);
        let results = ResultCache::new();
        let txns = TransactionTracker::new();

        let fp = QueryFingerprint::of_query_text("select * from t");
        let _fixed = plans.insert(fp, dummy_xasl(), String::new(), HashSet::from([3]));
        results.put(fp, &[], Arc::new(vec![]), HashSet::from([3]));

        txns.record_modified(42, 3);
        assert_eq!(txns.cleanup(42, &plans, &results), 2);
        assert!(plans.is_empty());
        assert!(results.is_empty());
        // idempotent for an unknown transaction
        assert_eq!(txns.cleanup(42, &plans, &results), 0);
    }
}

use crate::common::{ColumnId, IndexId, TableId};
use crate::error::DbError;
use crate::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// Column metadata as the optimizer sees it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnMeta {
    pub id: ColumnId,
    pub name: String,
    pub not_null: bool,
    /// Number of distinct values, when statistics exist for the column.
    pub distinct: Option<u64>,
}

// B+tree statistics for one index, refreshed by the statistics daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub id: IndexId,
    pub name: String,
    /// Indexed columns, leading column first.
    pub columns: Vec<ColumnId>,
    /// Per-column sort direction; true is ascending.
    pub col_asc: Vec<bool>,
    pub unique: bool,
    /// True when the index carries its own filter predicate.
    pub filtered: bool,
    /// Height of the B+tree.
    pub height: u64,
    /// Leaf pages, overflow included.
    pub leafs: u64,
    /// Total pages of the B+tree.
    pub pages: u64,
    /// Total number of keys.
    pub keys: u64,
    /// Partial-key distinct counts: pkeys[i] is the number of distinct
    /// prefixes over columns[0..=i].
    pub pkeys: Vec<u64>,
}

impl IndexStats {
    /// Distinct count of the full key prefix of length `n`, clamped to at
    /// least one so selectivity division stays finite.
    pub fn pkey(&self, n: usize) -> u64 {
        if n == 0 || self.pkeys.is_empty() {
            return self.keys.max(1);
        }
        let i = n.min(self.pkeys.len()) - 1;
        self.pkeys[i].max(1)
    }
}

// Class (table) statistics plus column and index metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassStats {
    pub id: TableId,
    pub name: String,
    /// Number of objects in the class.
    pub ncard: u64,
    /// Number of heap pages occupied by those objects.
    pub tcard: u64,
    pub columns: Vec<ColumnMeta>,
    pub indexes: Vec<IndexStats>,
}

impl ClassStats {
    pub fn column(&self, id: ColumnId) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Best distinct-count estimate for a column: prefer the leading-column
    /// pkey of any index on it, then the column statistic itself.
    pub fn column_distinct(&self, id: ColumnId) -> Option<u64> {
        for idx in &self.indexes {
            if idx.columns.first() == Some(&id) {
                return Some(idx.pkey(1));
            }
        }
        self.column(id).and_then(|c| c.distinct)
    }

    /// True when any index leads with the column.
    pub fn column_indexed(&self, id: ColumnId) -> bool {
        self.indexes.iter().any(|i| i.columns.first() == Some(&id))
    }
}

/// Where the optimizer reads statistics from. The server-side engine
/// implements this against its statistics manager; tests and standalone
/// tools use [`MemoryCatalog`].
pub trait StatsSource: Send + Sync {
    fn class_stats(&self, class: TableId) -> Result<Arc<ClassStats>>;
}

// In-memory statistics catalog
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    classes: Arc<RwLock<HashMap<TableId, Arc<ClassStats>>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stats: ClassStats) {
        self.classes.write().insert(stats.id, Arc::new(stats));
    }

    pub fn remove(&self, class: TableId) -> Result<()> {
        self.classes
            .write()
            .remove(&class)
            .map(|_| ())
            .ok_or_else(|| DbError::Catalog(format!("Class {} not found", class)))
    }

    pub fn list_classes(&self) -> Vec<TableId> {
        self.classes.read().keys().copied().collect()
    }
}

impl StatsSource for MemoryCatalog {
    fn class_stats(&self, class: TableId) -> Result<Arc<ClassStats>> {
        self.classes
            .read()
            .get(&class)
            .cloned()
            .ok_or_else(|| DbError::Catalog(format!("Class {} not found", class)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_class() -> ClassStats {
        ClassStats {
            id: 1,
            name: "employee".to_string(),
            ncard: 10_000,
            tcard: 250,
            columns: vec![
                ColumnMeta {
                    id: 0,
                    name: "id".to_string(),
                    not_null: true,
                    distinct: Some(10_000),
                },
                ColumnMeta {
                    id: 1,
                    name: "dept".to_string(),
                    not_null: false,
                    distinct: Some(40),
                },
            ],
            indexes: vec![IndexStats {
                id: 100,
                name: "pk_employee".to_string(),
                columns: vec![0],
                col_asc: vec![true],
                unique: true,
                filtered: false,
                height: 2,
                leafs: 32,
                pages: 35,
                keys: 10_000,
                pkeys: vec![10_000],
            }],
        }
    }

    #[test]
    fn test_catalog_lookup() -> Result<()> {
        let catalog = MemoryCatalog::new();
        catalog.register(sample_class());

        let stats = catalog.class_stats(1)?;
        assert_eq!(stats.name, "employee");
        assert_eq!(stats.ncard, 10_000);
        assert!(catalog.class_stats(2).is_err());
        Ok(())
    }

    #[test]
    fn test_column_distinct_prefers_index_pkeys() {
        let stats = sample_class();
        assert_eq!(stats.column_distinct(0), Some(10_000));
        assert_eq!(stats.column_distinct(1), Some(40));
        assert!(stats.column_indexed(0));
        assert!(!stats.column_indexed(1));
    }

    #[test]
    fn test_pkey_clamps() {
        let stats = sample_class();
        let idx = &stats.indexes[0];
        assert_eq!(idx.pkey(1), 10_000);
        assert_eq!(idx.pkey(5), 10_000);
    }
}

//! In-memory wide-column store
//!
//! Implements the full [`StoreClient`] contract in process: per-cell
//! last-writer-wins, tombstones, TTL, projection and the equality row
//! filter. Used by the test suite and for local development.
//!
//! Tombstones expire after a grace period. Expired cells are dropped from a
//! row whenever it is written, and from every row by [`MemoryStore::compact`].

use super::{
    BackendError, Cell, Consistency, KeySlice, Mutation, MutationBatch, RangeQuery, RowFilter,
    StoreClient,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct StoredCell {
    /// `None` marks a tombstone
    value: Option<Vec<u8>>,
    timestamp: i64,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredCell {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn live_value(&self, now: DateTime<Utc>) -> Option<&Vec<u8>> {
        match self.expires_at {
            Some(at) if at <= now => None,
            _ => self.value.as_ref(),
        }
    }
}

type Row = BTreeMap<String, StoredCell>;
type Family = BTreeMap<Vec<u8>, Row>;

/// Default time a tombstone keeps shadowing late writes
const DEFAULT_TOMBSTONE_GRACE: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Thread-safe in-memory store
#[derive(Clone)]
pub struct MemoryStore {
    families: Arc<RwLock<BTreeMap<String, Family>>>,
    tombstone_grace: Duration,
    /// Number of upcoming calls that fail with `Unavailable`
    failures: Arc<AtomicUsize>,
    /// Same, counting batch calls only
    mutation_failures: Arc<AtomicUsize>,
    mutation_calls: Arc<AtomicUsize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_tombstone_grace(DEFAULT_TOMBSTONE_GRACE)
    }
}

impl MemoryStore {
    pub fn with_tombstone_grace(tombstone_grace: Duration) -> Self {
        Self {
            families: Arc::default(),
            tombstone_grace,
            failures: Arc::default(),
            mutation_failures: Arc::default(),
            mutation_calls: Arc::default(),
        }
    }

    /// Drop expired cells and spent tombstones everywhere, then empty rows.
    /// Returns the number of cells removed.
    pub async fn compact(&self) -> usize {
        let now = Utc::now();
        let mut families = self.families.write().await;
        let mut purged = 0;
        for family in families.values_mut() {
            for row in family.values_mut() {
                purged += Self::purge_row(row, now);
            }
            family.retain(|_, row| !row.is_empty());
        }
        debug!("memory compaction dropped {} cells", purged);
        purged
    }

    /// Make the next `count` store calls fail
    #[cfg(test)]
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` batch calls fail, leaving reads alone
    #[cfg(test)]
    pub fn fail_next_mutation(&self, count: usize) {
        self.mutation_failures.store(count, Ordering::SeqCst);
    }

    /// Number of batch calls that reached the store
    #[cfg(test)]
    pub fn mutation_calls(&self) -> usize {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    /// Number of rows (live or tombstoned) held in a family
    #[cfg(test)]
    pub async fn row_count(&self, family: &str) -> usize {
        let families = self.families.read().await;
        families.get(family).map(|f| f.len()).unwrap_or(0)
    }

    /// Expiry of a stored cell, if it carries a TTL
    #[cfg(test)]
    pub async fn cell_expiry(
        &self,
        key: &[u8],
        family: &str,
        column: &str,
    ) -> Option<DateTime<Utc>> {
        let families = self.families.read().await;
        families
            .get(family)?
            .get(key)?
            .get(column)?
            .expires_at
    }

    fn check_injected_failure(&self, operation: &str) -> Result<(), BackendError> {
        Self::take_failure(&self.failures, operation)
    }

    fn check_injected_mutation_failure(&self, operation: &str) -> Result<(), BackendError> {
        self.check_injected_failure(operation)?;
        Self::take_failure(&self.mutation_failures, operation)
    }

    fn take_failure(counter: &AtomicUsize, operation: &str) -> Result<(), BackendError> {
        let taken = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_ok() {
            warn!("Injected store failure on {}", operation);
            return Err(BackendError::Unavailable(format!(
                "injected failure during {}",
                operation
            )));
        }
        Ok(())
    }

    fn purge_row(row: &mut Row, now: DateTime<Utc>) -> usize {
        let before = row.len();
        row.retain(|_, cell| !cell.is_expired(now));
        before - row.len()
    }

    fn apply(&self, families: &mut BTreeMap<String, Family>, batch: MutationBatch, now: DateTime<Utc>) {
        let tombstone_expires_at = chrono::Duration::from_std(self.tombstone_grace)
            .ok()
            .map(|grace| now + grace);
        for (partition, by_family) in batch.partitions() {
            for (family, mutations) in by_family {
                let row = families
                    .entry(family.clone())
                    .or_default()
                    .entry(partition.clone())
                    .or_default();
                Self::purge_row(row, now);
                for mutation in mutations {
                    Self::apply_one(row, mutation, now, tombstone_expires_at);
                }
            }
        }
    }

    fn apply_one(
        row: &mut Row,
        mutation: &Mutation,
        now: DateTime<Utc>,
        tombstone_expires_at: Option<DateTime<Utc>>,
    ) {
        match mutation {
            Mutation::Insert {
                column,
                value,
                timestamp,
                ttl,
            } => {
                let shadowed = row.get(column).is_some_and(|existing| match existing.value {
                    None => existing.timestamp >= *timestamp,
                    Some(_) => existing.timestamp > *timestamp,
                });
                if shadowed {
                    return;
                }
                let expires_at = ttl.and_then(|ttl| {
                    chrono::Duration::from_std(ttl).ok().map(|d| now + d)
                });
                row.insert(
                    column.clone(),
                    StoredCell {
                        value: Some(value.clone()),
                        timestamp: *timestamp,
                        expires_at,
                    },
                );
            }
            Mutation::Delete { columns, timestamp } => {
                for column in columns {
                    if row.get(column).is_some_and(|c| c.timestamp > *timestamp) {
                        continue;
                    }
                    row.insert(
                        column.clone(),
                        StoredCell {
                            value: None,
                            timestamp: *timestamp,
                            expires_at: tombstone_expires_at,
                        },
                    );
                }
            }
        }
    }

    fn matches_filter(row: &Row, filter: &RowFilter, now: DateTime<Utc>) -> bool {
        match filter {
            RowFilter::Equals { column, value } => row
                .get(column)
                .and_then(|cell| cell.live_value(now))
                .is_some_and(|v| v == value),
        }
    }
}

impl StoreClient for MemoryStore {
    async fn get(
        &self,
        key: &[u8],
        family: &str,
        column: &str,
        consistency: Consistency,
    ) -> Result<Option<Cell>, BackendError> {
        self.check_injected_failure("get")?;
        debug!("memory get {}:{} at {}", family, column, consistency);

        let now = Utc::now();
        let families = self.families.read().await;
        let cell = families
            .get(family)
            .and_then(|f| f.get(key))
            .and_then(|row| row.get(column))
            .and_then(|cell| {
                cell.live_value(now).map(|value| Cell {
                    name: column.to_string(),
                    value: value.clone(),
                    timestamp: cell.timestamp,
                })
            });
        Ok(cell)
    }

    async fn range_scan(
        &self,
        query: &RangeQuery,
        consistency: Consistency,
    ) -> Result<Vec<KeySlice>, BackendError> {
        self.check_injected_failure("range_scan")?;
        debug!(
            "memory range scan on {} (limit {}) at {}",
            query.family, query.limit, consistency
        );

        let now = Utc::now();
        let families = self.families.read().await;
        let Some(family) = families.get(&query.family) else {
            return Ok(Vec::new());
        };
        if query.start > query.end {
            return Ok(Vec::new());
        }

        let range = (
            Bound::Included(query.start.clone()),
            Bound::Excluded(query.end.clone()),
        );
        let slices = family
            .range(range)
            .filter(|(_, row)| {
                query
                    .filter
                    .as_ref()
                    .map_or(true, |f| Self::matches_filter(row, f, now))
            })
            .take(query.limit)
            .map(|(key, row)| KeySlice {
                key: key.clone(),
                columns: row
                    .iter()
                    .filter(|(name, _)| query.columns.iter().any(|c| c == *name))
                    .filter_map(|(name, cell)| {
                        cell.live_value(now).map(|value| Cell {
                            name: name.clone(),
                            value: value.clone(),
                            timestamp: cell.timestamp,
                        })
                    })
                    .collect(),
            })
            .collect();
        Ok(slices)
    }

    async fn batch_mutate(
        &self,
        batch: MutationBatch,
        consistency: Consistency,
    ) -> Result<(), BackendError> {
        self.check_injected_mutation_failure("batch_mutate")?;
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        debug!(
            "memory batch over {} partitions at {}",
            batch.partition_count(),
            consistency
        );

        let now = Utc::now();
        let mut families = self.families.write().await;
        self.apply(&mut families, batch, now);
        Ok(())
    }

    async fn atomic_batch_mutate(
        &self,
        batch: MutationBatch,
        consistency: Consistency,
    ) -> Result<(), BackendError> {
        self.check_injected_mutation_failure("atomic_batch_mutate")?;
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        debug!(
            "memory atomic batch over {} partitions at {}",
            batch.partition_count(),
            consistency
        );

        // One write guard covers the whole batch
        let now = Utc::now();
        let mut families = self.families.write().await;
        self.apply(&mut families, batch, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn insert(column: &str, value: &[u8], timestamp: i64) -> Mutation {
        Mutation::Insert {
            column: column.to_string(),
            value: value.to_vec(),
            timestamp,
            ttl: None,
        }
    }

    fn scan(family: &str, columns: &[&str], limit: usize) -> RangeQuery {
        RangeQuery {
            family: family.to_string(),
            start: b"row:".to_vec(),
            end: b"row;".to_vec(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            filter: None,
            limit,
        }
    }

    async fn write(store: &MemoryStore, key: &[u8], mutation: Mutation) {
        let mut batch = MutationBatch::new();
        batch.push(key, "cf", mutation);
        assert_ok!(store.atomic_batch_mutate(batch, Consistency::Quorum).await);
    }

    #[tokio::test]
    async fn test_last_writer_wins_by_timestamp() {
        let store = MemoryStore::default();
        write(&store, b"row:1", insert("name", b"new", 20)).await;
        write(&store, b"row:1", insert("name", b"old", 10)).await;

        let cell = store.get(b"row:1", "cf", "name", Consistency::One).await.unwrap().unwrap();
        assert_eq!(cell.value, b"new");
        assert_eq!(cell.timestamp, 20);
    }

    #[tokio::test]
    async fn test_delete_spares_later_writes_and_shadows_earlier_ones() {
        let store = MemoryStore::default();
        write(&store, b"row:1", insert("name", b"a", 10)).await;
        write(&store, b"row:1", insert("city", b"b", 30)).await;
        write(
            &store,
            b"row:1",
            Mutation::Delete {
                columns: vec!["name".into(), "city".into()],
                timestamp: 20,
            },
        )
        .await;

        assert!(store.get(b"row:1", "cf", "name", Consistency::One).await.unwrap().is_none());
        assert!(store.get(b"row:1", "cf", "city", Consistency::One).await.unwrap().is_some());

        // An insert older than the tombstone stays invisible
        write(&store, b"row:1", insert("name", b"late", 15)).await;
        assert!(store.get(b"row:1", "cf", "name", Consistency::One).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_range_scan_orders_projects_and_keeps_ghost_rows() {
        let store = MemoryStore::default();
        write(&store, b"row:b", insert("name", b"B", 1)).await;
        write(&store, b"row:a", insert("name", b"A", 1)).await;
        write(&store, b"row:a", insert("secret", b"x", 1)).await;
        write(
            &store,
            b"row:c",
            Mutation::Delete {
                columns: vec!["name".into()],
                timestamp: 5,
            },
        )
        .await;
        write(&store, b"other:z", insert("name", b"Z", 1)).await;

        let rows = store.range_scan(&scan("cf", &["name"], 10), Consistency::One).await.unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec![b"row:a".to_vec(), b"row:b".to_vec(), b"row:c".to_vec()]);
        assert_eq!(rows[0].columns.len(), 1);
        assert_eq!(rows[0].columns[0].name, "name");
        assert!(rows[2].columns.is_empty());

        let limited = store.range_scan(&scan("cf", &["name"], 2), Consistency::One).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_range_scan_equality_filter() {
        let store = MemoryStore::default();
        write(&store, b"row:a", insert("username", b"ada", 1)).await;
        write(&store, b"row:b", insert("username", b"bob", 1)).await;

        let mut query = scan("cf", &["username"], 10);
        query.filter = Some(RowFilter::Equals {
            column: "username".into(),
            value: b"bob".to_vec(),
        });
        let rows = store.range_scan(&query, Consistency::One).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, b"row:b");
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::default();
        write(
            &store,
            b"row:1",
            Mutation::Insert {
                column: "pb_data".into(),
                value: b"x".to_vec(),
                timestamp: 1,
                ttl: Some(Duration::from_millis(5)),
            },
        )
        .await;
        assert!(store.cell_expiry(b"row:1", "cf", "pb_data").await.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get(b"row:1", "cf", "pb_data", Consistency::One).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writes_drop_expired_cells_from_the_row() {
        let store = MemoryStore::default();
        write(
            &store,
            b"row:1",
            Mutation::Insert {
                column: "pb_data".into(),
                value: b"x".to_vec(),
                timestamp: 1,
                ttl: Some(Duration::from_millis(5)),
            },
        )
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        write(&store, b"row:1", insert("name", b"a", 2)).await;
        assert!(store.cell_expiry(b"row:1", "cf", "pb_data").await.is_none());
        assert!(store.get(b"row:1", "cf", "name", Consistency::One).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_compact_purges_spent_tombstones_and_empty_rows() {
        let store = MemoryStore::with_tombstone_grace(Duration::from_millis(5));
        write(&store, b"row:1", insert("name", b"a", 10)).await;
        write(&store, b"row:2", insert("name", b"b", 10)).await;
        write(
            &store,
            b"row:1",
            Mutation::Delete {
                columns: vec!["name".into()],
                timestamp: 20,
            },
        )
        .await;
        assert!(store.cell_expiry(b"row:1", "cf", "name").await.is_some());
        assert_eq!(store.row_count("cf").await, 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.compact().await, 1);
        assert_eq!(store.row_count("cf").await, 1);

        let rows = store.range_scan(&scan("cf", &["name"], 10), Consistency::One).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, b"row:2");
    }

    #[tokio::test]
    async fn test_tombstone_shadows_late_writes_within_grace() {
        let store = MemoryStore::default();
        write(
            &store,
            b"row:1",
            Mutation::Delete {
                columns: vec!["name".into()],
                timestamp: 20,
            },
        )
        .await;
        assert_eq!(store.compact().await, 0);

        write(&store, b"row:1", insert("name", b"late", 15)).await;
        assert!(store.get(b"row:1", "cf", "name", Consistency::One).await.unwrap().is_none());
        assert_eq!(store.row_count("cf").await, 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::default();
        store.fail_next(1);
        assert!(matches!(
            store.get(b"row:1", "cf", "name", Consistency::One).await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(store.get(b"row:1", "cf", "name", Consistency::One).await.is_ok());

        store.fail_next_mutation(1);
        assert!(store.get(b"row:1", "cf", "name", Consistency::One).await.is_ok());
        let mut batch = MutationBatch::new();
        batch.push(b"row:1", "cf", insert("name", b"a", 1));
        assert_err!(store.atomic_batch_mutate(batch, Consistency::Quorum).await);
        assert_eq!(store.mutation_calls(), 0);
    }
}

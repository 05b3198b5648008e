//! Wide-column store contract
//!
//! The membership core only talks to the store through [`StoreClient`]:
//! point reads, ranged key scans with column projection and an optional
//! equality row filter, and two batch-mutation primitives. Adapters live in
//! the submodules.

pub mod memory;
pub mod postgres;
mod queries;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Consistency level requested for a store call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// Weakest level, tolerates stale reads
    One,
    /// Majority of replicas
    Quorum,
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Consistency::One => write!(f, "one"),
            Consistency::Quorum => write!(f, "quorum"),
        }
    }
}

/// Errors raised by a store adapter
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
}

/// A single live column as returned by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub name: String,
    pub value: Vec<u8>,
    /// Write timestamp (nanoseconds since the epoch)
    pub timestamp: i64,
}

/// One row of a range scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySlice {
    pub key: Vec<u8>,
    pub columns: Vec<Cell>,
}

/// Exact-match filter on one column. This is the only filter the store
/// documents; nothing else may be assumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    Equals { column: String, value: Vec<u8> },
}

/// Ranged key scan over one column family
#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub family: String,
    /// Inclusive start key
    pub start: Vec<u8>,
    /// Exclusive end key
    pub end: Vec<u8>,
    /// Column projection
    pub columns: Vec<String>,
    pub filter: Option<RowFilter>,
    /// Maximum number of rows
    pub limit: usize,
}

/// A single mutation against one partition and column family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Insert {
        column: String,
        value: Vec<u8>,
        timestamp: i64,
        ttl: Option<Duration>,
    },
    /// Deletes the named columns, shadowing any write at or before `timestamp`
    Delete { columns: Vec<String>, timestamp: i64 },
}

/// Mutations grouped by partition key, then column family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationBatch {
    partitions: BTreeMap<Vec<u8>, BTreeMap<String, Vec<Mutation>>>,
}

impl MutationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, partition: &[u8], family: &str, mutation: Mutation) {
        self.partitions
            .entry(partition.to_vec())
            .or_default()
            .entry(family.to_string())
            .or_default()
            .push(mutation);
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&Vec<u8>, &BTreeMap<String, Vec<Mutation>>)> {
        self.partitions.iter()
    }

    /// Mutations for one partition and family, if any
    pub fn get(&self, partition: &[u8], family: &str) -> Option<&[Mutation]> {
        self.partitions
            .get(partition)
            .and_then(|f| f.get(family))
            .map(|m| m.as_slice())
    }
}

/// Operations the membership core requires from the wide-column store.
///
/// Implementations must be safe for concurrent use from many requests.
pub trait StoreClient: Send + Sync + 'static {
    /// Point read of a single column. `Ok(None)` when absent.
    fn get(
        &self,
        key: &[u8],
        family: &str,
        column: &str,
        consistency: Consistency,
    ) -> impl Future<Output = Result<Option<Cell>, BackendError>> + Send;

    /// Rows in ascending key order, restricted to the projected columns.
    fn range_scan(
        &self,
        query: &RangeQuery,
        consistency: Consistency,
    ) -> impl Future<Output = Result<Vec<KeySlice>, BackendError>> + Send;

    /// Applies independently per partition; partial application is possible.
    fn batch_mutate(
        &self,
        batch: MutationBatch,
        consistency: Consistency,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Applies all partitions together or none.
    fn atomic_batch_mutate(
        &self,
        batch: MutationBatch,
        consistency: Consistency,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// Store backend selected at startup
pub enum StoreBackend {
    Memory(MemoryStore),
    Postgres(PostgresStore),
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Memory(_) => "memory",
            StoreBackend::Postgres(_) => "postgres",
        }
    }

    /// Purge expired cells and spent tombstones. Returns how many went.
    pub async fn compact(&self) -> Result<u64, BackendError> {
        match self {
            StoreBackend::Memory(s) => Ok(s.compact().await as u64),
            StoreBackend::Postgres(s) => s.compact().await,
        }
    }
}

impl StoreClient for StoreBackend {
    async fn get(
        &self,
        key: &[u8],
        family: &str,
        column: &str,
        consistency: Consistency,
    ) -> Result<Option<Cell>, BackendError> {
        match self {
            StoreBackend::Memory(s) => s.get(key, family, column, consistency).await,
            StoreBackend::Postgres(s) => s.get(key, family, column, consistency).await,
        }
    }

    async fn range_scan(
        &self,
        query: &RangeQuery,
        consistency: Consistency,
    ) -> Result<Vec<KeySlice>, BackendError> {
        match self {
            StoreBackend::Memory(s) => s.range_scan(query, consistency).await,
            StoreBackend::Postgres(s) => s.range_scan(query, consistency).await,
        }
    }

    async fn batch_mutate(
        &self,
        batch: MutationBatch,
        consistency: Consistency,
    ) -> Result<(), BackendError> {
        match self {
            StoreBackend::Memory(s) => s.batch_mutate(batch, consistency).await,
            StoreBackend::Postgres(s) => s.batch_mutate(batch, consistency).await,
        }
    }

    async fn atomic_batch_mutate(
        &self,
        batch: MutationBatch,
        consistency: Consistency,
    ) -> Result<(), BackendError> {
        match self {
            StoreBackend::Memory(s) => s.atomic_batch_mutate(batch, consistency).await,
            StoreBackend::Postgres(s) => s.atomic_batch_mutate(batch, consistency).await,
        }
    }
}

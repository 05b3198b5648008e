//! PostgreSQL-backed wide-column store
//!
//! Emulates the column-family contract on a single `wide_cells` table.
//! Atomic batches run in one transaction; best-effort batches run one
//! transaction per partition, so a failure part-way leaves earlier
//! partitions applied, exactly as the contract allows.

use super::queries::{
    CREATE_CELLS_TABLE, CREATE_EXPIRY_INDEX, GET_CELL, PURGE_EXPIRED, PURGE_PARTITION, RANGE_SCAN,
    RANGE_SCAN_FILTERED, TOMBSTONE_CELLS, UPSERT_CELL,
};
use super::{
    BackendError, Cell, Consistency, KeySlice, Mutation, MutationBatch, RangeQuery, RowFilter,
    StoreClient,
};
use crate::config::StoreConfig;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

/// Wide-column store on top of a deadpool-postgres pool
pub struct PostgresStore {
    pool: Pool,
    timeout: Duration,
    tombstone_grace: Duration,
}

/// `(partition, name, value, write_ts)` as produced by the range scans.
/// Name, value and timestamp are NULL for a row with no live projected column.
type CellRow = (Vec<u8>, Option<String>, Option<Vec<u8>>, Option<i64>);

impl PostgresStore {
    /// Build the pool, verify connectivity and make sure the cell table exists
    pub async fn connect(config: &StoreConfig) -> Result<Self, BackendError> {
        let pool = Self::create_pool(config)?;
        let store = Self {
            pool,
            timeout: Duration::from_secs(config.timeout_secs),
            tombstone_grace: config.tombstone_grace(),
        };

        store
            .with_timeout("connect", async {
                let client = store.pool.get().await?;
                client.query_one("SELECT 1", &[]).await?;
                client.execute(CREATE_CELLS_TABLE, &[]).await?;
                client.execute(CREATE_EXPIRY_INDEX, &[]).await?;
                Ok::<(), BackendError>(())
            })
            .await?;

        info!(
            "Wide-column store ready on {}:{}/{} (TLS: {})",
            config.host, config.port, config.database, config.require_tls
        );
        Ok(store)
    }

    fn create_pool(config: &StoreConfig) -> Result<Pool, BackendError> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.dbname = Some(config.database.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(config.max_pool_size));

        let pool = if config.require_tls {
            let certs = rustls_native_certs::load_native_certs();
            let mut root_store = rustls::RootCertStore::empty();
            for cert in certs.certs {
                root_store.add(cert).ok();
            }

            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
            cfg.create_pool(Some(Runtime::Tokio1), tls)
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        };

        pool.map_err(|e| BackendError::Unavailable(format!("Failed to create pool: {}", e)))
    }

    async fn with_timeout<T, F>(&self, operation: &str, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Store call {} timed out after {:?}", operation, self.timeout);
                Err(BackendError::Timeout(self.timeout))
            }
        }
    }

    /// Delete expired cells and tombstones past their grace period
    pub async fn compact(&self) -> Result<u64, BackendError> {
        self.with_timeout("compact", async {
            let client = self.pool.get().await?;
            Ok::<_, BackendError>(client.execute(PURGE_EXPIRED, &[]).await?)
        })
        .await
    }

    fn tombstone_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.tombstone_grace)
            .ok()
            .map(|grace| now + grace)
    }

    async fn apply_mutations(
        &self,
        tx: &deadpool_postgres::Transaction<'_>,
        partition: &[u8],
        family: &str,
        mutations: &[Mutation],
    ) -> Result<(), BackendError> {
        let now = Utc::now();
        tx.execute(PURGE_PARTITION, &[&family, &partition]).await?;
        let tombstone_expires_at = self.tombstone_expiry(now);
        for mutation in mutations {
            match mutation {
                Mutation::Insert {
                    column,
                    value,
                    timestamp,
                    ttl,
                } => {
                    let expires_at = ttl
                        .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                        .map(|ttl| now + ttl);
                    tx.execute(
                        UPSERT_CELL,
                        &[&family, &partition, column, value, timestamp, &expires_at],
                    )
                    .await?;
                }
                Mutation::Delete { columns, timestamp } => {
                    tx.execute(
                        TOMBSTONE_CELLS,
                        &[&family, &partition, columns, timestamp, &tombstone_expires_at],
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_families(
        &self,
        tx: &deadpool_postgres::Transaction<'_>,
        partition: &[u8],
        families: &BTreeMap<String, Vec<Mutation>>,
    ) -> Result<(), BackendError> {
        for (family, mutations) in families {
            self.apply_mutations(tx, partition, family, mutations).await?;
        }
        Ok(())
    }

    fn collect_slices(rows: Vec<tokio_postgres::Row>) -> Vec<KeySlice> {
        group_cell_rows(rows.into_iter().map(|row| -> CellRow {
            (row.get(0), row.get(1), row.get(2), row.get(3))
        }))
    }
}

/// Fold scan rows, ordered by partition, into one slice per partition
fn group_cell_rows(rows: impl IntoIterator<Item = CellRow>) -> Vec<KeySlice> {
    let mut slices: Vec<KeySlice> = Vec::new();
    for (key, name, value, timestamp) in rows {
        if slices.last().map_or(true, |s| s.key != key) {
            slices.push(KeySlice {
                key,
                columns: Vec::new(),
            });
        }

        if let (Some(name), Some(value), Some(timestamp), Some(slice)) =
            (name, value, timestamp, slices.last_mut())
        {
            slice.columns.push(Cell {
                name,
                value,
                timestamp,
            });
        }
    }
    slices
}

impl StoreClient for PostgresStore {
    async fn get(
        &self,
        key: &[u8],
        family: &str,
        column: &str,
        consistency: Consistency,
    ) -> Result<Option<Cell>, BackendError> {
        debug!("get {}:{} at {}", family, column, consistency);
        self.with_timeout("get", async {
            let client = self.pool.get().await?;
            let row = client.query_opt(GET_CELL, &[&family, &key, &column]).await?;
            Ok::<_, BackendError>(row.map(|r| Cell {
                name: column.to_string(),
                value: r.get(0),
                timestamp: r.get(1),
            }))
        })
        .await
    }

    async fn range_scan(
        &self,
        query: &RangeQuery,
        consistency: Consistency,
    ) -> Result<Vec<KeySlice>, BackendError> {
        debug!(
            "range scan on {} (limit {}) at {}",
            query.family, query.limit, consistency
        );
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

        self.with_timeout("range_scan", async {
            let client = self.pool.get().await?;
            let rows = match &query.filter {
                None => {
                    client
                        .query(
                            RANGE_SCAN,
                            &[&query.family, &query.start, &query.end, &limit, &query.columns],
                        )
                        .await?
                }
                Some(RowFilter::Equals { column, value }) => {
                    client
                        .query(
                            RANGE_SCAN_FILTERED,
                            &[
                                &query.family,
                                &query.start,
                                &query.end,
                                &limit,
                                &query.columns,
                                column,
                                value,
                            ],
                        )
                        .await?
                }
            };
            Ok::<_, BackendError>(Self::collect_slices(rows))
        })
        .await
    }

    async fn batch_mutate(
        &self,
        batch: MutationBatch,
        consistency: Consistency,
    ) -> Result<(), BackendError> {
        debug!(
            "batch over {} partitions at {}",
            batch.partition_count(),
            consistency
        );
        self.with_timeout("batch_mutate", async {
            let mut client = self.pool.get().await?;
            for (partition, families) in batch.partitions() {
                let tx = client.transaction().await?;
                self.apply_families(&tx, partition, families).await?;
                tx.commit().await?;
            }
            Ok::<(), BackendError>(())
        })
        .await
    }

    async fn atomic_batch_mutate(
        &self,
        batch: MutationBatch,
        consistency: Consistency,
    ) -> Result<(), BackendError> {
        debug!(
            "atomic batch over {} partitions at {}",
            batch.partition_count(),
            consistency
        );
        self.with_timeout("atomic_batch_mutate", async {
            let mut client = self.pool.get().await?;
            let tx = client.transaction().await?;
            for (partition, families) in batch.partitions() {
                self.apply_families(&tx, partition, families).await?;
            }
            // Dropping an uncommitted transaction rolls it back
            tx.commit().await?;
            Ok::<(), BackendError>(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn live(key: &[u8], name: &str, value: &[u8], timestamp: i64) -> CellRow {
        (
            key.to_vec(),
            Some(name.to_string()),
            Some(value.to_vec()),
            Some(timestamp),
        )
    }

    fn empty(key: &[u8]) -> CellRow {
        (key.to_vec(), None, None, None)
    }

    #[test]
    fn test_group_cell_rows_one_slice_per_partition() {
        let slices = group_cell_rows(vec![
            live(b"a", "city", b"Bern", 3),
            live(b"a", "name", b"Ada", 1),
            empty(b"b"),
            live(b"c", "name", b"Cy", 2),
        ]);

        let keys: Vec<_> = slices.iter().map(|s| s.key.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(
            slices[0].columns,
            vec![
                Cell { name: "city".into(), value: b"Bern".to_vec(), timestamp: 3 },
                Cell { name: "name".into(), value: b"Ada".to_vec(), timestamp: 1 },
            ]
        );
        assert!(slices[1].columns.is_empty());
        assert_eq!(slices[2].columns.len(), 1);
    }

    #[test]
    fn test_group_cell_rows_drops_partial_cells() {
        let slices = group_cell_rows(vec![
            (b"a".to_vec(), Some("name".to_string()), None, Some(1)),
            (b"a".to_vec(), None, Some(b"x".to_vec()), Some(1)),
        ]);
        assert_eq!(slices.len(), 1);
        assert!(slices[0].columns.is_empty());
    }

    #[test]
    fn test_group_cell_rows_empty_scan() {
        assert!(group_cell_rows(Vec::new()).is_empty());
    }
}

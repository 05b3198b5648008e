//! Stage store
//!
//! Owns every read and write of membership records. A record at a stage is
//! a partition `prefix + key` in the stage's column family holding the
//! canonical blob plus the stage's projected columns.
//!
//! Read-modify-write cycles take no lock: two concurrent updates of the same
//! record both read, both rewrite the full record, and the later write
//! timestamp wins every column. The earlier change is lost.

use super::codec::{self, FieldKind, ProjectedField, CANONICAL_COLUMN};
use super::error::{MembershipError, MembershipResult};
use super::fields::FieldUpdate;
use super::models::{MemberProfile, RecordEntry, RecordKey};
use super::stage::{ListView, Stage};
use crate::backend::{Consistency, KeySlice, Mutation, MutationBatch, RangeQuery, RowFilter, StoreClient};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A record read at quorum together with the write timestamp of its blob
#[derive(Debug, Clone)]
pub(crate) struct SourceRecord {
    pub profile: MemberProfile,
    pub timestamp: i64,
}

pub struct StageStore<S> {
    client: Arc<S>,
    archive_ttl: Duration,
}

impl<S: StoreClient> StageStore<S> {
    pub fn new(client: Arc<S>, archive_ttl: Duration) -> Self {
        Self { client, archive_ttl }
    }

    pub fn client(&self) -> &S {
        &self.client
    }

    /// Store a new record under a freshly generated key
    pub async fn create(&self, stage: Stage, mut profile: MemberProfile) -> MembershipResult<RecordKey> {
        let key = RecordKey::generate();
        let now = Utc::now();
        if profile.metadata.request_timestamp.is_none() {
            profile.metadata.request_timestamp = Some(unix_seconds(now));
        }

        let mut batch = MutationBatch::new();
        self.write_record(&mut batch, stage, &key, &profile, write_timestamp(now))?;
        self.client
            .batch_mutate(batch, Consistency::Quorum)
            .await
            .map_err(|e| MembershipError::store("create", stage, key.to_string(), e))?;

        info!(%stage, %key, "Created record");
        Ok(key)
    }

    pub async fn fetch(&self, stage: Stage, key: &RecordKey) -> MembershipResult<MemberProfile> {
        self.read_canonical(stage, key, Consistency::One, "fetch")
            .await
            .map(|source| source.profile)
    }

    /// Quorum read used ahead of any rewrite or move
    pub(crate) async fn read_for_update(
        &self,
        stage: Stage,
        key: &RecordKey,
        operation: &'static str,
    ) -> MembershipResult<SourceRecord> {
        self.read_canonical(stage, key, Consistency::Quorum, operation).await
    }

    async fn read_canonical(
        &self,
        stage: Stage,
        key: &RecordKey,
        consistency: Consistency,
        operation: &'static str,
    ) -> MembershipResult<SourceRecord> {
        let partition = stage.partition_key(key);
        let cell = self
            .client
            .get(&partition, stage.family(), CANONICAL_COLUMN, consistency)
            .await
            .map_err(|e| MembershipError::store(operation, stage, key.to_string(), e))?
            .ok_or_else(|| MembershipError::NotFound {
                stage,
                key: key.to_string(),
            })?;

        if cell.name != CANONICAL_COLUMN {
            return Err(MembershipError::UnexpectedColumn {
                stage,
                key: key.to_string(),
                column: cell.name,
            });
        }

        let profile = codec::decode(&cell.value)
            .map_err(|e| MembershipError::from_codec(e, stage, key.to_string()))?;
        Ok(SourceRecord {
            profile,
            timestamp: cell.timestamp,
        })
    }

    /// Equality lookup on a projected column. The column is expected to be
    /// unique within the stage; a second match is an error.
    pub async fn fetch_by_projected_field(
        &self,
        stage: Stage,
        field: ProjectedField,
        value: &str,
    ) -> MembershipResult<RecordEntry> {
        if !stage.projection().contains(&field) {
            return Err(MembershipError::NotProjected {
                stage,
                field: field.column(),
            });
        }
        let needle = lookup_value(field, value)?;
        let label = format!("{}={}", field, value);

        let query = RangeQuery {
            family: stage.family().to_string(),
            start: stage.prefix().as_bytes().to_vec(),
            end: stage.end_key().as_bytes().to_vec(),
            columns: vec![CANONICAL_COLUMN.to_string()],
            filter: Some(RowFilter::Equals {
                column: field.column().to_string(),
                value: needle,
            }),
            limit: 2,
        };
        let rows = self
            .client
            .range_scan(&query, Consistency::One)
            .await
            .map_err(|e| MembershipError::store("fetch_by_projected_field", stage, label.clone(), e))?;

        let mut matches = rows.into_iter().filter(|row| !row.columns.is_empty());
        let first = matches.next().ok_or_else(|| MembershipError::NotFound {
            stage,
            key: label.clone(),
        })?;
        if matches.next().is_some() {
            return Err(MembershipError::AmbiguousResult {
                stage,
                field: field.column(),
                value: value.to_string(),
            });
        }
        decode_row(stage, ListView::Canonical, first)
    }

    pub async fn update_field(
        &self,
        stage: Stage,
        key: &RecordKey,
        update: FieldUpdate,
    ) -> MembershipResult<()> {
        self.update_fields(stage, key, std::slice::from_ref(&update)).await
    }

    /// Apply several field updates in one read-modify-write cycle
    pub async fn update_fields(
        &self,
        stage: Stage,
        key: &RecordKey,
        updates: &[FieldUpdate],
    ) -> MembershipResult<()> {
        if !stage.accepts_updates() {
            return Err(MembershipError::PreconditionFailed {
                stage,
                key: key.to_string(),
                reason: format!("{} records are read-only", stage),
            });
        }
        if updates.is_empty() {
            return Ok(());
        }

        let mut source = self.read_for_update(stage, key, "update_fields").await?;
        for update in updates {
            update.apply(&mut source.profile, key)?;
        }
        self.rewrite(stage, key, &source, "update_fields").await?;

        debug!(
            %stage,
            %key,
            fields = ?updates.iter().map(|u| u.field_name()).collect::<Vec<_>>(),
            "Updated record"
        );
        Ok(())
    }

    /// Store the signed agreement scan of an application
    pub async fn attach_agreement(&self, key: &RecordKey, pdf: Vec<u8>) -> MembershipResult<()> {
        let stage = Stage::Application;
        if pdf.is_empty() {
            return Err(MembershipError::PreconditionFailed {
                stage,
                key: key.to_string(),
                reason: "agreement scan is empty".to_string(),
            });
        }

        let mut source = self.read_for_update(stage, key, "attach_agreement").await?;
        let size = pdf.len();
        source.profile.agreement_pdf = Some(pdf);
        self.rewrite(stage, key, &source, "attach_agreement").await?;

        info!(%key, size, "Attached membership agreement");
        Ok(())
    }

    /// Page through a stage in ascending key order, starting strictly after
    /// `cursor`. Rows left with no columns by a move are skipped.
    pub async fn enumerate(
        &self,
        stage: Stage,
        cursor: Option<&RecordKey>,
        page_size: usize,
    ) -> MembershipResult<Vec<RecordEntry>> {
        let mut entries = Vec::with_capacity(page_size);
        if page_size == 0 {
            return Ok(entries);
        }

        let view = stage.list_view();
        // The canonical column is always read so that a live record whose
        // list fields are all absent is not taken for a moved one
        let columns: Vec<String> = match view {
            ListView::Projected(fields) => std::iter::once(CANONICAL_COLUMN)
                .chain(fields.iter().map(|f| f.column()))
                .map(String::from)
                .collect(),
            ListView::Canonical => vec![CANONICAL_COLUMN.to_string()],
        };
        let mut start = match cursor {
            Some(key) => successor(&stage.partition_key(key)),
            None => stage.prefix().as_bytes().to_vec(),
        };
        let cursor_label = cursor.map(|k| k.to_string()).unwrap_or_default();

        loop {
            let wanted = page_size - entries.len();
            let query = RangeQuery {
                family: stage.family().to_string(),
                start: start.clone(),
                end: stage.end_key().as_bytes().to_vec(),
                columns: columns.clone(),
                filter: None,
                limit: wanted,
            };
            let rows = self
                .client
                .range_scan(&query, Consistency::One)
                .await
                .map_err(|e| MembershipError::store("enumerate", stage, cursor_label.clone(), e))?;

            let exhausted = rows.len() < wanted;
            for row in rows {
                start = successor(&row.key);
                if row.columns.is_empty() {
                    continue;
                }
                entries.push(decode_row(stage, view, row)?);
            }
            if exhausted || entries.len() >= page_size {
                break;
            }
        }

        debug!(%stage, cursor = %cursor_label, count = entries.len(), "Enumerated records");
        Ok(entries)
    }

    /// Queue the complete write of a record at `stage`: canonical blob,
    /// mirror copies and the full projection set, all at `timestamp`.
    /// Projected fields that are absent are deleted at the same timestamp.
    pub(crate) fn write_record(
        &self,
        batch: &mut MutationBatch,
        stage: Stage,
        key: &RecordKey,
        profile: &MemberProfile,
        timestamp: i64,
    ) -> MembershipResult<()> {
        let blob = codec::encode(profile)
            .map_err(|e| MembershipError::from_codec(e, stage, key.to_string()))?;
        let partition = stage.partition_key(key);
        let ttl = stage.expires().then_some(self.archive_ttl);

        for family in std::iter::once(stage.family()).chain(stage.mirror_families().iter().copied()) {
            batch.push(
                &partition,
                family,
                Mutation::Insert {
                    column: CANONICAL_COLUMN.to_string(),
                    value: blob.clone(),
                    timestamp,
                    ttl,
                },
            );
        }

        let projected = codec::project_columns(profile, stage.projection());
        let cleared: Vec<String> = stage
            .projection()
            .iter()
            .map(|f| f.column())
            .filter(|column| !projected.iter().any(|(c, _)| c == column))
            .map(String::from)
            .collect();

        for (column, value) in projected {
            batch.push(
                &partition,
                stage.family(),
                Mutation::Insert {
                    column: column.to_string(),
                    value,
                    timestamp,
                    ttl,
                },
            );
        }
        if !cleared.is_empty() {
            batch.push(
                &partition,
                stage.family(),
                Mutation::Delete {
                    columns: cleared,
                    timestamp,
                },
            );
        }
        Ok(())
    }

    /// Queue deletion of every known column of a record at `stage`, in the
    /// primary family and all mirrors
    pub(crate) fn delete_record(
        &self,
        batch: &mut MutationBatch,
        stage: Stage,
        key: &RecordKey,
        timestamp: i64,
    ) {
        let partition = stage.partition_key(key);
        let columns = codec::known_columns();
        for family in std::iter::once(stage.family()).chain(stage.mirror_families().iter().copied()) {
            batch.push(
                &partition,
                family,
                Mutation::Delete {
                    columns: columns.clone(),
                    timestamp,
                },
            );
        }
    }

    async fn rewrite(
        &self,
        stage: Stage,
        key: &RecordKey,
        source: &SourceRecord,
        operation: &'static str,
    ) -> MembershipResult<()> {
        let timestamp = next_timestamp(source.timestamp);
        let mut batch = MutationBatch::new();
        self.write_record(&mut batch, stage, key, &source.profile, timestamp)?;
        self.client
            .atomic_batch_mutate(batch, Consistency::Quorum)
            .await
            .map_err(|e| MembershipError::store(operation, stage, key.to_string(), e))
    }
}

fn decode_row(stage: Stage, view: ListView, row: KeySlice) -> MembershipResult<RecordEntry> {
    let key = stage.record_key(&row.key).ok_or_else(|| MembershipError::Corruption {
        stage,
        key: String::from_utf8_lossy(&row.key).into_owned(),
        reason: "malformed row key".to_string(),
    })?;
    let profile = match view {
        ListView::Projected(fields) => codec::decode_projection(&row.columns, fields),
        ListView::Canonical => codec::decode_canonical_cells(&row.columns),
    }
    .map_err(|e| MembershipError::from_codec(e, stage, key.to_string()))?;
    Ok(RecordEntry { key, profile })
}

fn lookup_value(field: ProjectedField, value: &str) -> MembershipResult<Vec<u8>> {
    match field.kind() {
        FieldKind::Text | FieldKind::Bytes => Ok(value.as_bytes().to_vec()),
        FieldKind::Integer => value
            .trim()
            .parse::<u64>()
            .map(|n| n.to_be_bytes().to_vec())
            .map_err(|e| MembershipError::InvalidValue {
                field: field.column(),
                reason: e.to_string(),
            }),
        FieldKind::Flag => match value.trim() {
            "true" | "1" => Ok(vec![1]),
            "false" | "0" => Ok(vec![0]),
            other => Err(MembershipError::InvalidValue {
                field: field.column(),
                reason: format!("'{}' is not a boolean", other),
            }),
        },
    }
}

/// Smallest key strictly greater than `key`
fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// Write timestamp in nanoseconds since the epoch
pub(crate) fn write_timestamp(now: DateTime<Utc>) -> i64 {
    now.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Write timestamp for a rewrite of data read at `read_timestamp`
pub(crate) fn next_timestamp(read_timestamp: i64) -> i64 {
    write_timestamp(Utc::now()).max(read_timestamp.saturating_add(1))
}

pub(crate) fn unix_seconds(now: DateTime<Utc>) -> u64 {
    u64::try_from(now.timestamp()).unwrap_or(0)
}

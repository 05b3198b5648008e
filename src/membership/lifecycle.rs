//! Lifecycle manager
//!
//! Sequences the allowed stage transitions. Every transition is one atomic
//! batch: the record written at its destination and every known column
//! deleted at its source, the delete stamped with the write timestamp read
//! from the source. A write that lands on the source after that read keeps
//! its columns.

use super::error::{MembershipError, MembershipResult};
use super::models::{MemberProfile, RecordKey};
use super::stage::Stage;
use super::store::{next_timestamp, unix_seconds, StageStore};
use crate::backend::{Consistency, MutationBatch, StoreClient};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Allowed stage transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Application -> Queued
    Approve,
    /// Application -> Archived
    Reject,
    /// Queued -> Archived
    TrashQueued,
    /// Member -> Dequeued
    TrashMember,
}

impl Transition {
    pub const ALL: [Transition; 4] = [
        Transition::Approve,
        Transition::Reject,
        Transition::TrashQueued,
        Transition::TrashMember,
    ];

    pub fn from(&self) -> Stage {
        match self {
            Transition::Approve | Transition::Reject => Stage::Application,
            Transition::TrashQueued => Stage::Queued,
            Transition::TrashMember => Stage::Member,
        }
    }

    pub fn to(&self) -> Stage {
        match self {
            Transition::Approve => Stage::Queued,
            Transition::Reject | Transition::TrashQueued => Stage::Archived,
            Transition::TrashMember => Stage::Dequeued,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transition::Approve => "approve",
            Transition::Reject => "reject",
            Transition::TrashQueued => "trash_queued",
            Transition::TrashMember => "trash_member",
        }
    }

    fn check(&self, profile: &MemberProfile) -> Result<(), String> {
        match self {
            Transition::Approve if !profile.has_agreement() => {
                Err("no signed membership agreement attached".to_string())
            }
            _ => Ok(()),
        }
    }

    fn annotate(&self, profile: &mut MemberProfile, initiator: &str, reason: &str, now: DateTime<Utc>) {
        let metadata = &mut profile.metadata;
        match self {
            Transition::Approve | Transition::Reject | Transition::TrashQueued => {
                metadata.approver_uid = Some(initiator.to_string());
                metadata.approval_timestamp = Some(unix_seconds(now));
            }
            Transition::TrashMember => {
                metadata.goodbye_initiator = Some(initiator.to_string());
                metadata.goodbye_timestamp = Some(unix_seconds(now));
                metadata.goodbye_reason = Some(reason.to_string());
            }
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from(), self.to())
    }
}

/// Outcome of a completed transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionReceipt {
    pub key: RecordKey,
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
}

pub struct LifecycleManager<S> {
    store: Arc<StageStore<S>>,
}

impl<S: StoreClient> LifecycleManager<S> {
    pub fn new(store: Arc<StageStore<S>>) -> Self {
        Self { store }
    }

    #[cfg(test)]
    pub fn store(&self) -> &StageStore<S> {
        &self.store
    }

    /// Application -> Queued; requires a signed agreement
    pub async fn approve_application(
        &self,
        key: &RecordKey,
        initiator: &str,
    ) -> MembershipResult<TransitionReceipt> {
        self.transition(Transition::Approve, key, initiator, "").await
    }

    /// Application -> Archived
    pub async fn reject_application(
        &self,
        key: &RecordKey,
        initiator: &str,
    ) -> MembershipResult<TransitionReceipt> {
        self.transition(Transition::Reject, key, initiator, "").await
    }

    /// Queued -> Archived
    pub async fn trash_queued(
        &self,
        key: &RecordKey,
        initiator: &str,
    ) -> MembershipResult<TransitionReceipt> {
        self.transition(Transition::TrashQueued, key, initiator, "").await
    }

    /// Member -> Dequeued. The member row is emptied in place and never
    /// reused; the record continues under the same key in the dequeue
    /// namespace.
    pub async fn trash_member(
        &self,
        key: &RecordKey,
        initiator: &str,
        reason: &str,
    ) -> MembershipResult<TransitionReceipt> {
        self.transition(Transition::TrashMember, key, initiator, reason).await
    }

    pub async fn transition(
        &self,
        edge: Transition,
        key: &RecordKey,
        initiator: &str,
        reason: &str,
    ) -> MembershipResult<TransitionReceipt> {
        let (from, to) = (edge.from(), edge.to());
        if initiator.trim().is_empty() {
            return Err(MembershipError::PreconditionFailed {
                stage: from,
                key: key.to_string(),
                reason: "initiator must not be empty".to_string(),
            });
        }

        let mut source = self.store.read_for_update(from, key, edge.name()).await?;
        if let Err(reason) = edge.check(&source.profile) {
            warn!(%key, %from, %to, reason = %reason, "Transition refused");
            return Err(MembershipError::PreconditionFailed {
                stage: from,
                key: key.to_string(),
                reason,
            });
        }

        let now = Utc::now();
        edge.annotate(&mut source.profile, initiator, reason, now);

        let mut batch = MutationBatch::new();
        self.store
            .write_record(&mut batch, to, key, &source.profile, next_timestamp(source.timestamp))?;
        self.store.delete_record(&mut batch, from, key, source.timestamp);

        self.store
            .client()
            .atomic_batch_mutate(batch, Consistency::Quorum)
            .await
            .map_err(|e| MembershipError::TransitionFailed {
                from,
                to,
                key: key.to_string(),
                source: e,
            })?;

        info!(%key, %from, %to, initiator, "Moved record");
        Ok(TransitionReceipt {
            key: *key,
            from,
            to,
            at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::membership::codec::CANONICAL_COLUMN;
    use crate::membership::fields::FieldUpdate;
    use crate::membership::store::tests::{applicant, store, ARCHIVE_TTL};
    use pretty_assertions::assert_eq;

    fn manager() -> (MemoryStore, LifecycleManager<MemoryStore>) {
        let (memory, stages) = store();
        (memory, LifecycleManager::new(Arc::new(stages)))
    }

    async fn live_rows(memory: &MemoryStore, stage: Stage, key: &RecordKey) -> bool {
        memory
            .get(&stage.partition_key(key), stage.family(), CANONICAL_COLUMN, Consistency::One)
            .await
            .unwrap()
            .is_some()
    }

    #[tokio::test]
    async fn test_ada_is_approved_into_the_queue() {
        let (_, lifecycle) = manager();
        let stages = lifecycle.store();
        let key = stages.create(Stage::Application, applicant("Ada", 20)).await.unwrap();
        stages.attach_agreement(&key, b"%PDF-1.4 signed".to_vec()).await.unwrap();

        let receipt = lifecycle.approve_application(&key, "admin1").await.unwrap();
        assert_eq!((receipt.key, receipt.from, receipt.to), (key, Stage::Application, Stage::Queued));

        let queued = stages.fetch(Stage::Queued, &key).await.unwrap();
        assert_eq!(queued.metadata.approver_uid.as_deref(), Some("admin1"));
        assert!(queued.metadata.approval_timestamp.is_some());
        assert_eq!(queued.member.name.as_deref(), Some("Ada"));
        assert_eq!(queued.member.fee, Some(20));
        assert_eq!(queued.member.fee_yearly, Some(false));
        assert!(matches!(
            stages.fetch(Stage::Application, &key).await,
            Err(MembershipError::NotFound { .. })
        ));
        assert!(stages.enumerate(Stage::Application, None, 10).await.unwrap().is_empty());

        // No way back
        assert!(matches!(
            lifecycle.approve_application(&key, "admin1").await,
            Err(MembershipError::NotFound { stage: Stage::Application, .. })
        ));
    }

    #[tokio::test]
    async fn test_approval_without_agreement_changes_nothing() {
        let (memory, lifecycle) = manager();
        let stages = lifecycle.store();
        let profile = applicant("Ada", 20);
        let key = stages.create(Stage::Application, profile.clone()).await.unwrap();
        let before = memory.mutation_calls();

        let err = lifecycle.approve_application(&key, "admin1").await.unwrap_err();
        assert!(matches!(err, MembershipError::PreconditionFailed { stage: Stage::Application, .. }));
        assert_eq!(memory.mutation_calls(), before);
        assert_eq!(stages.fetch(Stage::Application, &key).await.unwrap(), profile);
        assert!(!live_rows(&memory, Stage::Queued, &key).await);
    }

    #[tokio::test]
    async fn test_empty_initiator_is_refused_before_any_store_call() {
        let (memory, lifecycle) = manager();
        let key = RecordKey::generate();
        memory.fail_next(1);

        let err = lifecycle.reject_application(&key, " ").await.unwrap_err();
        assert!(matches!(err, MembershipError::PreconditionFailed { .. }));
        // The injected failure was never consumed
        assert!(memory.get(b"x", "application", "pb_data", Consistency::One).await.is_err());
    }

    #[tokio::test]
    async fn test_rejection_archives_with_expiry() {
        let (memory, lifecycle) = manager();
        let stages = lifecycle.store();
        let key = stages.create(Stage::Application, applicant("Ada", 20)).await.unwrap();

        let before = Utc::now();
        lifecycle.reject_application(&key, "admin2").await.unwrap();

        let archived = stages.fetch(Stage::Archived, &key).await.unwrap();
        assert_eq!(archived.metadata.approver_uid.as_deref(), Some("admin2"));
        assert!(!live_rows(&memory, Stage::Application, &key).await);

        let expiry = memory
            .cell_expiry(&Stage::Archived.partition_key(&key), "membership_archive", CANONICAL_COLUMN)
            .await
            .unwrap();
        let ttl = chrono::Duration::from_std(ARCHIVE_TTL).unwrap();
        assert!(expiry >= before + ttl);
        assert!(expiry <= Utc::now() + ttl);
    }

    #[tokio::test]
    async fn test_trash_queued() {
        let (memory, lifecycle) = manager();
        let stages = lifecycle.store();
        let key = stages.create(Stage::Queued, applicant("Ada", 20)).await.unwrap();

        let receipt = lifecycle.trash_queued(&key, "admin1").await.unwrap();
        assert_eq!(receipt.to, Stage::Archived);
        assert!(!live_rows(&memory, Stage::Queued, &key).await);
        assert!(stages.enumerate(Stage::Queued, None, 10).await.unwrap().is_empty());
        assert_eq!(stages.enumerate(Stage::Archived, None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trash_member_empties_member_and_mirror_rows() {
        let (memory, lifecycle) = manager();
        let stages = lifecycle.store();
        let mut profile = applicant("Ada", 20);
        profile.member.username = Some("ada".to_string());
        let key = stages.create(Stage::Member, profile).await.unwrap();

        lifecycle.trash_member(&key, "admin1", "moved away").await.unwrap();

        let gone = stages.fetch(Stage::Dequeued, &key).await.unwrap();
        assert_eq!(gone.metadata.goodbye_initiator.as_deref(), Some("admin1"));
        assert_eq!(gone.metadata.goodbye_reason.as_deref(), Some("moved away"));
        assert!(gone.metadata.goodbye_timestamp.is_some());
        assert_eq!(gone.metadata.approver_uid, None);

        let partition = Stage::Member.partition_key(&key);
        for column in ["pb_data", "name", "username", "fee"] {
            assert!(memory.get(&partition, "members", column, Consistency::One).await.unwrap().is_none());
        }
        assert!(memory
            .get(&partition, "member_agreements", "pb_data", Consistency::One)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            stages.fetch_by_projected_field(Stage::Member, crate::membership::ProjectedField::Username, "ada").await,
            Err(MembershipError::NotFound { .. })
        ));
        assert!(stages.enumerate(Stage::Member, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_source_stage_is_not_found() {
        let (_, lifecycle) = manager();
        let key = lifecycle.store().create(Stage::Queued, applicant("Ada", 20)).await.unwrap();
        assert!(matches!(
            lifecycle.trash_member(&key, "admin1", "n/a").await,
            Err(MembershipError::NotFound { stage: Stage::Member, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_source_intact() {
        let (memory, lifecycle) = manager();
        let stages = lifecycle.store();
        let key = stages.create(Stage::Queued, applicant("Ada", 20)).await.unwrap();

        let before = stages.fetch(Stage::Queued, &key).await.unwrap();

        memory.fail_next_mutation(1);
        let err = lifecycle.trash_queued(&key, "admin1").await.unwrap_err();
        assert!(matches!(
            err,
            MembershipError::TransitionFailed { from: Stage::Queued, to: Stage::Archived, .. }
        ));
        assert!(err.is_store_failure());

        assert_eq!(stages.fetch(Stage::Queued, &key).await.unwrap(), before);
        assert!(!live_rows(&memory, Stage::Archived, &key).await);
    }

    #[tokio::test]
    async fn test_failed_source_read_is_store_unavailable() {
        let (memory, lifecycle) = manager();
        let key = lifecycle.store().create(Stage::Queued, applicant("Ada", 20)).await.unwrap();

        memory.fail_next(1);
        assert!(matches!(
            lifecycle.trash_queued(&key, "admin1").await,
            Err(MembershipError::StoreUnavailable { operation: "trash_queued", stage: Stage::Queued, .. })
        ));
    }

    #[tokio::test]
    async fn test_write_after_source_read_survives_the_move() {
        let (memory, lifecycle) = manager();
        let stages = lifecycle.store();
        let key = stages.create(Stage::Member, applicant("Ada", 20)).await.unwrap();
        let source = stages.read_for_update(Stage::Member, &key, "fetch").await.unwrap();

        // A rewrite lands after the read...
        stages.update_field(Stage::Member, &key, FieldUpdate::Fee(30)).await.unwrap();

        // ...and the move's delete, stamped with the older read, cannot remove it
        let mut batch = MutationBatch::new();
        stages.delete_record(&mut batch, Stage::Member, &key, source.timestamp);
        memory.atomic_batch_mutate(batch, Consistency::Quorum).await.unwrap();

        assert_eq!(stages.fetch(Stage::Member, &key).await.unwrap().member.fee, Some(30));
    }

    #[test]
    fn test_transition_edges() {
        let edges: Vec<_> = Transition::ALL.iter().map(|t| (t.from(), t.to())).collect();
        assert_eq!(
            edges,
            vec![
                (Stage::Application, Stage::Queued),
                (Stage::Application, Stage::Archived),
                (Stage::Queued, Stage::Archived),
                (Stage::Member, Stage::Dequeued),
            ]
        );
    }
}

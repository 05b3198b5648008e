//! Membership error taxonomy
//!
//! Every variant carries enough context (stage, key, operation) for the
//! caller to tell a user-facing precondition apart from a store failure.

use super::codec::CodecError;
use super::stage::Stage;
use crate::backend::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("No {stage} record {key}")]
    NotFound { stage: Stage, key: String },

    #[error("Corrupt {stage} record {key}: {reason}")]
    Corruption {
        stage: Stage,
        key: String,
        reason: String,
    },

    #[error("Store returned undeclared column '{column}' for {stage} record {key}")]
    UnexpectedColumn {
        stage: Stage,
        key: String,
        column: String,
    },

    #[error("Unknown field '{0}'")]
    UnknownField(String),

    #[error("Invalid value for field '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Field '{field}' of record {key} is already set")]
    ImmutableField { field: &'static str, key: String },

    #[error("Precondition failed for {stage} record {key}: {reason}")]
    PreconditionFailed {
        stage: Stage,
        key: String,
        reason: String,
    },

    #[error("Store unavailable during {operation} on {stage} record {key}: {source}")]
    StoreUnavailable {
        operation: &'static str,
        stage: Stage,
        key: String,
        #[source]
        source: BackendError,
    },

    #[error("Moving record {key} from {from} to {to} failed: {source}")]
    TransitionFailed {
        from: Stage,
        to: Stage,
        key: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to encode record: {0}")]
    Encoding(String),

    #[error("More than one {stage} record has {field} = '{value}'")]
    AmbiguousResult {
        stage: Stage,
        field: &'static str,
        value: String,
    },

    #[error("Field '{field}' is not queryable in {stage}")]
    NotProjected { stage: Stage, field: &'static str },

    #[error("Invalid record key '{0}'")]
    InvalidKey(String),
}

impl MembershipError {
    /// Attach stage and key context to a codec failure
    pub(crate) fn from_codec(err: CodecError, stage: Stage, key: impl Into<String>) -> Self {
        let key = key.into();
        match err {
            CodecError::Encode(e) => MembershipError::Encoding(e.to_string()),
            CodecError::Corrupt(reason) => MembershipError::Corruption { stage, key, reason },
            CodecError::UnexpectedColumn(column) => {
                MembershipError::UnexpectedColumn { stage, key, column }
            }
        }
    }

    pub(crate) fn store(
        operation: &'static str,
        stage: Stage,
        key: impl Into<String>,
        source: BackendError,
    ) -> Self {
        MembershipError::StoreUnavailable {
            operation,
            stage,
            key: key.into(),
            source,
        }
    }

    /// Short reason tag used for counters and log fields
    pub fn reason(&self) -> &'static str {
        match self {
            MembershipError::NotFound { .. } => "not-found",
            MembershipError::Corruption { .. } => "corruption",
            MembershipError::UnexpectedColumn { .. } => "unexpected-column",
            MembershipError::UnknownField(_) => "unknown-field",
            MembershipError::InvalidValue { .. } => "invalid-value",
            MembershipError::ImmutableField { .. } => "immutable-field",
            MembershipError::PreconditionFailed { .. } => "precondition-failed",
            MembershipError::StoreUnavailable { .. } => "store-unavailable",
            MembershipError::TransitionFailed { .. } => "transition-failed",
            MembershipError::Encoding(_) => "encoding",
            MembershipError::AmbiguousResult { .. } => "ambiguous-result",
            MembershipError::NotProjected { .. } => "not-projected",
            MembershipError::InvalidKey(_) => "invalid-key",
        }
    }

    /// Whether the error came from the store rather than the request
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            MembershipError::StoreUnavailable { .. } | MembershipError::TransitionFailed { .. }
        )
    }
}

pub type MembershipResult<T> = Result<T, MembershipError>;

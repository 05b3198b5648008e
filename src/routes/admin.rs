//! Administrative route handlers
//!
//! Listing, lookup, field updates and stage transitions.

use crate::error::{bad_request, validation_error, ApiResult};
use crate::membership::{
    FieldUpdate, MembershipResult, ProjectedField, RecordEntry, RecordKey, Stage, Transition,
    TransitionReceipt,
};
use crate::metrics;
use crate::models::{ListQuery, PageResponse, SuccessResponse, TransitionRequest, UpdateFieldRequest};
use crate::state::SharedState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Extension, Json,
};
use tracing::{debug, info};
use validator::Validate;

/// List one page of a stage
pub async fn list_records(
    State(state): State<SharedState>,
    Extension(stage): Extension<Stage>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<SuccessResponse<PageResponse>>> {
    let cursor = match query.cursor.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(c) => Some(RecordKey::parse(c)?),
    };
    let page_size = query.page_size();
    debug!(%stage, ?cursor, page_size, "Listing records");

    let records = state.stages.enumerate(stage, cursor.as_ref(), page_size).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Found {} {} records.", records.len(), stage),
        PageResponse::new(records, page_size),
    )))
}

/// Fetch one record
pub async fn get_record(
    State(state): State<SharedState>,
    Extension(stage): Extension<Stage>,
    Path(key): Path<String>,
) -> ApiResult<Json<SuccessResponse<RecordEntry>>> {
    let key = RecordKey::parse(&key)?;
    let profile = state.stages.fetch(stage, &key).await?;

    Ok(Json(SuccessResponse::with_data(
        "Record retrieved.",
        RecordEntry { key, profile },
    )))
}

/// Find a member by username
pub async fn get_member_by_username(
    State(state): State<SharedState>,
    Path(username): Path<String>,
) -> ApiResult<Json<SuccessResponse<RecordEntry>>> {
    let username = username.trim().to_lowercase();
    if username.is_empty() {
        return Err(bad_request("Username is required"));
    }

    let entry = state
        .stages
        .fetch_by_projected_field(Stage::Member, ProjectedField::Username, &username)
        .await?;

    Ok(Json(SuccessResponse::with_data("Member found.", entry)))
}

/// Change one field of a record
pub async fn update_record(
    State(state): State<SharedState>,
    Extension(stage): Extension<Stage>,
    Path(key): Path<String>,
    Json(payload): Json<UpdateFieldRequest>,
) -> ApiResult<Json<SuccessResponse<()>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    let key = RecordKey::parse(&key)?;
    let update = FieldUpdate::parse(&payload.field, &payload.value)?;

    state.stages.update_field(stage, &key, update).await?;

    info!(%stage, %key, field = %payload.field, "Record updated");
    Ok(Json(SuccessResponse::message_only(format!(
        "Field '{}' updated.",
        payload.field
    ))))
}

/// Upload the signed agreement scan of an application
pub async fn attach_agreement(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    body: Bytes,
) -> ApiResult<Json<SuccessResponse<()>>> {
    let key = RecordKey::parse(&key)?;
    state.stages.attach_agreement(&key, body.to_vec()).await?;

    Ok(Json(SuccessResponse::message_only("Agreement attached.")))
}

pub async fn approve_application(
    state: State<SharedState>,
    key: Path<String>,
    payload: Json<TransitionRequest>,
) -> ApiResult<Json<SuccessResponse<TransitionReceipt>>> {
    run_transition(Transition::Approve, state, key, payload).await
}

pub async fn reject_application(
    state: State<SharedState>,
    key: Path<String>,
    payload: Json<TransitionRequest>,
) -> ApiResult<Json<SuccessResponse<TransitionReceipt>>> {
    run_transition(Transition::Reject, state, key, payload).await
}

pub async fn trash_queued(
    state: State<SharedState>,
    key: Path<String>,
    payload: Json<TransitionRequest>,
) -> ApiResult<Json<SuccessResponse<TransitionReceipt>>> {
    run_transition(Transition::TrashQueued, state, key, payload).await
}

pub async fn trash_member(
    state: State<SharedState>,
    key: Path<String>,
    payload: Json<TransitionRequest>,
) -> ApiResult<Json<SuccessResponse<TransitionReceipt>>> {
    run_transition(Transition::TrashMember, state, key, payload).await
}

async fn run_transition(
    edge: Transition,
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Json(payload): Json<TransitionRequest>,
) -> ApiResult<Json<SuccessResponse<TransitionReceipt>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    let key = RecordKey::parse(&key)?;
    let reason = payload.reason.as_deref().unwrap_or("");

    let receipt = dispatch(&state, edge, &key, &payload.initiator, reason).await?;
    metrics::record_transition(edge);

    Ok(Json(SuccessResponse::with_data(
        format!("Record moved from {} to {}.", receipt.from, receipt.to),
        receipt,
    )))
}

async fn dispatch(
    state: &SharedState,
    edge: Transition,
    key: &RecordKey,
    initiator: &str,
    reason: &str,
) -> MembershipResult<TransitionReceipt> {
    let lifecycle = &state.lifecycle;
    match edge {
        Transition::Approve => lifecycle.approve_application(key, initiator).await,
        Transition::Reject => lifecycle.reject_application(key, initiator).await,
        Transition::TrashQueued => lifecycle.trash_queued(key, initiator).await,
        Transition::TrashMember => lifecycle.trash_member(key, initiator, reason).await,
    }
}

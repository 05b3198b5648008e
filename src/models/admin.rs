//! Administrative request/response DTOs

use crate::membership::{RecordEntry, RecordKey};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Default page size for listings
pub const DEFAULT_PAGE_SIZE: usize = 25;
/// Upper bound on a requested page size
pub const MAX_PAGE_SIZE: usize = 500;

/// Query parameters for `GET /api/{stage}`
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Key of the last entry of the previous page; empty for the first page
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of records
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse {
    pub records: Vec<RecordEntry>,
    /// Cursor for the following page; absent on a short page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<RecordKey>,
}

impl PageResponse {
    pub fn new(records: Vec<RecordEntry>, page_size: usize) -> Self {
        let next_cursor = if records.len() == page_size {
            records.last().map(|e| e.key)
        } else {
            None
        };
        Self {
            records,
            next_cursor,
        }
    }
}

/// `PATCH /api/{stage}/{key}`
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateFieldRequest {
    #[validate(length(min = 1, message = "Field name is required"))]
    pub field: String,
    pub value: String,
}

/// Body of every transition call
#[derive(Debug, Deserialize, Validate)]
pub struct TransitionRequest {
    #[validate(length(min = 1, max = 255, message = "Initiator is required"))]
    pub initiator: String,
    #[serde(default)]
    pub reason: Option<String>,
}

//! Process-wide counters
//!
//! Initialised at startup and kept for the lifetime of the process.
//! Exposed read-only through `GET /status`.

use crate::membership::Transition;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

struct Counters {
    started_at: DateTime<Utc>,
    requests: AtomicU64,
    submitted: AtomicU64,
    store_failures: AtomicU64,
    submit_errors: Mutex<BTreeMap<String, u64>>,
    transitions: Mutex<BTreeMap<&'static str, u64>>,
}

static COUNTERS: Lazy<Counters> = Lazy::new(|| Counters {
    started_at: Utc::now(),
    requests: AtomicU64::new(0),
    submitted: AtomicU64::new(0),
    store_failures: AtomicU64::new(0),
    submit_errors: Mutex::new(BTreeMap::new()),
    transitions: Mutex::new(BTreeMap::new()),
});

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub requests: u64,
    pub submitted: u64,
    pub store_failures: u64,
    pub submit_errors: BTreeMap<String, u64>,
    pub transitions: BTreeMap<&'static str, u64>,
}

pub fn init() {
    Lazy::force(&COUNTERS);
}

pub fn record_request() {
    COUNTERS.requests.fetch_add(1, Ordering::Relaxed);
}

pub fn record_submission() {
    COUNTERS.submitted.fetch_add(1, Ordering::Relaxed);
}

pub fn record_store_failure() {
    COUNTERS.store_failures.fetch_add(1, Ordering::Relaxed);
}

pub fn record_submit_error(reason: &str) {
    let mut errors = COUNTERS
        .submit_errors
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *errors.entry(reason.to_string()).or_insert(0) += 1;
}

pub fn record_transition(transition: Transition) {
    let mut transitions = COUNTERS
        .transitions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *transitions.entry(transition.name()).or_insert(0) += 1;
}

pub fn snapshot() -> MetricsSnapshot {
    let submit_errors = COUNTERS
        .submit_errors
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    let transitions = COUNTERS
        .transitions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();

    MetricsSnapshot {
        started_at: COUNTERS.started_at,
        requests: COUNTERS.requests.load(Ordering::Relaxed),
        submitted: COUNTERS.submitted.load(Ordering::Relaxed),
        store_failures: COUNTERS.store_failures.load(Ordering::Relaxed),
        submit_errors,
        transitions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        init();
        let before = snapshot();

        record_submit_error("no-name");
        record_submit_error("no-name");
        record_transition(Transition::Approve);
        record_submission();

        let after = snapshot();
        assert!(after.submit_errors["no-name"] >= before.submit_errors.get("no-name").copied().unwrap_or(0) + 2);
        assert!(after.transitions["approve"] >= 1);
        assert!(after.submitted > before.submitted);
        assert_eq!(after.started_at, before.started_at);
    }
}

//! Membership application intake
//!
//! Public endpoint behind the sign-up form.

use crate::error::{validation_error, ApiResult};
use crate::membership::Stage;
use crate::metrics;
use crate::models::{ApplicationCreated, ApplicationRequest, SuccessResponse};
use crate::password::hash_password_blocking;
use crate::state::SharedState;
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

const REAL_IP_HEADER: &str = "x-real-ip";

/// Store a new membership application
pub async fn submit_application(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<ApplicationRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<ApplicationCreated>>)> {
    debug!("Application submitted by {}", payload.email);

    let problems = payload.problems();
    if !problems.is_empty() {
        for problem in &problems {
            metrics::record_submit_error(&problem.reason);
        }
        warn!(count = problems.len(), "Application rejected");
        let message = problems
            .iter()
            .map(|p| format!("{} ({}): {}", p.field, p.reason, p.message))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(validation_error(message));
    }

    let source_ip = if state.intake.use_proxy_real_ip {
        header_value(&headers, REAL_IP_HEADER)
    } else {
        Some(peer.ip().to_string())
    };
    let user_agent = header_value(&headers, header::USER_AGENT.as_str());

    let pwhash = if payload.password.is_empty() {
        None
    } else {
        Some(hash_password_blocking(payload.password.clone()).await?)
    };

    let fee = payload.fee();
    let fee_yearly = payload.yearly;
    let profile = payload.into_profile(pwhash, source_ip, user_agent);

    let key = match state.stages.create(Stage::Application, profile).await {
        Ok(key) => key,
        Err(e) => {
            metrics::record_submit_error("store");
            return Err(e.into());
        }
    };
    metrics::record_submission();

    info!(%key, fee, fee_yearly, "Application stored");

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(
            "Application received.",
            ApplicationCreated {
                key,
                fee,
                fee_yearly,
            },
        )),
    ))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

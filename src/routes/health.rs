//! Health and version endpoints
//!
//! `/health` answers 200 whenever the process is up; whether the broker
//! has been authorized yet is reported in the body rather than the status,
//! since an unauthorized broker is still waiting for its operator.

use std::sync::Arc;

use hyper::{Response, StatusCode};
use serde::Serialize;

use super::{json_response, BoxBody};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" once authorized, "awaiting_authorization" before
    pub status: &'static str,
    pub authorized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized_at: Option<String>,
    pub version: &'static str,
    pub mode: &'static str,
}

/// GET /health
pub async fn health_check(state: Arc<AppState>) -> Response<BoxBody> {
    let session = state.broker.session();
    let authorized_at = session.authorized_at().await;
    let authorized = authorized_at.is_some();

    let response = HealthResponse {
        status: if authorized { "ok" } else { "awaiting_authorization" },
        authorized,
        authorized_at: authorized_at.map(|t| t.to_rfc3339()),
        version: env!("CARGO_PKG_VERSION"),
        mode: if state.args.dev_mode { "development" } else { "production" },
    };

    json_response(StatusCode::OK, &response)
}

/// Version information for deployment verification
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    /// Git commit hash (short)
    pub commit: &'static str,
    pub commit_full: &'static str,
    pub build_time: &'static str,
    pub service: &'static str,
}

/// GET /version
pub fn version_info() -> Response<BoxBody> {
    let response = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        commit_full: option_env!("GIT_COMMIT_FULL").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "guardian",
    };

    json_response(StatusCode::OK, &response)
}

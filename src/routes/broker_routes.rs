//! HTTP routes for the broker operations
//!
//! - POST /authorize      - Exchange a secret ID for the service token
//! - POST /login          - IdP login, enrolling the user on first login
//! - GET  /address        - Address of the caller's key (also GET /sign)
//! - POST /sign           - Sign an already-hashed digest
//!
//! Session tokens travel as `Authorization: Bearer <token>`.

use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Body;
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    bad_request_response, bearer_token, error_response, json_response, method_not_allowed, no_content,
    parse_json_body, BoxBody,
};
use crate::broker::{ResolutionError, SUPPORTED_ADDRESS_INDEX};
use crate::server::AppState;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Deserialize)]
pub struct AuthorizeRequest {
    #[serde(default)]
    pub secret_id: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub okta_username: String,
    #[serde(default)]
    pub okta_password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct SignRequest {
    #[serde(default)]
    pub raw_data: String,
    #[serde(default = "default_address_index")]
    pub address_index: i64,
}

fn default_address_index() -> i64 {
    SUPPORTED_ADDRESS_INDEX
}

#[derive(Debug, Serialize)]
pub struct AddressResponse {
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct SignResponse {
    pub signature: String,
    pub address: String,
}

const BROKER_PATHS: [&str; 4] = ["/authorize", "/login", "/address", "/sign"];

pub fn is_broker_path(path: &str) -> bool {
    BROKER_PATHS.contains(&path)
}

// =============================================================================
// Route Handlers
// =============================================================================

/// POST /authorize
async fn handle_authorize<B>(req: Request<B>, state: Arc<AppState>) -> Response<BoxBody>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body: AuthorizeRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => return bad_request_response(format!("Invalid JSON body: {e}")),
    };

    match state.broker.authorize(&body.secret_id).await {
        Ok(()) => no_content(),
        Err(e) => error_response(&e),
    }
}

/// POST /login
///
/// Flow:
/// 1. IdP checks the credentials
/// 2. Users missing from the directory are enrolled (keypair + record)
/// 3. The IdP session token is returned
async fn handle_login<B>(req: Request<B>, state: Arc<AppState>) -> Response<BoxBody>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body: LoginRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => return bad_request_response(format!("Invalid JSON body: {e}")),
    };

    match state.broker.login(&body.okta_username, &body.okta_password).await {
        Ok(token) => json_response(
            StatusCode::OK,
            &LoginResponse {
                token: token.as_str().to_string(),
            },
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /address, GET /sign
async fn handle_address<B>(req: Request<B>, state: Arc<AppState>) -> Response<BoxBody> {
    let Some(token) = bearer_token(&req) else {
        return error_response(&ResolutionError::InvalidToken);
    };

    match state.broker.get_address(&token).await {
        Ok(address) => json_response(StatusCode::OK, &AddressResponse { address }),
        Err(e) => error_response(&e),
    }
}

/// POST /sign
async fn handle_sign<B>(req: Request<B>, state: Arc<AppState>) -> Response<BoxBody>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let Some(token) = bearer_token(&req) else {
        return error_response(&ResolutionError::InvalidToken);
    };

    let body: SignRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => return bad_request_response(format!("Invalid JSON body: {e}")),
    };
    debug!(
        digest_hex_len = body.raw_data.len(),
        address_index = body.address_index,
        "Sign request"
    );

    match state.broker.sign(&token, &body.raw_data, body.address_index).await {
        Ok(signed) => json_response(
            StatusCode::OK,
            &SignResponse {
                signature: signed.signature,
                address: signed.address,
            },
        ),
        Err(e) => error_response(&e),
    }
}

// =============================================================================
// Router
// =============================================================================

/// Route a broker request. Returns `None` for paths this module does not own.
pub async fn handle_broker_request<B>(req: Request<B>, state: Arc<AppState>) -> Option<Response<BoxBody>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path().to_string();
    if !is_broker_path(&path) {
        return None;
    }
    let method = req.method().clone();

    let response = match (method, path.as_str()) {
        (Method::POST, "/authorize") => handle_authorize(req, state).await,
        (Method::POST, "/login") => handle_login(req, state).await,
        (Method::GET, "/address") | (Method::GET, "/sign") => handle_address(req, state).await,
        (Method::POST, "/sign") => handle_sign(req, state).await,
        _ => method_not_allowed(),
    };

    Some(response)
}

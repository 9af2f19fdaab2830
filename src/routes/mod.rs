//! HTTP routes for the guardian

pub mod broker_routes;
pub mod health;

pub use broker_routes::{handle_broker_request, is_broker_path};
pub use health::{health_check, version_info};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::backends::SessionToken;
use crate::broker::OperationError;
use crate::types::GuardianError;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Largest request body accepted, in bytes
pub const MAX_BODY_BYTES: usize = 10 * 1024;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
        }
    }
}

// =============================================================================
// Response Helpers
// =============================================================================

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(full_body(json));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Render a broker operation failure as `{error, code}`
pub fn error_response<E: OperationError>(err: &E) -> Response<BoxBody> {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &ErrorResponse::new(err.to_string(), err.code()))
}

pub fn no_content() -> Response<BoxBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

pub fn not_found_response(path: &str) -> Response<BoxBody> {
    json_response(
        StatusCode::NOT_FOUND,
        &ErrorResponse::new(format!("No route for {path}"), "NOT_FOUND"),
    )
}

pub fn method_not_allowed() -> Response<BoxBody> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &ErrorResponse::new("Method not allowed", "METHOD_NOT_ALLOWED"),
    )
}

pub fn bad_request_response(message: impl Into<String>) -> Response<BoxBody> {
    json_response(StatusCode::BAD_REQUEST, &ErrorResponse::new(message, "INVALID_BODY"))
}

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

fn empty_body() -> BoxBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

// =============================================================================
// Request Helpers
// =============================================================================

/// Read and decode a JSON body of at most [`MAX_BODY_BYTES`]
pub async fn parse_json_body<T, B>(req: Request<B>) -> Result<T, GuardianError>
where
    T: for<'de> Deserialize<'de>,
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let collected = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<http_body_util::LengthLimitError>() {
                GuardianError::Http("Request body too large".into())
            } else {
                GuardianError::Http(format!("Failed to read body: {e}"))
            }
        })?;

    serde_json::from_slice(&collected.to_bytes()).map_err(|e| GuardianError::Http(format!("Invalid JSON: {e}")))
}

/// `Authorization: Bearer <token>` as a session token
pub fn bearer_token<B>(req: &Request<B>) -> Option<SessionToken> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| SessionToken::new(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(auth: Option<&str>, body: &'static str) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().uri("/sign");
        if let Some(value) = auth {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap()
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(&request(Some("Bearer s.abc"), "")).unwrap().as_str(), "s.abc");
        assert_eq!(bearer_token(&request(Some("bearer  s.abc "), "")).unwrap().as_str(), "s.abc");
        assert!(bearer_token(&request(Some("Basic dXNlcg=="), "")).is_none());
        assert!(bearer_token(&request(Some("Bearer "), "")).is_none());
        assert!(bearer_token(&request(None, "")).is_none());
    }

    #[tokio::test]
    async fn test_parse_json_body() {
        #[derive(Debug, Deserialize)]
        struct SignBody {
            raw_data: String,
        }

        let parsed: SignBody = parse_json_body(request(None, r#"{"raw_data":"ab"}"#)).await.unwrap();
        assert_eq!(parsed.raw_data, "ab");

        let err = parse_json_body::<SignBody, _>(request(None, "not json")).await.unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let big = format!(r#"{{"raw_data":"{}"}}"#, "a".repeat(MAX_BODY_BYTES + 1));
        let req = Request::builder()
            .uri("/sign")
            .body(Full::new(Bytes::from(big)))
            .unwrap();

        let err = parse_json_body::<serde_json::Value, _>(req).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}

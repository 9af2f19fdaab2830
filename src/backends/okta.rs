//! Identity provider account directory client
//!
//! Only the existence check is needed: before a user is enrolled the
//! broker confirms the account really exists in the IdP organization.
//! The answer is tri-state: present, absent, or an error. A transport
//! failure is never reported as "absent".

use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{IdpError, UserPresence};

/// Client for the IdP organization's user API
#[derive(Clone)]
pub struct OktaClient {
    base_url: String,
    api_token: Zeroizing<String>,
    http: reqwest::Client,
}

impl OktaClient {
    pub fn new(base_url: &str, api_token: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("guardian/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: Zeroizing::new(api_token.to_string()),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Does the organization have an account for `username`?
    pub async fn account_exists(&self, username: &str) -> Result<UserPresence, IdpError> {
        let url = format!(
            "{}/api/v1/users/{}",
            self.base_url,
            urlencoding::encode(username)
        );

        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("SSWS {}", self.api_token.as_str()))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| IdpError::Unavailable(format!("okta request failed: {e}")))?;

        match response.status() {
            status if status.is_success() => {
                debug!(username = %username, "IdP account present");
                Ok(UserPresence::Present)
            }
            StatusCode::NOT_FOUND => {
                debug!(username = %username, "IdP account absent");
                Ok(UserPresence::Absent)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!("IdP rejected the configured API token");
                Err(IdpError::Failed("okta API token rejected".into()))
            }
            status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                Err(IdpError::Unavailable(format!("okta returned {status}")))
            }
            status => Err(IdpError::Failed(format!("okta returned {status}"))),
        }
    }
}

impl std::fmt::Debug for OktaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OktaClient")
            .field("base_url", &self.base_url)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

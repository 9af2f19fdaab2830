//! HTTP adapter onto a Vault-compatible secret store
//!
//! One client provides four capabilities, each mapped onto an HTTP API:
//!
//! | Capability | Endpoint |
//! |---|---|
//! | [`ServiceAuthority`] | `POST /v1/auth/approle/login` |
//! | [`TokenLookup`] | `POST /v1/auth/token/lookup` |
//! | [`KeyStore`] | KV v2 `GET/POST /v1/<mount>/data/<path>` (create-if-absent via `cas = 0`) |
//! | [`IdentityProvider`] | `/v1/auth/<okta-mount>/login/<user>` and `/users/<user>` |
//!
//! Every authenticated call carries the broker's service token in
//! `X-Vault-Token`. Session logins are made without it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::custodial_keys::{KeyRecord, UserRecord};

use super::okta::OktaClient;
use super::{
    AuthorityError, CreateOutcome, ExchangeResponse, IdentityProvider, IdpError, KeyStore,
    ServiceAuthority, ServiceToken, SessionToken, StoreError, TokenInfo, TokenLookup, UserPresence,
};

const TOKEN_HEADER: &str = "X-Vault-Token";

/// Connection settings for [`VaultClient`]
#[derive(Clone)]
pub struct VaultSettings {
    /// Base address, e.g. `https://vault.internal:8200`
    pub addr: String,
    /// KV v2 mount holding key records
    pub kv_mount: String,
    /// Auth mount backed by the identity provider
    pub okta_mount: String,
    /// Token presented on service authority calls, if any
    pub guardian_token: Zeroizing<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl std::fmt::Debug for VaultSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSettings")
            .field("addr", &self.addr)
            .field("kv_mount", &self.kv_mount)
            .field("okta_mount", &self.okta_mount)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Vault HTTP client
#[derive(Debug, Clone)]
pub struct VaultClient {
    settings: VaultSettings,
    http: reqwest::Client,
    okta: Option<OktaClient>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Deserialize)]
struct KvReadBody {
    data: KvData,
}

#[derive(Deserialize)]
struct KvData {
    data: Option<KeyRecord>,
}

#[derive(Deserialize)]
struct LookupBody {
    data: Option<LookupData>,
}

#[derive(Deserialize)]
struct LookupData {
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct LoginAuth {
    #[serde(default)]
    client_token: String,
}

#[derive(Deserialize)]
struct LoginBody {
    auth: Option<LoginAuth>,
}

impl VaultClient {
    pub fn new(settings: VaultSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("guardian/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            settings,
            http,
            okta: None,
        }
    }

    /// Confirm IdP org accounts through `okta` before enrolling users
    pub fn with_okta(mut self, okta: OktaClient) -> Self {
        self.okta = Some(okta);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.settings.addr.trim_end_matches('/'), path)
    }

    fn kv_url(&self, path: &str) -> String {
        self.url(&format!(
            "{}/data/{}",
            self.settings.kv_mount,
            encode_path(path)
        ))
    }

    fn okta_url(&self, section: &str, username: &str) -> String {
        self.url(&format!(
            "auth/{}/{}/{}",
            self.settings.okta_mount,
            section,
            urlencoding::encode(username)
        ))
    }

    async fn read_key(&self, auth: &ServiceToken, path: &str) -> Result<Option<KeyRecord>, StoreError> {
        let response = self
            .http
            .get(self.kv_url(path))
            .header(TOKEN_HEADER, auth.as_str())
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: KvReadBody = response.json().await.map_err(|_| StoreError::Malformed {
                    path: path.to_string(),
                })?;
                match body.data.data {
                    // Soft-deleted KV v2 entries come back with data: null
                    None => Ok(None),
                    Some(record) => {
                        record.validate().map_err(|_| StoreError::Malformed {
                            path: path.to_string(),
                        })?;
                        Ok(Some(record))
                    }
                }
            }
            _ => Err(store_error(response).await),
        }
    }

    async fn write_key(
        &self,
        auth: &ServiceToken,
        path: &str,
        record: &KeyRecord,
        cas: Option<u64>,
    ) -> Result<Response, StoreError> {
        let body = match cas {
            Some(version) => json!({ "options": { "cas": version }, "data": record }),
            None => json!({ "data": record }),
        };

        self.http
            .post(self.kv_url(path))
            .header(TOKEN_HEADER, auth.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

async fn error_text(response: Response) -> String {
    let status = response.status();
    let body: ErrorBody = response.json().await.unwrap_or_default();
    if body.errors.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.errors.join("; "))
    }
}

async fn store_error(response: Response) -> StoreError {
    let status = response.status();
    let message = error_text(response).await;
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StoreError::Unavailable(message)
    } else {
        StoreError::Rejected(message)
    }
}

async fn idp_error(response: Response) -> IdpError {
    let status = response.status();
    let message = error_text(response).await;
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        IdpError::Unavailable(message)
    } else {
        IdpError::Failed(message)
    }
}

// =============================================================================
// ServiceAuthority
// =============================================================================

#[async_trait]
impl ServiceAuthority for VaultClient {
    async fn exchange(&self, secret_id: &str, role_id: &str) -> Result<ExchangeResponse, AuthorityError> {
        let mut request = self
            .http
            .post(self.url("auth/approle/login"))
            .json(&json!({ "role_id": role_id, "secret_id": secret_id }));
        if !self.settings.guardian_token.is_empty() {
            request = request.header(TOKEN_HEADER, self.settings.guardian_token.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthorityError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                // A success body we cannot read is treated as carrying no credential
                Ok(response.json::<ExchangeResponse>().await.unwrap_or_default())
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(AuthorityError::Rejected(error_text(response).await))
            }
            _ => Err(AuthorityError::Unavailable(error_text(response).await)),
        }
    }
}

// =============================================================================
// TokenLookup
// =============================================================================

#[async_trait]
impl TokenLookup for VaultClient {
    async fn lookup_token(
        &self,
        auth: &ServiceToken,
        token: &SessionToken,
    ) -> Result<Option<TokenInfo>, StoreError> {
        let response = self
            .http
            .post(self.url("auth/token/lookup"))
            .header(TOKEN_HEADER, auth.as_str())
            .json(&json!({ "token": token.as_str() }))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let body: LookupBody = response
                    .json()
                    .await
                    .map_err(|e| StoreError::Unavailable(format!("unreadable lookup response: {e}")))?;
                Ok(body.data.map(|data| TokenInfo {
                    meta: data.meta.unwrap_or_default(),
                }))
            }
            // Unknown, expired or revoked tokens
            StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                debug!("session token lookup rejected");
                Ok(None)
            }
            _ => Err(store_error(response).await),
        }
    }
}

// =============================================================================
// KeyStore
// =============================================================================

#[async_trait]
impl KeyStore for VaultClient {
    async fn get(&self, auth: &ServiceToken, path: &str) -> Result<Option<KeyRecord>, StoreError> {
        self.read_key(auth, path).await
    }

    async fn put(&self, auth: &ServiceToken, path: &str, record: &KeyRecord) -> Result<(), StoreError> {
        let response = self.write_key(auth, path, record, None).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(store_error(response).await)
        }
    }

    async fn create_if_absent(
        &self,
        auth: &ServiceToken,
        path: &str,
        record: &KeyRecord,
    ) -> Result<CreateOutcome, StoreError> {
        let response = self.write_key(auth, path, record, Some(0)).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(CreateOutcome::Created);
        }

        let message = error_text(response).await;
        if status == StatusCode::BAD_REQUEST && message.contains("check-and-set") {
            debug!(path = %path, "check-and-set conflict, reading existing record");
            return match self.read_key(auth, path).await? {
                Some(existing) => Ok(CreateOutcome::Existing(existing)),
                None => Err(StoreError::Unavailable(format!(
                    "check-and-set conflict at {path} but no readable record"
                ))),
            };
        }

        if status.is_server_error() {
            Err(StoreError::Unavailable(message))
        } else {
            Err(StoreError::Rejected(message))
        }
    }
}

// =============================================================================
// IdentityProvider
// =============================================================================

#[async_trait]
impl IdentityProvider for VaultClient {
    async fn login(&self, username: &str, password: &str) -> Result<SessionToken, IdpError> {
        let response = self
            .http
            .post(self.okta_url("login", username))
            .json(&json!({ "password": password }))
            .send()
            .await
            .map_err(|e| IdpError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let body: LoginBody = response
                    .json()
                    .await
                    .map_err(|e| IdpError::Failed(format!("unreadable login response: {e}")))?;
                match body.auth {
                    Some(auth) if !auth.client_token.is_empty() => Ok(SessionToken::new(auth.client_token)),
                    _ => Err(IdpError::Failed("login response carried no client token".into())),
                }
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(IdpError::Rejected)
            }
            _ => Err(idp_error(response).await),
        }
    }

    async fn user_exists(&self, auth: &ServiceToken, username: &str) -> Result<UserPresence, IdpError> {
        let response = self
            .http
            .get(self.okta_url("users", username))
            .header(TOKEN_HEADER, auth.as_str())
            .send()
            .await
            .map_err(|e| IdpError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(UserPresence::Absent),
            status if status.is_success() => Ok(UserPresence::Present),
            _ => Err(idp_error(response).await),
        }
    }

    async fn create_user(&self, auth: &ServiceToken, user: &UserRecord) -> Result<(), IdpError> {
        if let Some(okta) = &self.okta {
            if okta.account_exists(&user.username).await? == UserPresence::Absent {
                warn!(username = %user.username, "refusing to enroll user without an IdP account");
                return Err(IdpError::Failed("no such account in the identity provider".into()));
            }
        }

        let response = self
            .http
            .post(self.okta_url("users", &user.username))
            .header(TOKEN_HEADER, auth.as_str())
            .json(&json!({
                "groups": user.groups_csv(),
                "policies": user.policies_csv(),
            }))
            .send()
            .await
            .map_err(|e| IdpError::Unavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(idp_error(response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> VaultClient {
        VaultClient::new(VaultSettings {
            addr: "http://127.0.0.1:8200/".into(),
            kv_mount: "secret".into(),
            okta_mount: "okta".into(),
            guardian_token: Zeroizing::new(String::new()),
            timeout: Duration::from_secs(1),
        })
    }

    #[test]
    fn test_kv_url_encodes_segments() {
        assert_eq!(
            client().kv_url("guardian/keys/alice+test@example.com"),
            "http://127.0.0.1:8200/v1/secret/data/guardian/keys/alice%2Btest%40example.com"
        );
    }

    #[test]
    fn test_okta_urls() {
        assert_eq!(
            client().okta_url("login", "bob"),
            "http://127.0.0.1:8200/v1/auth/okta/login/bob"
        );
        assert_eq!(
            client().okta_url("users", "bob"),
            "http://127.0.0.1:8200/v1/auth/okta/users/bob"
        );
    }

    #[test]
    fn test_settings_debug_hides_token() {
        let settings = VaultSettings {
            addr: "http://vault".into(),
            kv_mount: "secret".into(),
            okta_mount: "okta".into(),
            guardian_token: Zeroizing::new("s.root-ish".into()),
            timeout: Duration::from_secs(1),
        };
        assert!(!format!("{settings:?}").contains("root-ish"));
    }
}

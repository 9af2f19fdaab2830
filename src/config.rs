//! Configuration for Guardian
//!
//! Two layers:
//! - [`Args`]: CLI flags with environment fallbacks (clap + dotenvy)
//! - [`GuardianConfig`]: the persisted broker configuration, loaded once at
//!   startup and never mutated afterwards

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use crate::types::{GuardianError, Result};

/// Role identifier pre-registered with the service authority for the broker
pub const DEFAULT_ROLE_ID: &str = "guardian-role-id";

/// Group every enrolled end user is placed in
pub const DEFAULT_ENROLLMENT_GROUP: &str = "guardian-enduser";

/// Guardian - Ethereum signing broker for IdP-authenticated users
#[derive(Parser, Debug, Clone)]
#[command(name = "guardian")]
#[command(about = "Brokers Ethereum signing for users authenticated through an external IdP")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "127.0.0.1:8200")]
    pub listen: SocketAddr,

    /// Path to the persisted JSON configuration ({guardianToken, oktaURL, oktaToken})
    #[arg(long, env = "GUARDIAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Base address of the Vault-compatible secret store
    #[arg(long, env = "VAULT_ADDR")]
    pub vault_addr: Option<String>,

    /// KV v2 mount holding key records
    #[arg(long, env = "KV_MOUNT", default_value = "secret")]
    pub kv_mount: String,

    /// Auth mount backed by the identity provider
    #[arg(long, env = "OKTA_MOUNT", default_value = "okta")]
    pub okta_mount: String,

    /// Role identifier used when exchanging a secret ID for a service token
    #[arg(long, env = "ROLE_ID", default_value = DEFAULT_ROLE_ID)]
    pub role_id: String,

    /// Group assigned to users at enrollment
    #[arg(long, env = "ENROLLMENT_GROUP", default_value = DEFAULT_ENROLLMENT_GROUP)]
    pub enrollment_group: String,

    /// Timeout applied to every upstream call, in milliseconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_MS", default_value = "10000")]
    pub upstream_timeout_ms: u64,

    /// Run against in-memory collaborators (no secret store, no IdP)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

impl Args {
    /// Upstream call timeout as a [`Duration`]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.upstream_timeout_ms == 0 {
            return Err("UPSTREAM_TIMEOUT_MS must be greater than zero".to_string());
        }

        if self.role_id.trim().is_empty() {
            return Err("ROLE_ID must not be empty".to_string());
        }

        if self.enrollment_group.trim().is_empty() {
            return Err("ENROLLMENT_GROUP must not be empty".to_string());
        }

        if !self.dev_mode {
            if self.config.is_none() {
                return Err("GUARDIAN_CONFIG is required in production mode".to_string());
            }
            if self.vault_addr.is_none() {
                return Err("VAULT_ADDR is required in production mode".to_string());
            }
        }

        Ok(())
    }
}

/// On-disk shape of the persisted configuration
#[derive(Deserialize, Default)]
struct PersistedConfig {
    #[serde(rename = "guardianToken", default)]
    guardian_token: String,
    #[serde(rename = "oktaURL", default)]
    okta_url: String,
    #[serde(rename = "oktaToken", default)]
    okta_token: String,
}

/// Immutable broker configuration.
///
/// One instance per running broker. Fields are private so nothing can
/// mutate them after [`GuardianConfig::load`] or [`GuardianConfig::new`].
#[derive(Clone, PartialEq, Eq)]
pub struct GuardianConfig {
    guardian_token: String,
    okta_url: String,
    okta_token: String,
}

impl GuardianConfig {
    pub fn new(
        guardian_token: impl Into<String>,
        okta_url: impl Into<String>,
        okta_token: impl Into<String>,
    ) -> Result<Self> {
        let config = Self {
            guardian_token: guardian_token.into(),
            okta_url: okta_url.into().trim_end_matches('/').to_string(),
            okta_token: okta_token.into(),
        };
        config.check()?;
        Ok(config)
    }

    /// Empty configuration, used when nothing has been persisted yet
    pub fn empty() -> Self {
        Self {
            guardian_token: String::new(),
            okta_url: String::new(),
            okta_token: String::new(),
        }
    }

    /// Load the persisted configuration.
    ///
    /// A missing file yields [`GuardianConfig::empty`].
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "No persisted configuration found, using empty config");
                return Ok(Self::empty());
            }
            Err(e) => return Err(e.into()),
        };

        let persisted: PersistedConfig = serde_json::from_str(&raw).map_err(|e| {
            GuardianError::Config(format!("Invalid configuration file {}: {e}", path.display()))
        })?;

        let config = Self::new(persisted.guardian_token, persisted.okta_url, persisted.okta_token)?;
        info!(
            path = %path.display(),
            okta_url = %config.okta_url,
            "Loaded guardian configuration"
        );
        Ok(config)
    }

    /// Token the broker presents to the service authority endpoint
    pub fn guardian_token(&self) -> &str {
        &self.guardian_token
    }

    /// Base URL of the identity provider organization
    pub fn okta_url(&self) -> &str {
        &self.okta_url
    }

    /// API token for the identity provider organization
    pub fn okta_token(&self) -> &str {
        &self.okta_token
    }

    fn check(&self) -> Result<()> {
        if self.okta_url.is_empty() {
            return Ok(());
        }
        let valid = reqwest::Url::parse(&self.okta_url).is_ok_and(|url| {
            matches!(url.scheme(), "http" | "https") && url.host_str().is_some_and(|host| !host.is_empty())
        });
        if !valid {
            return Err(GuardianError::Config(format!(
                "oktaURL must be an http(s) URL with a host, got '{}'",
                self.okta_url
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for GuardianConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardianConfig")
            .field("guardian_token", &redacted(&self.guardian_token))
            .field("okta_url", &self.okta_url)
            .field("okta_token", &redacted(&self.okta_token))
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

//! HTTP server implementation
//!
//! hyper http1 with TokioIo, one task per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::backends::{
    InMemoryDirectory, InMemoryKeyStore, OktaClient, StaticAuthority, VaultClient, VaultSettings,
};
use crate::broker::{Broker, BrokerSettings, Collaborators};
use crate::config::{Args, GuardianConfig};
use crate::custodial_keys::Secp256k1Signer;
use crate::routes::{self, BoxBody};
use crate::types::{GuardianError, Result};

/// Secret ID accepted by the in-memory authority in dev mode
pub const DEV_SECRET_ID: &str = "dev-secret-id";
/// IdP account available in dev mode
pub const DEV_USERNAME: &str = "dev-user";
pub const DEV_PASSWORD: &str = "dev-password";

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub broker: Broker,
}

impl AppState {
    pub fn new(args: Args, broker: Broker) -> Self {
        Self { args, broker }
    }

    /// In-memory collaborators seeded with one dev account (no external services)
    pub fn dev(args: Args) -> Self {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add_account(DEV_USERNAME, DEV_PASSWORD);

        let collaborators = Collaborators {
            key_store: Arc::new(InMemoryKeyStore::new()),
            tokens: directory.clone(),
            identity: directory,
            authority: Arc::new(StaticAuthority::new([DEV_SECRET_ID])),
            signer: Arc::new(Secp256k1Signer::new()),
        };
        let broker = Broker::new(collaborators, broker_settings(&args));
        Self::new(args, broker)
    }

    /// Vault-backed collaborators, with the IdP account check when configured
    pub fn production(args: Args, config: &GuardianConfig) -> Result<Self> {
        let addr = args
            .vault_addr
            .clone()
            .ok_or_else(|| GuardianError::Config("VAULT_ADDR is required in production mode".into()))?;

        let mut vault = VaultClient::new(VaultSettings {
            addr,
            kv_mount: args.kv_mount.clone(),
            okta_mount: args.okta_mount.clone(),
            guardian_token: Zeroizing::new(config.guardian_token().to_string()),
            timeout: args.upstream_timeout(),
        });
        if !config.okta_url().is_empty() {
            vault = vault.with_okta(OktaClient::new(
                config.okta_url(),
                config.okta_token(),
                args.upstream_timeout(),
            ));
        } else {
            warn!("No IdP URL configured, enrollment skips the account existence check");
        }

        let vault = Arc::new(vault);
        let collaborators = Collaborators {
            key_store: vault.clone(),
            tokens: vault.clone(),
            identity: vault.clone(),
            authority: vault,
            signer: Arc::new(Secp256k1Signer::new()),
        };
        let broker = Broker::new(collaborators, broker_settings(&args));
        Ok(Self::new(args, broker))
    }
}

fn broker_settings(args: &Args) -> BrokerSettings {
    BrokerSettings {
        role_id: args.role_id.clone(),
        enrollment_group: args.enrollment_group.clone(),
        upstream_timeout: args.upstream_timeout(),
    }
}

/// Bind `state.args.listen` and serve forever
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    info!("Guardian listening on {}", state.args.listen);

    if state.args.dev_mode {
        warn!("Development mode enabled - in-memory collaborators, nothing is persisted");
    }

    serve(listener, state).await
}

/// Serve connections from an already-bound listener
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, hyper::Error>(handle_request(state, addr, req).await) }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
pub async fn handle_request<B>(state: Arc<AppState>, addr: SocketAddr, req: Request<B>) -> Response<BoxBody>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    if routes::is_broker_path(&path) {
        if let Some(response) = routes::handle_broker_request(req, Arc::clone(&state)).await {
            return response;
        }
        return routes::not_found_response(&path);
    }

    match (method, path.as_str()) {
        (Method::GET, "/health") => routes::health_check(Arc::clone(&state)).await,
        (Method::GET, "/version") => routes::version_info(),
        (_, "/health") | (_, "/version") => routes::method_not_allowed(),
        _ => routes::not_found_response(&path),
    }
}

//! Guardian - Ethereum signing broker for IdP-authenticated users

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use guardian::{
    config::{Args, GuardianConfig},
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("guardian={},info", args.log_level).into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Guardian - Ethereum signing broker");
    info!("======================================");
    info!("Version: {} ({})", env!("CARGO_PKG_VERSION"), option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"));
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Role: {}", args.role_id);
    info!("Enrollment group: {}", args.enrollment_group);
    info!("Upstream timeout: {}ms", args.upstream_timeout_ms);
    if let Some(addr) = &args.vault_addr {
        info!("Secret store: {} (kv mount '{}', auth mount '{}')", addr, args.kv_mount, args.okta_mount);
    }
    info!("======================================");

    let state = if args.dev_mode {
        warn!(
            "Dev mode: authorize with secret id '{}', log in as '{}'",
            server::DEV_SECRET_ID,
            server::DEV_USERNAME
        );
        AppState::dev(args)
    } else {
        let config = match &args.config {
            Some(path) => GuardianConfig::load(path)?,
            None => GuardianConfig::empty(),
        };
        if config.guardian_token().is_empty() {
            info!("No guardian token configured, exchanges are sent without one");
        }
        AppState::production(args, &config)?
    };

    info!("Waiting for POST /authorize before serving users");
    server::run(Arc::new(state)).await?;

    Ok(())
}

//! Guardian - Ethereum signing broker
//!
//! Users authenticate against an external identity provider; the broker
//! holds one secp256k1 key per user in a secret store and signs digests on
//! their behalf. Private keys never leave the broker.
//!
//! ## Modules
//!
//! - [`broker`]: authorize, login, provisioning and signing operations
//! - [`backends`]: collaborator traits plus in-memory and Vault/Okta implementations
//! - [`custodial_keys`]: key records and the secp256k1 signing primitive
//! - [`server`] / [`routes`]: the HTTP surface
//! - [`config`]: CLI arguments and the persisted configuration

pub mod backends;
pub mod broker;
pub mod config;
pub mod custodial_keys;
pub mod routes;
pub mod server;
pub mod types;

pub use broker::Broker;
pub use config::{Args, GuardianConfig};
pub use types::{GuardianError, Result};

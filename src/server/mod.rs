//! HTTP server

pub mod http;

pub use http::{handle_request, run, serve, AppState, DEV_PASSWORD, DEV_SECRET_ID, DEV_USERNAME};

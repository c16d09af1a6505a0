//! # estore_auth
//!
//! Session and token lifecycle management for eStore: short-lived access
//! tokens, rotating refresh tokens, logout revocation, and single-use
//! password-reset / email-verification tokens.

pub mod audit;
pub mod auth;
pub mod clock;
pub mod config;
pub mod ids;
pub mod migrate;
pub mod models;
pub mod refresh;
pub mod revocation;
pub mod session;
pub mod store;

pub use auth::AuthError;
pub use config::SessionConfig;
pub use session::SessionManager;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

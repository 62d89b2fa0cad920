//! gymtrack-core - authenticated API client and session management for the
//! gymtrack mobile client.
//!
//! The crate owns the request path between the UI and the backend:
//! bearer-token signing, detection of expired access tokens, single-flight
//! refresh with replay of the requests that were blocked behind it, and
//! the process-wide session state machine. Screens, navigation, and form
//! validation live in the host application.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError, SignOutGuard, TokenHolder};
pub use auth::{
    Credential, CredentialStore, KeyringStore, MemoryStore, SessionManager, SessionState,
    StorageError,
};
pub use config::Config;
pub use models::UserProfile;

//! Session and credential management.
//!
//! This module provides:
//! - `SessionManager`: the signed-out / signed-in state machine the UI
//!   observes through a watch channel
//! - `CredentialStore`: persistence for the credential pair and profile,
//!   backed by the OS keychain by default

pub mod credentials;
pub mod session;

pub use credentials::{Credential, CredentialStore, KeyringStore, MemoryStore, StorageError};
pub use session::{SessionManager, SessionState};

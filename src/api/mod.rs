//! Authenticated HTTP layer for the gymtrack backend.
//!
//! This module provides:
//! - `ApiClient`: attaches the current access token to every request and
//!   wraps error responses into the `ApiError` taxonomy
//! - the refresh coordinator: single-flight access-token refresh with
//!   replay of every request that was blocked behind it
//!
//! Expired tokens are detected from the server's 401 `token.expired` /
//! `token.invalid` responses; an irrecoverable refresh forces sign-out
//! through the handler installed by the session manager.

pub mod client;
pub mod error;
mod refresh;

pub use client::{ApiClient, SignOutGuard, TokenHolder};
pub use error::ApiError;

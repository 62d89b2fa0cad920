use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::auth::StorageError;

/// Errors surfaced by [`ApiClient::request`](crate::api::ApiClient::request)
/// and the session operations built on top of it.
///
/// `Clone` because a single refresh failure fans out to every request that
/// was queued behind the exchange; the transport and storage sources are
/// shared through `Arc` to keep that cheap.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// No structured response was received (DNS failure, timeout,
    /// connection reset).
    #[error("network error: {0}")]
    Transport(#[source] Arc<reqwest::Error>),

    /// The server responded with an error body; the message is preserved
    /// verbatim for the UI to render.
    #[error("{message}")]
    Application { message: String },

    /// Reading or writing the credential store failed.
    #[error("credential storage error: {0}")]
    Storage(#[source] Arc<StorageError>),

    /// A request or response body could not be encoded.
    #[error("invalid payload: {0}")]
    Payload(#[source] Arc<serde_json::Error>),

    /// The session could not be recovered and was terminated.
    #[error("session expired, please sign in again")]
    SessionExpired,
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transport(Arc::new(err))
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Storage(Arc::new(err))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Payload(Arc::new(err))
    }
}

/// Error body shape the backend uses for every non-2xx response.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub message: String,
}

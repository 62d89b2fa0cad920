//! Authenticated API client for the gymtrack backend.
//!
//! Every outgoing request carries the current access token as a bearer
//! header. When the server reports the token as expired, the request
//! defers to the refresh coordinator and is replayed once with the new
//! token; any other error response is wrapped into [`ApiError`] with the
//! server's message preserved.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::api::error::ErrorBody;
use crate::api::refresh::RefreshCoordinator;
use crate::api::ApiError;
use crate::auth::CredentialStore;
use crate::config::Config;

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Error messages the backend uses to signal an expired or invalid access
/// token. Only these route a 401 into the refresh path; any other 401 is a
/// normal authorization failure and is surfaced to the caller.
const EXPIRY_SIGNALS: [&str; 2] = ["token.expired", "token.invalid"];

/// Shared handle to the current access token.
///
/// The session manager writes it on sign-in, sign-out, and restore; the
/// refresh coordinator writes it after a successful exchange; the client
/// reads it when signing requests. Clones observe the same token.
#[derive(Clone, Default)]
pub struct TokenHolder(Arc<Mutex<Option<String>>>);

impl TokenHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn set(&self, token: String) {
        *self.0.lock().unwrap() = Some(token);
    }

    pub fn clear(&self) {
        *self.0.lock().unwrap() = None;
    }
}

type SignOutHandler = Arc<dyn Fn() + Send + Sync>;

/// Single-slot holder for the forced sign-out handler.
///
/// Installing a new handler supersedes the previous one; registrations are
/// numbered so a stale guard cannot unregister its successor.
#[derive(Clone, Default)]
pub(crate) struct SignOutSlot {
    inner: Arc<Mutex<SlotInner>>,
}

#[derive(Default)]
struct SlotInner {
    handler: Option<(u64, SignOutHandler)>,
    next_id: u64,
}

impl SignOutSlot {
    fn install(&self, handler: SignOutHandler) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.handler = Some((id, handler));
        id
    }

    fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.handler, Some((current, _)) if current == id) {
            inner.handler = None;
        }
    }

    /// Invoke the installed handler, if any. The handler runs outside the
    /// slot lock so it may itself install or remove handlers.
    pub(crate) fn invoke(&self) {
        let handler = self
            .inner
            .lock()
            .unwrap()
            .handler
            .as_ref()
            .map(|(_, handler)| handler.clone());
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// Unregisters a forced sign-out handler.
///
/// Returned by [`ApiClient::on_forced_sign_out`]. Calling
/// [`unregister`](SignOutGuard::unregister) removes the handler this guard
/// was issued for; a handler installed after this one is left untouched.
pub struct SignOutGuard {
    slot: SignOutSlot,
    id: u64,
}

impl SignOutGuard {
    pub fn unregister(self) {
        self.slot.remove(self.id);
    }
}

/// Outcome classification for a non-2xx response.
enum Failure {
    /// 401 carrying one of the expiry signals. Holds the error to surface
    /// if no refresh can be attempted.
    Expired(ApiError),
    /// Anything else; returned to the caller as-is.
    Fatal(ApiError),
}

/// Authenticated API client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: TokenHolder,
    refresh: Arc<RefreshCoordinator>,
    sign_out: SignOutSlot,
}

impl ApiClient {
    pub fn new(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        let token = TokenHolder::new();
        let sign_out = SignOutSlot::default();
        let refresh = Arc::new(RefreshCoordinator::new(
            http.clone(),
            config.base_url.clone(),
            store,
            token.clone(),
            sign_out.clone(),
        ));

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            token,
            refresh,
            sign_out,
        })
    }

    /// Shared handle to the current access token.
    pub fn token_holder(&self) -> TokenHolder {
        self.token.clone()
    }

    /// Install the handler invoked when the session cannot be recovered
    /// (missing refresh token or a failed refresh exchange).
    ///
    /// At most one handler is active at a time: installing a new one
    /// supersedes the previous one rather than stacking.
    pub fn on_forced_sign_out(&self, handler: impl Fn() + Send + Sync + 'static) -> SignOutGuard {
        let id = self.sign_out.install(Arc::new(handler));
        SignOutGuard {
            slot: self.sign_out.clone(),
            id,
        }
    }

    /// Issue an authenticated request and return the raw response.
    ///
    /// On a 401 carrying an expiry signal the call defers to the refresh
    /// coordinator; if the refresh succeeds the request is replayed once
    /// with the new token and resolves with the replay's own outcome. A
    /// replay that fails again is surfaced as-is and does not re-enter the
    /// refresh path.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response, ApiError> {
        let response = self
            .send(method.clone(), path, body.as_ref(), self.token.get())
            .await?;
        if response.status().is_success() {
            return Ok(response);
        }

        match Self::classify(response).await {
            Failure::Expired(original) => {
                debug!(path, "access token rejected, deferring to refresh");
                let new_token = self.refresh.token_after_refresh(original).await?;

                let replay = self.send(method, path, body.as_ref(), Some(new_token)).await?;
                if replay.status().is_success() {
                    Ok(replay)
                } else {
                    match Self::classify(replay).await {
                        Failure::Expired(err) | Failure::Fatal(err) => Err(err),
                    }
                }
            }
            Failure::Fatal(err) => Err(err),
        }
    }

    /// `GET` returning a deserialized body.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.request(Method::GET, path, None).await?;
        Ok(response.json().await?)
    }

    /// `POST` with a JSON body, returning a deserialized body.
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)?;
        let response = self.request(Method::POST, path, Some(body)).await?;
        Ok(response.json().await?)
    }

    /// `PUT` with a JSON body, discarding the response body.
    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        let body = serde_json::to_value(body)?;
        self.request(Method::PUT, path, Some(body)).await?;
        Ok(())
    }

    /// `DELETE`, discarding the response body.
    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.request(Method::DELETE, path, None).await?;
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        token: Option<String>,
    ) -> Result<Response, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Map a non-2xx response onto the error taxonomy.
    async fn classify(response: Response) -> Failure {
        let status = response.status();
        let status_err = response.error_for_status_ref().err();
        let text = response.text().await.unwrap_or_default();

        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => {
                let err = ApiError::Application {
                    message: body.message.clone(),
                };
                if is_expiry_signal(status, &body.message) {
                    Failure::Expired(err)
                } else {
                    Failure::Fatal(err)
                }
            }
            // No structured body: surface the raw status error.
            Err(_) => match status_err {
                Some(err) => Failure::Fatal(err.into()),
                None => Failure::Fatal(ApiError::Application {
                    message: format!("request failed with status {status}"),
                }),
            },
        }
    }
}

/// True for the exact server response pattern that triggers a refresh.
pub(crate) fn is_expiry_signal(status: StatusCode, message: &str) -> bool {
    status == StatusCode::UNAUTHORIZED && EXPIRY_SIGNALS.contains(&message)
}

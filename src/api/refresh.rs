//! Single-flight refresh of the access token.
//!
//! Any number of requests may observe an expired token at nearly the same
//! instant. Exactly one of them performs the refresh exchange; the rest
//! park on a oneshot channel and are woken with the outcome. The in-flight
//! flag and the waiter queue live behind one mutex and are always reset
//! together, so a request arriving after a cycle completes starts a fresh
//! cycle instead of observing stale state.
//!
//! A failed exchange is never retried here; it terminates the session via
//! the registered sign-out handler.

use std::sync::Arc;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::api::client::{SignOutSlot, TokenHolder};
use crate::api::error::ErrorBody;
use crate::api::ApiError;
use crate::auth::{Credential, CredentialStore};

/// Path of the refresh exchange endpoint
const REFRESH_PATH: &str = "/sessions/refresh-token";

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    token: String,
    refresh_token: String,
}

/// Waiters parked behind an in-flight exchange. Each receives the new
/// access token on success or the terminal error on failure, exactly once.
///
/// Invariant: `waiters` is non-empty only while `in_flight` is true.
#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<Result<String, ApiError>>>,
}

pub(crate) struct RefreshCoordinator {
    http: Client,
    base_url: String,
    store: Arc<dyn CredentialStore>,
    token: TokenHolder,
    sign_out: SignOutSlot,
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub(crate) fn new(
        http: Client,
        base_url: String,
        store: Arc<dyn CredentialStore>,
        token: TokenHolder,
        sign_out: SignOutSlot,
    ) -> Self {
        Self {
            http,
            base_url,
            store,
            token,
            sign_out,
            state: Mutex::new(RefreshState::default()),
        }
    }

    /// Resolve a request that hit an expiry signal.
    ///
    /// Returns the fresh access token to replay with, or the error the
    /// request should fail with. `original` is the error of the request
    /// that triggered us; it is surfaced unchanged when no refresh can be
    /// attempted at all.
    pub(crate) async fn token_after_refresh(&self, original: ApiError) -> Result<String, ApiError> {
        let refresh_token = {
            let mut state = self.state.lock().await;

            if state.in_flight {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                drop(state);
                return match rx.await {
                    Ok(outcome) => outcome,
                    // The sender half is only dropped after signalling, so
                    // this arm is unreachable in practice.
                    Err(_) => Err(ApiError::SessionExpired),
                };
            }

            match self.store.credential() {
                Ok(Some(credential)) => {
                    state.in_flight = true;
                    credential.refresh_token
                }
                Ok(None) => {
                    warn!("expired access token with no stored refresh token, signing out");
                    drop(state);
                    self.sign_out.invoke();
                    return Err(original);
                }
                Err(err) => {
                    warn!(error = %err, "credential store read failed, signing out");
                    drop(state);
                    self.sign_out.invoke();
                    return Err(original);
                }
            }
        };

        // Exchange with the lock released so late arrivals can enqueue
        // instead of serializing behind the network call.
        let outcome = self.exchange(&refresh_token).await;

        // Drain the queue and clear the flag in one step. A request that
        // fails after this point starts a fresh cycle.
        let waiters = {
            let mut state = self.state.lock().await;
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };

        match outcome {
            Ok(token) => {
                info!(waiters = waiters.len(), "access token refreshed");
                for waiter in waiters {
                    let _ = waiter.send(Ok(token.clone()));
                }
                Ok(token)
            }
            Err(err) => {
                warn!(error = %err, waiters = waiters.len(), "token refresh failed, signing out");
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                self.sign_out.invoke();
                Err(err)
            }
        }
    }

    /// Perform the one refresh exchange of a cycle: call the refresh
    /// endpoint, persist the new pair, and publish the new access token
    /// before any replay goes out.
    async fn exchange(&self, refresh_token: &str) -> Result<String, ApiError> {
        debug!("issuing refresh token exchange");
        let url = format!("{}{}", self.base_url, REFRESH_PATH);
        let response = self
            .http
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        // Any error response is terminal, including an expiry-class answer
        // from the refresh endpoint itself; there is no recursive refresh.
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => ApiError::Application {
                    message: body.message,
                },
                Err(_) => ApiError::Application {
                    message: format!("refresh failed with status {status}"),
                },
            });
        }

        let refreshed: RefreshResponse = response.json().await?;
        let credential = Credential {
            token: refreshed.token.clone(),
            refresh_token: refreshed.refresh_token,
        };

        // A new pair that cannot be persisted is treated as a failed
        // refresh: an ambiguous half-updated session must not survive.
        self.store.save_credential(&credential)?;

        self.token.set(refreshed.token.clone());
        Ok(refreshed.token)
    }
}

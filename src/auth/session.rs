//! Process-wide session state machine.
//!
//! The manager owns every transition between signed-out and signed-in,
//! writes the credential store, and keeps the client's token holder in
//! step. Irrecoverable refresh failures flow back in through the forced
//! sign-out handler it registers with the client, so from the UI's point
//! of view they look like an ordinary sign-out.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{ApiClient, ApiError, SignOutGuard};
use crate::auth::{Credential, CredentialStore, StorageError};
use crate::models::UserProfile;

/// Path of the sign-in endpoint
const SESSIONS_PATH: &str = "/sessions";

#[derive(Serialize)]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct SignInResponse {
    user: UserProfile,
    token: String,
    refresh_token: String,
}

/// Authentication state observed by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The initial restore from the credential store has not settled yet.
    Restoring,
    /// A sign-in exchange is in flight.
    SigningIn,
    SignedIn(UserProfile),
    SignedOut,
}

impl SessionState {
    /// True while an operation that will settle the state is in flight.
    pub fn is_loading(&self) -> bool {
        matches!(self, SessionState::Restoring | SessionState::SigningIn)
    }

    pub fn user(&self) -> Option<&UserProfile> {
        match self {
            SessionState::SignedIn(user) => Some(user),
            _ => None,
        }
    }
}

/// Owns the session state machine and all credential store writes.
pub struct SessionManager {
    api: ApiClient,
    store: Arc<dyn CredentialStore>,
    state: Arc<watch::Sender<SessionState>>,
    _sign_out_guard: SignOutGuard,
}

impl SessionManager {
    /// Create a session manager and install its forced sign-out handler on
    /// the client, superseding any previous handler. The state starts at
    /// [`SessionState::Restoring`]; call [`SessionManager::restore`] to
    /// settle it.
    pub fn new(api: ApiClient, store: Arc<dyn CredentialStore>) -> Self {
        let (state, _) = watch::channel(SessionState::Restoring);
        let state = Arc::new(state);

        // The handler owns clones of everything it needs and never touches
        // the manager itself, so one registration outlives every state
        // transition.
        let sign_out_guard = {
            let store = store.clone();
            let token = api.token_holder();
            let state = state.clone();
            api.on_forced_sign_out(move || {
                warn!("session irrecoverable, forcing sign-out");
                token.clear();
                if let Err(err) = clear_stored_session(store.as_ref()) {
                    warn!(error = %err, "failed to clear stored session");
                }
                state.send_replace(SessionState::SignedOut);
            })
        };

        Self {
            api,
            store,
            state,
            _sign_out_guard: sign_out_guard,
        }
    }

    /// Watch the session state. The receiver sees the current state
    /// immediately and every transition afterwards.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Settle the initial state from the credential store without touching
    /// the network. Signed-in requires both a stored profile and a stored
    /// credential; anything else, including a store read failure, lands on
    /// signed-out.
    pub fn restore(&self) {
        let restored = match (self.store.profile(), self.store.credential()) {
            (Ok(Some(profile)), Ok(Some(credential))) => Some((profile, credential)),
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "credential store read failed during restore");
                None
            }
            _ => None,
        };

        match restored {
            Some((profile, credential)) => {
                self.api.token_holder().set(credential.token);
                info!(user = %profile.id, "session restored from storage");
                self.state.send_replace(SessionState::SignedIn(profile));
            }
            None => {
                self.state.send_replace(SessionState::SignedOut);
            }
        }
    }

    /// Exchange email and password for a session.
    ///
    /// On success the profile and credential pair are persisted, the
    /// process-wide token is set, and the state becomes signed-in. On any
    /// failure, including a storage failure, the state settles back on
    /// signed-out with nothing half-written in memory.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserProfile, ApiError> {
        self.state.send_replace(SessionState::SigningIn);

        let response: SignInResponse = match self
            .api
            .post(SESSIONS_PATH, &SignInRequest { email, password })
            .await
        {
            Ok(response) => response,
            Err(err) => {
                self.state.send_replace(SessionState::SignedOut);
                return Err(err);
            }
        };

        let credential = Credential {
            token: response.token,
            refresh_token: response.refresh_token,
        };

        // Persist before flipping state: a signed-in state without a stored
        // credential would not survive a restart or a refresh.
        if let Err(err) = self
            .store
            .save_profile(&response.user)
            .and_then(|()| self.store.save_credential(&credential))
        {
            self.state.send_replace(SessionState::SignedOut);
            return Err(err.into());
        }

        self.api.token_holder().set(credential.token);
        info!(user = %response.user.id, "signed in");
        self.state
            .send_replace(SessionState::SignedIn(response.user.clone()));
        Ok(response.user)
    }

    /// Clear the session. Idempotent: signing out while already signed out
    /// leaves the state unchanged and succeeds.
    ///
    /// A storage failure aborts before any in-memory change, so state and
    /// storage never disagree.
    pub fn sign_out(&self) -> Result<(), ApiError> {
        if matches!(&*self.state.borrow(), SessionState::SignedOut) {
            return Ok(());
        }

        clear_stored_session(self.store.as_ref()).map_err(ApiError::from)?;
        self.api.token_holder().clear();
        info!("signed out");
        self.state.send_replace(SessionState::SignedOut);
        Ok(())
    }

    /// Replace the signed-in profile wholesale, persisted and in-memory.
    /// Tokens are untouched. Fails unless signed in.
    pub fn update_profile(&self, profile: UserProfile) -> Result<(), ApiError> {
        if !matches!(&*self.state.borrow(), SessionState::SignedIn(_)) {
            return Err(ApiError::Application {
                message: "not signed in".to_string(),
            });
        }

        self.store.save_profile(&profile)?;
        self.state.send_replace(SessionState::SignedIn(profile));
        Ok(())
    }
}

/// Remove the persisted credential, then the profile. Credential first: a
/// crash in between leaves a profile without a credential, which restore
/// already treats as signed-out.
fn clear_stored_session(store: &dyn CredentialStore) -> Result<(), StorageError> {
    store.remove_credential()?;
    store.remove_profile()
}

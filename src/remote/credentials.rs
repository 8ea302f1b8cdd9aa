//! Credential providers consulted whenever a stream opens.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::model::User;
use crate::remote::datastore::StreamCredentials;

/// A bearer token together with the user it authenticates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub user: User,
}

/// Invoked with the new user whenever the signed-in principal changes.
pub type CredentialChangeListener = Arc<dyn Fn(User) + Send + Sync>;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Current token, refreshed first when `force_refresh` is set.
    async fn get_token(&self, force_refresh: bool) -> SyncResult<Option<Token>>;

    /// Marks the cached token as rejected so the next fetch refreshes it.
    fn invalidate_token(&self);

    /// Installs `listener`. It is called once right away with the current user.
    fn set_change_listener(&self, listener: CredentialChangeListener);
}

pub type CredentialsProviderArc = Arc<dyn CredentialsProvider>;

/// Unauthenticated access: no token, and the user never changes.
#[derive(Clone, Debug, Default)]
pub struct EmptyCredentialsProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> SyncResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        listener(User::unauthenticated());
    }
}

#[derive(Default)]
struct StaticState {
    user: User,
    token: Option<String>,
    listener: Option<CredentialChangeListener>,
    invalidations: usize,
    forced_refreshes: usize,
}

/// Hands out a fixed token per user; [`set_user`](Self::set_user) simulates
/// sign-in changes.
#[derive(Clone, Default)]
pub struct StaticCredentialsProvider {
    state: Arc<Mutex<StaticState>>,
}

impl StaticCredentialsProvider {
    pub fn new(user: User, token: Option<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StaticState {
                user,
                token,
                ..StaticState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StaticState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Switches the signed-in user and notifies the listener.
    pub fn set_user(&self, user: User, token: Option<String>) {
        let listener = {
            let mut state = self.lock();
            state.user = user.clone();
            state.token = token;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(user);
        }
    }

    pub fn invalidation_count(&self) -> usize {
        self.lock().invalidations
    }

    pub fn forced_refresh_count(&self) -> usize {
        self.lock().forced_refreshes
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self, force_refresh: bool) -> SyncResult<Option<Token>> {
        let mut state = self.lock();
        if force_refresh {
            state.forced_refreshes += 1;
        }
        Ok(state.token.clone().map(|value| Token {
            value,
            user: state.user.clone(),
        }))
    }

    fn invalidate_token(&self) {
        self.lock().invalidations += 1;
    }

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        let user = {
            let mut state = self.lock();
            state.listener = Some(Arc::clone(&listener));
            state.user.clone()
        };
        listener(user);
    }
}

/// Auth and app-check providers whose tokens accompany every stream.
#[derive(Clone)]
pub struct StreamCredentialProvider {
    auth: CredentialsProviderArc,
    app_check: Option<CredentialsProviderArc>,
}

impl StreamCredentialProvider {
    pub fn new(auth: CredentialsProviderArc, app_check: Option<CredentialsProviderArc>) -> Self {
        Self { auth, app_check }
    }

    pub fn auth(&self) -> &CredentialsProviderArc {
        &self.auth
    }

    /// Auth failures propagate; app-check failures only drop that token.
    pub async fn fetch(&self, force_refresh: bool) -> SyncResult<StreamCredentials> {
        let auth_token = self.auth.get_token(force_refresh).await?;
        let app_check_token = match &self.app_check {
            Some(provider) => match provider.get_token(force_refresh).await {
                Ok(token) => token,
                Err(err) => {
                    log::warn!("continuing without app check token: {err}");
                    None
                }
            },
            None => None,
        };
        Ok(StreamCredentials {
            auth_token: auth_token.map(|token| token.value),
            app_check_token: app_check_token.map(|token| token.value),
        })
    }

    pub fn invalidate(&self) {
        self.auth.invalidate_token();
        if let Some(provider) = &self.app_check {
            provider.invalidate_token();
        }
    }
}

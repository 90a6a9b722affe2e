use crate::error::KeeperError;
use crate::handlers::{connections, oauth};
use crate::service::credentials_actor::CredentialsHandle;
use axum::{
    Router,
    extract::FromRef,
    routing::{delete, get, post},
};
use axum_extra::extract::cookie::Key;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct KeeperState {
    pub handle: CredentialsHandle,
    pub keeper_key: Arc<str>,
    pub cookie_key: Key,
    pub insecure_cookie: bool,
}

impl KeeperState {
    pub fn new(
        handle: CredentialsHandle,
        keeper_key: Arc<str>,
        cookie_key: Key,
        insecure_cookie: bool,
    ) -> Self {
        Self {
            handle,
            keeper_key,
            cookie_key,
            insecure_cookie,
        }
    }
}

impl FromRef<KeeperState> for Key {
    fn from_ref(state: &KeeperState) -> Self {
        state.cookie_key.clone()
    }
}

/// Cookie encryption key from the configured secret, or a random one.
/// A random key does not survive restarts.
pub fn cookie_key(secret: Option<&str>) -> Result<Key, KeeperError> {
    match secret {
        Some(secret) => Key::try_from(secret.as_bytes()).map_err(|_| {
            KeeperError::Config("basic.cookie_secret must be at least 64 bytes".to_string())
        }),
        None => {
            warn!("basic.cookie_secret not set; generating an ephemeral cookie key");
            Ok(Key::generate())
        }
    }
}

pub fn keeper_router(state: KeeperState) -> Router {
    Router::new()
        .route("/health", get(connections::health))
        .route("/oauth/{provider}/authorize", get(oauth::oauth_authorize))
        .route("/oauth/{provider}/callback", get(oauth::oauth_callback))
        .route("/users/{user_id}/connections", get(connections::list_connections))
        .route(
            "/users/{user_id}/connections/{provider}",
            delete(connections::disconnect),
        )
        .route(
            "/users/{user_id}/connections/{provider}/token",
            post(connections::issue_token),
        )
        .with_state(state)
}

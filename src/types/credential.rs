use crate::types::provider::Provider;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Identifies the one credential slot a user holds for a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub user_id: String,
    pub provider: Provider,
}

impl SlotKey {
    pub fn new(user_id: impl Into<String>, provider: Provider) -> Self {
        Self {
            user_id: user_id.into(),
            provider,
        }
    }
}

/// Token material produced by a successful authorization.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub user_id: String,
    pub provider: Provider,
    pub provider_identity: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a token-endpoint call, already normalised to absolute expiry.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    /// `None` when the provider did not rotate the refresh token.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub id_token: Option<String>,
}

/// A usable bearer token handed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Secret-free view of a credential record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub provider: Provider,
    pub provider_identity: String,
    pub expires_at: DateTime<Utc>,
    pub needs_refresh: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Returns true when a token expiring at `expires_at` must not be handed out
/// as-is, i.e. it is not valid for longer than `margin` from `now`.
pub fn needs_refresh(expires_at: DateTime<Utc>, now: DateTime<Utc>, margin: Duration) -> bool {
    now.checked_add_signed(margin)
        .is_none_or(|deadline| expires_at <= deadline)
}

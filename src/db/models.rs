use crate::types::credential::{AccessToken, ConnectionSummary, needs_refresh};
use crate::types::provider::Provider;
use chrono::{DateTime, Duration, Utc};

/// One row of the `credentials` table.
///
/// Deliberately not `Serialize`: it carries both bearer secrets.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub id: i64,
    pub user_id: String,
    pub provider: Provider,
    pub provider_identity: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        needs_refresh(self.expires_at, now, margin)
    }

    pub fn access_token(&self) -> AccessToken {
        AccessToken {
            token: self.access_token.clone(),
            expires_at: self.expires_at,
        }
    }

    pub fn summary(&self, now: DateTime<Utc>, margin: Duration) -> ConnectionSummary {
        ConnectionSummary {
            provider: self.provider,
            provider_identity: self.provider_identity.clone(),
            expires_at: self.expires_at,
            needs_refresh: self.needs_refresh(now, margin),
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

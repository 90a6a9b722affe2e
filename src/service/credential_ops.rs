use crate::db::models::CredentialRecord;
use crate::db::sqlite::CredentialsStorage;
use crate::error::KeeperError;
use crate::oauth::OauthService;
use crate::types::credential::{AccessToken, ConnectionSummary, NewCredential, SlotKey};
use crate::types::provider::Provider;
use chrono::{Duration, Utc};
use tracing::{debug, error, info, warn};

/// Outcome of looking up a slot without touching the provider.
#[derive(Debug)]
pub enum TokenLookup {
    Fresh(AccessToken),
    Stale(CredentialRecord),
}

/// Store-plus-provider operations on credential slots.
///
/// Every write is a single atomic statement or transaction, so instances can
/// be cloned freely and used concurrently.
#[derive(Clone)]
pub struct CredentialOps {
    storage: CredentialsStorage,
    oauth: OauthService,
    safety_margin: Duration,
}

impl CredentialOps {
    pub fn new(storage: CredentialsStorage, oauth: OauthService, safety_margin: Duration) -> Self {
        Self {
            storage,
            oauth,
            safety_margin,
        }
    }

    pub fn oauth(&self) -> &OauthService {
        &self.oauth
    }

    pub async fn lookup(&self, slot: &SlotKey) -> Result<TokenLookup, KeeperError> {
        let record = self.require_active(slot).await?;
        if record.needs_refresh(Utc::now(), self.safety_margin) {
            Ok(TokenLookup::Stale(record))
        } else {
            Ok(TokenLookup::Fresh(record.access_token()))
        }
    }

    /// Refresh the slot unless a concurrent writer already did.
    pub async fn refresh_slot(&self, slot: &SlotKey) -> Result<AccessToken, KeeperError> {
        match self.lookup(slot).await? {
            TokenLookup::Fresh(token) => {
                debug!(user_id = %slot.user_id, provider = %slot.provider, "token already fresh; skipping refresh");
                Ok(token)
            }
            TokenLookup::Stale(record) => self.refresh_record(record).await,
        }
    }

    async fn refresh_record(&self, record: CredentialRecord) -> Result<AccessToken, KeeperError> {
        let id = record.id;
        let provider = record.provider;
        info!(id, user_id = %record.user_id, %provider, "refreshing access token");

        match self.oauth.refresh(provider, &record.refresh_token).await {
            Ok(grant) => {
                let refresh_token = grant
                    .refresh_token
                    .as_deref()
                    .unwrap_or(record.refresh_token.as_str());
                let written = self
                    .storage
                    .update_tokens(
                        id,
                        &grant.access_token,
                        refresh_token,
                        grant.expires_at,
                        Utc::now(),
                    )
                    .await?;
                if !written {
                    // disconnected or re-authorized while the provider call was out
                    match self.storage.find_active(&record.user_id, provider).await? {
                        None => {
                            debug!(id, user_id = %record.user_id, %provider, "slot disconnected during refresh; dropping result");
                            return Err(KeeperError::NotConnected {
                                user_id: record.user_id,
                                provider,
                            });
                        }
                        Some(current) if !current.needs_refresh(Utc::now(), self.safety_margin) => {
                            debug!(id, current_id = current.id, %provider, "refresh result superseded by a newer write");
                            return Ok(current.access_token());
                        }
                        Some(_) => {
                            debug!(id, %provider, "refresh result not persisted; handing it out");
                        }
                    }
                }
                Ok(AccessToken {
                    token: grant.access_token,
                    expires_at: grant.expires_at,
                })
            }
            Err(e @ KeeperError::RefreshFailed { .. }) => {
                error!(id, user_id = %record.user_id, %provider, error = %e, "refresh rejected; deactivating credential");
                self.storage.deactivate_by_id(id, Utc::now()).await?;
                Err(e)
            }
            Err(e) => {
                warn!(id, %provider, error = %e, "refresh failed (transient); keeping credential");
                Err(e)
            }
        }
    }

    pub async fn store_credential(&self, cred: NewCredential) -> Result<i64, KeeperError> {
        validate_user_id(&cred.user_id)?;
        if cred.access_token.is_empty() || cred.refresh_token.is_empty() {
            return Err(KeeperError::InvalidInput(
                "access_token and refresh_token must be non-empty".to_string(),
            ));
        }
        let id = self.storage.insert_active(&cred, Utc::now()).await?;
        info!(
            id,
            user_id = %cred.user_id,
            provider = %cred.provider,
            identity = %cred.provider_identity,
            "credential stored"
        );
        Ok(id)
    }

    pub async fn disconnect(&self, user_id: &str, provider: Provider) -> Result<(), KeeperError> {
        validate_user_id(user_id)?;
        let touched = self
            .storage
            .deactivate_slot(user_id, provider, Utc::now())
            .await?;
        if touched == 0 {
            debug!(user_id, %provider, "disconnect: no active credential");
        } else {
            info!(user_id, %provider, "credential disconnected");
        }
        Ok(())
    }

    pub async fn connections(&self, user_id: &str) -> Result<Vec<ConnectionSummary>, KeeperError> {
        validate_user_id(user_id)?;
        let now = Utc::now();
        let rows = self.storage.list_active_for_user(user_id).await?;
        Ok(rows
            .iter()
            .map(|r| r.summary(now, self.safety_margin))
            .collect())
    }

    pub async fn history(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Vec<ConnectionSummary>, KeeperError> {
        validate_user_id(user_id)?;
        let now = Utc::now();
        let rows = self.storage.list_slot_history(user_id, provider).await?;
        Ok(rows
            .iter()
            .map(|r| r.summary(now, self.safety_margin))
            .collect())
    }

    async fn require_active(&self, slot: &SlotKey) -> Result<CredentialRecord, KeeperError> {
        validate_user_id(&slot.user_id)?;
        self.storage
            .find_active(&slot.user_id, slot.provider)
            .await?
            .ok_or_else(|| KeeperError::NotConnected {
                user_id: slot.user_id.clone(),
                provider: slot.provider,
            })
    }
}

pub(crate) fn validate_user_id(user_id: &str) -> Result<(), KeeperError> {
    if user_id.trim().is_empty() {
        return Err(KeeperError::InvalidInput("user_id must be non-empty".to_string()));
    }
    Ok(())
}

use crate::error::KeeperError;
use crate::oauth::OauthService;
use crate::service::credential_ops::{CredentialOps, TokenLookup, validate_user_id};
use crate::types::credential::{AccessToken, ConnectionSummary, NewCredential, SlotKey};
use crate::types::provider::Provider;

use futures::future::join_all;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, warn};

pub type TokenResult = Result<AccessToken, KeeperError>;

/// Messages handled by the credentials actor.
#[derive(Debug)]
pub enum CredentialsActorMessage {
    /// Refresh the slot's token, or wait on a refresh already in flight.
    Refresh(SlotKey, RpcReplyPort<TokenResult>),

    // Internal messages (sent by the actor itself)
    /// A refresh task finished; answer everyone waiting on the slot.
    RefreshComplete { slot: SlotKey, result: TokenResult },
}

/// Collaborator-facing handle over the credential store.
///
/// Fresh tokens, writes and listings go straight to the store; only refreshes
/// are routed through the actor so concurrent callers share one provider call.
#[derive(Clone)]
pub struct CredentialsHandle {
    actor: ActorRef<CredentialsActorMessage>,
    ops: CredentialOps,
}

impl CredentialsHandle {
    /// Return a token valid for longer than the safety margin, refreshing if needed.
    pub async fn get_valid_token(&self, user_id: &str, provider: Provider) -> TokenResult {
        validate_user_id(user_id)?;
        let slot = SlotKey::new(user_id, provider);
        match self.ops.lookup(&slot).await? {
            TokenLookup::Fresh(token) => Ok(token),
            TokenLookup::Stale(record) => {
                debug!(id = record.id, user_id, %provider, expires_at = %record.expires_at, "token needs refresh");
                ractor::call!(self.actor, CredentialsActorMessage::Refresh, slot)
                    .map_err(|e| KeeperError::RactorError(format!("Refresh RPC failed: {e}")))?
            }
        }
    }

    /// Make `cred` the slot's only active credential.
    pub async fn store_credential(&self, cred: NewCredential) -> Result<(), KeeperError> {
        self.ops.store_credential(cred).await.map(|_| ())
    }

    /// Deactivate the slot's credential; succeeds when there is none.
    pub async fn disconnect(&self, user_id: &str, provider: Provider) -> Result<(), KeeperError> {
        self.ops.disconnect(user_id, provider).await
    }

    pub async fn connections(&self, user_id: &str) -> Result<Vec<ConnectionSummary>, KeeperError> {
        self.ops.connections(user_id).await
    }

    /// A valid token for every provider the user has connected.
    ///
    /// Providers that get disconnected while this runs are left out; any
    /// other failure is reported per provider.
    pub async fn valid_tokens(
        &self,
        user_id: &str,
    ) -> Result<BTreeMap<Provider, TokenResult>, KeeperError> {
        let providers: Vec<Provider> = self
            .connections(user_id)
            .await?
            .into_iter()
            .map(|c| c.provider)
            .collect();
        let results = join_all(
            providers
                .iter()
                .map(|provider| self.get_valid_token(user_id, *provider)),
        )
        .await;
        Ok(providers
            .into_iter()
            .zip(results)
            .filter(|(_, r)| !matches!(r, Err(KeeperError::NotConnected { .. })))
            .collect())
    }

    /// All records ever stored for the slot, newest first.
    pub async fn history(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Vec<ConnectionSummary>, KeeperError> {
        self.ops.history(user_id, provider).await
    }

    pub fn oauth(&self) -> &OauthService {
        self.ops.oauth()
    }
}

/// Internal state held by ractor-driven credentials actor
struct CredentialsActorState {
    ops: CredentialOps,
    in_flight: HashMap<SlotKey, Vec<RpcReplyPort<TokenResult>>>,
}

/// ractor-based credentials actor
struct CredentialsActor;

#[ractor::async_trait]
impl Actor for CredentialsActor {
    type Msg = CredentialsActorMessage;
    type State = CredentialsActorState;
    type Arguments = CredentialOps;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        ops: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!("CredentialsActor started");
        Ok(CredentialsActorState {
            ops,
            in_flight: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CredentialsActorMessage::Refresh(slot, reply) => {
                self.handle_refresh(state, &myself, slot, reply);
            }
            CredentialsActorMessage::RefreshComplete { slot, result } => {
                self.handle_refresh_complete(state, slot, result);
            }
        }
        Ok(())
    }
}

impl CredentialsActor {
    fn handle_refresh(
        &self,
        state: &mut CredentialsActorState,
        myself: &ActorRef<CredentialsActorMessage>,
        slot: SlotKey,
        reply: RpcReplyPort<TokenResult>,
    ) {
        if let Some(waiters) = state.in_flight.get_mut(&slot) {
            waiters.push(reply);
            debug!(
                user_id = %slot.user_id,
                provider = %slot.provider,
                waiters = waiters.len(),
                "Already refreshing; joined in-flight refresh"
            );
            return;
        }
        state.in_flight.insert(slot.clone(), vec![reply]);

        let ops = state.ops.clone();
        let me = myself.clone();
        tokio::spawn(async move {
            // waiters must always be answered, even if the refresh task dies
            let task_slot = slot.clone();
            let result = match tokio::spawn(async move { ops.refresh_slot(&task_slot).await }).await
            {
                Ok(result) => result,
                Err(e) => {
                    error!(user_id = %slot.user_id, provider = %slot.provider, error = %e, "refresh task aborted");
                    Err(KeeperError::RactorError(format!("refresh task aborted: {e}")))
                }
            };
            if let Err(e) = ractor::cast!(me, CredentialsActorMessage::RefreshComplete { slot, result }) {
                warn!("Actor unreachable, dropping refresh result: {}", e);
            }
        });
    }

    fn handle_refresh_complete(
        &self,
        state: &mut CredentialsActorState,
        slot: SlotKey,
        result: TokenResult,
    ) {
        let Some(waiters) = state.in_flight.remove(&slot) else {
            return;
        };
        debug!(
            user_id = %slot.user_id,
            provider = %slot.provider,
            waiters = waiters.len(),
            ok = result.is_ok(),
            "Refresh complete"
        );
        for reply in waiters {
            // the caller may have given up; nothing to do then
            let _ = reply.send(result.clone());
        }
    }
}

/// Spawn the credentials actor around `ops` and return a handle.
pub async fn spawn(ops: CredentialOps) -> Result<CredentialsHandle, KeeperError> {
    let (actor, _jh) = Actor::spawn(None, CredentialsActor, ops.clone())
        .await
        .map_err(|e| KeeperError::RactorError(format!("failed to spawn CredentialsActor: {e}")))?;
    Ok(CredentialsHandle { actor, ops })
}

use super::endpoints::{ProviderEndpoints, ProviderTokenResponse};
use super::identity::{email_from_id_token, identity_from_profile};
use crate::config::{Config, ProvidersConfig};
use crate::error::{IsRetryable, KeeperError};
use crate::types::credential::{NewCredential, TokenGrant};
use crate::types::provider::Provider;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use oauth2::{AuthorizationCode, PkceCodeChallenge, PkceCodeVerifier, TokenResponse};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Longest `expires_in` taken at face value.
const MAX_TOKEN_LIFETIME: chrono::Duration = chrono::Duration::days(365);

/// Where to send the user, plus the secrets the callback must present back.
#[derive(Debug)]
pub struct AuthorizationRequest {
    pub url: Url,
    pub csrf_state: String,
    pub pkce_verifier: String,
}

/// Service layer composing provider OAuth operations.
///
/// Owns the outbound HTTP client (finite timeouts, no redirects), the retry
/// policy for transient token-endpoint failures and one rate limiter per
/// provider.
#[derive(Clone)]
pub struct OauthService {
    http: reqwest::Client,
    providers: Arc<ProvidersConfig>,
    limiters: Arc<HashMap<Provider, DefaultDirectRateLimiter>>,
    retry_policy: ExponentialBuilder,
    default_expires_in: chrono::Duration,
}

impl OauthService {
    pub fn new(cfg: &Config) -> Result<Self, KeeperError> {
        let refresh = &cfg.refresh;
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("oauth-keeper/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(refresh.connect_timeout())
            .timeout(refresh.request_timeout())
            .redirect(reqwest::redirect::Policy::none());
        if let Some(proxy_url) = refresh.proxy.as_ref() {
            let proxy = reqwest::Proxy::all(proxy_url.as_str())
                .map_err(|e| KeeperError::Config(format!("invalid proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| KeeperError::Config(format!("HTTP client init failed: {e}")))?;

        let per_minute = NonZeroU32::new(refresh.requests_per_minute).ok_or_else(|| {
            KeeperError::Config("refresh.requests_per_minute must be positive".to_string())
        })?;
        let limiters = Provider::ALL
            .into_iter()
            .map(|p| (p, RateLimiter::direct(Quota::per_minute(per_minute))))
            .collect();

        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(refresh.min_retry_delay_ms))
            .with_max_delay(Duration::from_millis(refresh.max_retry_delay_ms))
            .with_max_times(refresh.max_retries)
            .with_jitter();

        info!(
            timeout_ms = refresh.request_timeout_ms,
            max_retries = refresh.max_retries,
            rate_per_minute = refresh.requests_per_minute,
            "OAuth service initialised"
        );

        Ok(Self {
            http,
            providers: Arc::new(cfg.providers.clone()),
            limiters: Arc::new(limiters),
            retry_policy,
            default_expires_in: refresh.default_expires_in()?,
        })
    }

    /// Run the refresh-token grant for `provider`.
    ///
    /// Transient failures are retried within the configured bounds and then
    /// surface as `ProviderUnavailable`; a rejected grant is `RefreshFailed`
    /// straight away.
    pub async fn refresh(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> Result<TokenGrant, KeeperError> {
        let cfg = self.providers.get(provider);

        let payload = (|| async {
            self.wait_for_quota(provider).await;
            ProviderEndpoints::refresh_access_token(cfg, refresh_token, &self.http)
                .await
                .map_err(|e| KeeperError::from_refresh_error(provider, e))
        })
        .retry(self.retry_policy.clone())
        .when(|e: &KeeperError| e.is_retryable())
        .notify(|err: &KeeperError, dur: Duration| {
            warn!(%provider, error = %err, "token refresh retrying after {:?}", dur);
        })
        .await?;

        let grant = self.to_grant(&payload, Utc::now());
        if grant.refresh_token.is_none() && cfg.rotates_refresh_token {
            warn!(%provider, "provider did not rotate the refresh token; keeping the current one");
        }
        debug!(%provider, expires_at = %grant.expires_at, "token refreshed");
        Ok(grant)
    }

    /// Build the consent redirect for `provider`.
    pub fn authorize(&self, provider: Provider) -> Result<AuthorizationRequest, KeeperError> {
        let cfg = self.providers.get(provider);
        if cfg.client_id.is_empty() {
            return Err(KeeperError::Config(format!(
                "{provider} OAuth client is not configured"
            )));
        }
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let (url, csrf) = ProviderEndpoints::build_authorize_url(cfg, challenge)?;
        Ok(AuthorizationRequest {
            url,
            csrf_state: csrf.secret().to_string(),
            pkce_verifier: verifier.secret().to_string(),
        })
    }

    /// Exchange the callback code and resolve which account it belongs to.
    pub async fn complete_authorization(
        &self,
        user_id: &str,
        provider: Provider,
        code: &str,
        pkce_verifier: String,
    ) -> Result<NewCredential, KeeperError> {
        let cfg = self.providers.get(provider);
        self.wait_for_quota(provider).await;
        let payload = ProviderEndpoints::exchange_authorization_code(
            cfg,
            AuthorizationCode::new(code.to_string()),
            PkceCodeVerifier::new(pkce_verifier),
            &self.http,
        )
        .await
        .map_err(|e| KeeperError::from_exchange_error(provider, e))?;

        let grant = self.to_grant(&payload, Utc::now());
        let Some(refresh_token) = grant.refresh_token.clone() else {
            return Err(KeeperError::OauthFlow(format!(
                "{provider} response missing refresh_token; ensure offline access is granted"
            )));
        };
        let provider_identity = self.resolve_identity(provider, &grant).await?;

        Ok(NewCredential {
            user_id: user_id.to_string(),
            provider,
            provider_identity,
            access_token: grant.access_token,
            refresh_token,
            expires_at: grant.expires_at,
        })
    }

    async fn resolve_identity(
        &self,
        provider: Provider,
        grant: &TokenGrant,
    ) -> Result<String, KeeperError> {
        if let Some(email) = grant.id_token.as_deref().and_then(email_from_id_token) {
            return Ok(email);
        }
        let Some(identity_url) = self.providers.get(provider).identity_url.as_ref() else {
            return Err(KeeperError::OauthFlow(format!(
                "{provider} returned no id_token and no identity_url is configured"
            )));
        };
        let profile = ProviderEndpoints::fetch_identity(identity_url, &grant.access_token, &self.http)
            .await
            .map_err(|e| KeeperError::ProviderUnavailable {
                provider,
                reason: format!("identity lookup failed: {e}"),
            })?;
        identity_from_profile(&profile).ok_or_else(|| {
            KeeperError::OauthFlow(format!("{provider} identity response has no account id"))
        })
    }

    async fn wait_for_quota(&self, provider: Provider) {
        if let Some(limiter) = self.limiters.get(&provider) {
            limiter.until_ready().await;
        }
    }

    fn to_grant(&self, payload: &ProviderTokenResponse, now: DateTime<Utc>) -> TokenGrant {
        let lifetime = payload
            .expires_in()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or(self.default_expires_in)
            .min(MAX_TOKEN_LIFETIME);
        TokenGrant {
            access_token: payload.access_token().secret().to_string(),
            refresh_token: payload.refresh_token().map(|t| t.secret().to_string()),
            expires_at: now.checked_add_signed(lifetime).unwrap_or(now),
            id_token: payload.extra_fields().id_token.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::endpoints::IdTokenField;
    use oauth2::basic::BasicTokenType;
    use oauth2::{AccessToken, StandardTokenResponse};

    fn payload(expires_in: Option<Duration>) -> ProviderTokenResponse {
        let mut resp = StandardTokenResponse::new(
            AccessToken::new("a".to_string()),
            BasicTokenType::Bearer,
            IdTokenField::default(),
        );
        resp.set_expires_in(expires_in.as_ref());
        resp
    }

    #[test]
    fn grant_lifetime_is_bounded() {
        let service = OauthService::new(&Config::default()).unwrap();
        let now = Utc::now();

        let grant = service.to_grant(&payload(Some(Duration::from_secs(1_000_000_000_000_000))), now);
        assert_eq!(grant.expires_at, now + MAX_TOKEN_LIFETIME);

        let grant = service.to_grant(&payload(None), now);
        assert_eq!(grant.expires_at, now + chrono::Duration::hours(1));

        let grant = service.to_grant(&payload(Some(Duration::from_secs(600))), now);
        assert_eq!(grant.expires_at, now + chrono::Duration::minutes(10));
    }
}

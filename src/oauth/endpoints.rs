use crate::config::{ClientAuth, ProviderConfig};
use crate::error::{KeeperError, TokenEndpointFailure};

use oauth2::{
    AsyncHttpClient, AuthType, AuthUrl, AuthorizationCode, Client as OAuth2Client, ClientId,
    ClientSecret, CsrfToken, EndpointNotSet, EndpointSet, ExtraTokenFields, HttpClientError,
    HttpRequest, HttpResponse, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken,
    Scope, StandardRevocableToken, StandardTokenResponse, TokenUrl,
    basic::{
        BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
        BasicTokenType,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use url::Url;

/// Stateless provider OAuth endpoints.
pub(super) struct ProviderEndpoints;

impl ProviderEndpoints {
    /// Exchange a refresh token for a new access token.
    pub(super) async fn refresh_access_token(
        cfg: &ProviderConfig,
        refresh_token: &str,
        http_client: &reqwest::Client,
    ) -> Result<ProviderTokenResponse, TokenEndpointFailure> {
        let client = build_oauth2_client(cfg);
        let recorder = StatusRecorder::new(http_client);
        client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&recorder)
            .await
            .map_err(|error| TokenEndpointFailure::new(recorder.status(), error))
    }

    /// Consent page URL for the authorization-code flow with PKCE.
    pub(super) fn build_authorize_url(
        cfg: &ProviderConfig,
        challenge: PkceCodeChallenge,
    ) -> Result<(Url, CsrfToken), KeeperError> {
        if cfg.redirect_url.is_none() {
            return Err(KeeperError::Config(
                "redirect_url is required for the authorization flow".to_string(),
            ));
        }
        let client = build_oauth2_client(cfg);
        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(cfg.scopes.iter().cloned().map(Scope::new))
            .set_pkce_challenge(challenge);
        for (name, value) in &cfg.extra_auth_params {
            request = request.add_extra_param(name.clone(), value.clone());
        }
        Ok(request.url())
    }

    pub(super) async fn exchange_authorization_code(
        cfg: &ProviderConfig,
        code: AuthorizationCode,
        verifier: PkceCodeVerifier,
        http_client: &reqwest::Client,
    ) -> Result<ProviderTokenResponse, TokenEndpointFailure> {
        let client = build_oauth2_client(cfg);
        let recorder = StatusRecorder::new(http_client);
        client
            .exchange_code(code)
            .set_pkce_verifier(verifier)
            .request_async(&recorder)
            .await
            .map_err(|error| TokenEndpointFailure::new(recorder.status(), error))
    }

    /// GET the provider's "who am I" endpoint with a fresh bearer token.
    pub(super) async fn fetch_identity(
        identity_url: &Url,
        access_token: &str,
        http_client: &reqwest::Client,
    ) -> Result<Value, reqwest::Error> {
        http_client
            .get(identity_url.as_str())
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await
    }
}

/// Sends token requests through reqwest and remembers the last HTTP status,
/// which oauth2 drops when the error body does not parse.
struct StatusRecorder {
    http: reqwest::Client,
    status: AtomicU16,
}

impl StatusRecorder {
    fn new(http: &reqwest::Client) -> Self {
        Self {
            http: http.clone(),
            status: AtomicU16::new(0),
        }
    }

    fn status(&self) -> Option<u16> {
        match self.status.load(Ordering::Relaxed) {
            0 => None,
            code => Some(code),
        }
    }
}

impl<'c> AsyncHttpClient<'c> for StatusRecorder {
    type Error = HttpClientError<reqwest::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + Send + 'c>>;

    fn call(&'c self, request: HttpRequest) -> Self::Future {
        Box::pin(async move {
            let response = self.http.call(request).await?;
            self.status
                .store(response.status().as_u16(), Ordering::Relaxed);
            Ok(response)
        })
    }
}

fn build_oauth2_client(cfg: &ProviderConfig) -> ProviderOauth2Client {
    let auth_type = match cfg.client_auth {
        ClientAuth::RequestBody => AuthType::RequestBody,
        ClientAuth::BasicAuth => AuthType::BasicAuth,
    };
    let mut client: ProviderOauth2Client = OAuth2Client::new(ClientId::new(cfg.client_id.clone()))
        .set_auth_uri(AuthUrl::from_url(cfg.auth_url.clone()))
        .set_token_uri(TokenUrl::from_url(cfg.token_url.clone()))
        .set_auth_type(auth_type);
    if let Some(secret) = &cfg.client_secret {
        client = client.set_client_secret(ClientSecret::new(secret.clone()));
    }
    if let Some(redirect) = &cfg.redirect_url {
        client = client.set_redirect_uri(RedirectUrl::from_url(redirect.clone()));
    }
    client
}

/// Google returns an OpenID `id_token` next to the access token.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub(super) struct IdTokenField {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}
impl ExtraTokenFields for IdTokenField {}

pub(super) type ProviderTokenResponse = StandardTokenResponse<IdTokenField, BasicTokenType>;

pub(super) type ProviderOauth2Client = OAuth2Client<
    BasicErrorResponse,
    ProviderTokenResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

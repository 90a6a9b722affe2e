use crate::middleware::RequireKeyAuth;
use crate::service::credential_ops::validate_user_id;
use crate::types::provider::Provider;
use crate::{KeeperError, router::KeeperState};
use axum::{
    Json,
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, PrivateCookieJar, SameSite};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use time::Duration;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

const CSRF_COOKIE: &str = "oauth_csrf_token";
const PKCE_COOKIE: &str = "oauth_pkce_verifier";
const USER_COOKIE: &str = "oauth_user_id";
const PROVIDER_COOKIE: &str = "oauth_provider";

/// Values stashed in encrypted cookies between authorize and callback.
struct OauthSession {
    csrf_state: String,
    pkce_verifier: String,
    user_id: String,
    provider: String,
}

/// GET /oauth/{provider}/authorize?user_id=... -> redirects to the provider's consent page.
pub async fn oauth_authorize(
    _auth: RequireKeyAuth,
    State(state): State<KeeperState>,
    Path(provider): Path<String>,
    Query(query): Query<AuthorizeQuery>,
    jar: PrivateCookieJar,
) -> Result<Response, KeeperError> {
    let provider: Provider = provider.parse()?;
    let user_id = query.user_id.unwrap_or_default();
    validate_user_id(&user_id)?;

    let request = state.handle.oauth().authorize(provider)?;
    let session = OauthSession {
        csrf_state: request.csrf_state,
        pkce_verifier: request.pkce_verifier,
        user_id,
        provider: provider.as_str().to_string(),
    };
    let jar = store_oauth_cookies(jar, session, state.insecure_cookie);

    info!(%provider, "Dispatching OAuth redirect");
    Ok((jar, Redirect::temporary(request.url.as_str())).into_response())
}

/// GET /oauth/{provider}/callback -> exchanges the code and stores the credential.
pub async fn oauth_callback(
    State(state): State<KeeperState>,
    Path(provider): Path<String>,
    Query(query): Query<AuthCallbackQuery>,
    jar: PrivateCookieJar,
) -> Response {
    let (session, jar) = match load_oauth_session(jar, state.insecure_cookie) {
        Ok(data) => data,
        Err((jar, err)) => return respond_with_error(jar, err),
    };

    if let Some(err) = query.error.as_deref() {
        let detail = query.error_description.as_deref().unwrap_or("");
        warn!(provider = %provider, error = err, "provider denied authorization");
        return respond_with_error(
            jar,
            KeeperError::OauthFlow(format!("authorization denied: {err} {detail}").trim().to_string()),
        );
    }

    let provider: Provider = match provider.parse() {
        Ok(p) => p,
        Err(err) => return respond_with_error(jar, err),
    };
    if session.provider != provider.as_str() {
        return respond_with_error(
            jar,
            KeeperError::OauthFlow("callback provider does not match the authorization".to_string()),
        );
    }

    let Some(state_param) = query.state.as_deref() else {
        return respond_with_error(
            jar,
            KeeperError::OauthFlow("missing `state` in callback".to_string()),
        );
    };
    if !bool::from(state_param.as_bytes().ct_eq(session.csrf_state.as_bytes())) {
        return respond_with_error(
            jar,
            KeeperError::OauthFlow("CSRF token mismatch".to_string()),
        );
    }

    let Some(code) = query.code.as_deref() else {
        return respond_with_error(
            jar,
            KeeperError::OauthFlow("missing `code` in callback".to_string()),
        );
    };

    let credential = match state
        .handle
        .oauth()
        .complete_authorization(&session.user_id, provider, code, session.pkce_verifier)
        .await
    {
        Ok(cred) => cred,
        Err(err) => return respond_with_error(jar, err),
    };

    let body = json!({
        "user_id": credential.user_id,
        "provider": credential.provider,
        "provider_identity": credential.provider_identity,
        "expires_at": credential.expires_at,
    });
    if let Err(err) = state.handle.store_credential(credential).await {
        return respond_with_error(jar, err);
    }

    info!(%provider, "OAuth callback stored credential");
    (jar, Json(body)).into_response()
}

fn store_oauth_cookies(
    jar: PrivateCookieJar,
    session: OauthSession,
    insecure: bool,
) -> PrivateCookieJar {
    jar.add(build_cookie(CSRF_COOKIE, session.csrf_state, insecure))
        .add(build_cookie(PKCE_COOKIE, session.pkce_verifier, insecure))
        .add(build_cookie(USER_COOKIE, session.user_id, insecure))
        .add(build_cookie(PROVIDER_COOKIE, session.provider, insecure))
}

fn load_oauth_session(
    jar: PrivateCookieJar,
    insecure: bool,
) -> Result<(OauthSession, PrivateCookieJar), (PrivateCookieJar, KeeperError)> {
    let read = |name: &str| jar.get(name).map(|c| c.value().to_owned());
    let session = match (
        read(CSRF_COOKIE),
        read(PKCE_COOKIE),
        read(USER_COOKIE),
        read(PROVIDER_COOKIE),
    ) {
        (Some(csrf_state), Some(pkce_verifier), Some(user_id), Some(provider)) => OauthSession {
            csrf_state,
            pkce_verifier,
            user_id,
            provider,
        },
        _ => {
            let jar = clear_oauth_cookies(jar, insecure);
            return Err((
                jar,
                KeeperError::OauthFlow("OAuth session cookies missing or expired".to_string()),
            ));
        }
    };

    Ok((session, clear_oauth_cookies(jar, insecure)))
}

fn clear_oauth_cookies(jar: PrivateCookieJar, insecure: bool) -> PrivateCookieJar {
    [CSRF_COOKIE, PKCE_COOKIE, USER_COOKIE, PROVIDER_COOKIE]
        .into_iter()
        .fold(jar, |jar, name| jar.remove(clear_cookie(name, insecure)))
}

fn build_cookie(name: &str, value: String, insecure: bool) -> Cookie<'static> {
    Cookie::build(Cookie::new(name.to_string(), value))
        .path("/")
        .http_only(true)
        .secure(!insecure)
        .same_site(SameSite::Lax)
        .max_age(Duration::minutes(15))
        .build()
}

fn clear_cookie(name: &str, insecure: bool) -> Cookie<'static> {
    Cookie::build(Cookie::new(name.to_string(), ""))
        .path("/")
        .http_only(true)
        .secure(!insecure)
        .same_site(SameSite::Lax)
        .build()
}

fn respond_with_error(jar: PrivateCookieJar, err: KeeperError) -> Response {
    (jar, err.into_response()).into_response()
}

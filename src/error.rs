use crate::types::provider::Provider;
use axum::{Json, http::StatusCode, response::IntoResponse};
use oauth2::basic::BasicErrorResponseType;
use oauth2::reqwest::Error as ReqwestClientError;
use oauth2::{HttpClientError, RequestTokenError, StandardErrorResponse};
use serde::Serialize;
use sqlx::Error as SqlxError;
use thiserror::Error as ThisError;
use tracing::error;

pub type TokenEndpointError = RequestTokenError<
    HttpClientError<ReqwestClientError>,
    StandardErrorResponse<BasicErrorResponseType>,
>;

/// A failed token-endpoint call and the HTTP status it answered with, if any.
#[derive(Debug)]
pub struct TokenEndpointFailure {
    pub status: Option<u16>,
    pub error: TokenEndpointError,
}

impl TokenEndpointFailure {
    pub fn new(status: Option<u16>, error: TokenEndpointError) -> Self {
        Self { status, error }
    }
}

/// Cloneable so a single refresh outcome can be handed to every waiter.
#[derive(Debug, Clone, ThisError)]
pub enum KeeperError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown provider `{0}`")]
    UnknownProvider(String),

    #[error("No active {provider} credential for user {user_id}")]
    NotConnected { user_id: String, provider: Provider },

    #[error("{provider} rejected the refresh token: {reason}")]
    RefreshFailed { provider: Provider, reason: String },

    #[error("{provider} token endpoint unavailable: {reason}")]
    ProviderUnavailable { provider: Provider, reason: String },

    #[error("Credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("OAuth flow error: {0}")]
    OauthFlow(String),

    #[error("Ractor error: {0}")]
    RactorError(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for KeeperError {
    fn is_retryable(&self) -> bool {
        matches!(self, KeeperError::ProviderUnavailable { .. })
    }
}

impl KeeperError {
    /// The user has to go through the authorization flow again.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            KeeperError::NotConnected { .. } | KeeperError::RefreshFailed { .. }
        )
    }

    /// Text a task agent can relay to the end user.
    pub fn user_message(&self) -> String {
        match self {
            KeeperError::NotConnected { provider, .. }
            | KeeperError::RefreshFailed { provider, .. } => {
                format!("Please reconnect your {provider} account to continue.")
            }
            KeeperError::ProviderUnavailable { .. }
            | KeeperError::StoreUnavailable(_)
            | KeeperError::RactorError(_)
            | KeeperError::Config(_) => {
                "A temporary problem occurred; please try again shortly.".to_string()
            }
            KeeperError::InvalidInput(msg) | KeeperError::OauthFlow(msg) => msg.clone(),
            KeeperError::UnknownProvider(p) => format!("Unsupported provider `{p}`."),
        }
    }

    /// Classify a refresh-token grant failure.
    ///
    /// A 400/401/403 answer is a rejection whatever its body says, and so is
    /// an OAuth error body under any other non-transient status. 5xx, 408,
    /// 429, transport failures and timeouts say nothing about the token.
    pub fn from_refresh_error(provider: Provider, failure: TokenEndpointFailure) -> Self {
        let TokenEndpointFailure { status, error } = failure;
        let transient_status = status.is_some_and(is_transient_status);
        let rejection_status = status.is_some_and(is_rejection_status);
        match error {
            RequestTokenError::ServerResponse(err) => match err.error() {
                BasicErrorResponseType::Extension(code) if is_transient_oauth_code(code) => {
                    KeeperError::ProviderUnavailable {
                        provider,
                        reason: describe_oauth_error(&err),
                    }
                }
                _ if transient_status => KeeperError::ProviderUnavailable {
                    provider,
                    reason: describe_oauth_error(&err),
                },
                _ => KeeperError::RefreshFailed {
                    provider,
                    reason: describe_oauth_error(&err),
                },
            },
            RequestTokenError::Request(req_e) => KeeperError::ProviderUnavailable {
                provider,
                reason: format!("request failed: {req_e}"),
            },
            RequestTokenError::Parse(parse_err, _body) if rejection_status => {
                KeeperError::RefreshFailed {
                    provider,
                    reason: format!("HTTP {} with unparseable body: {parse_err}", status_text(status)),
                }
            }
            RequestTokenError::Parse(parse_err, _body) => KeeperError::ProviderUnavailable {
                provider,
                reason: format!("unparseable token response: {parse_err}"),
            },
            RequestTokenError::Other(s) if rejection_status => KeeperError::RefreshFailed {
                provider,
                reason: format!("HTTP {}: {s}", status_text(status)),
            },
            RequestTokenError::Other(s) => KeeperError::ProviderUnavailable { provider, reason: s },
        }
    }

    /// Classify an authorization-code exchange failure.
    pub fn from_exchange_error(provider: Provider, failure: TokenEndpointFailure) -> Self {
        match failure.error {
            RequestTokenError::ServerResponse(err) => {
                KeeperError::OauthFlow(format!("{provider}: {}", describe_oauth_error(&err)))
            }
            error => match Self::from_refresh_error(
                provider,
                TokenEndpointFailure::new(failure.status, error),
            ) {
                KeeperError::RefreshFailed { reason, .. } => KeeperError::OauthFlow(reason),
                transient => transient,
            },
        }
    }
}

fn is_rejection_status(status: u16) -> bool {
    matches!(status, 400 | 401 | 403)
}

fn is_transient_status(status: u16) -> bool {
    status >= 500 || matches!(status, 408 | 429)
}

fn status_text(status: Option<u16>) -> String {
    status.map_or_else(|| "?".to_string(), |s| s.to_string())
}

fn is_transient_oauth_code(code: &str) -> bool {
    matches!(code, "server_error" | "temporarily_unavailable")
}

fn describe_oauth_error(err: &StandardErrorResponse<BasicErrorResponseType>) -> String {
    match err.error_description() {
        Some(desc) => format!("{}: {desc}", err.error()),
        None => err.error().to_string(),
    }
}

impl From<SqlxError> for KeeperError {
    fn from(e: SqlxError) -> Self {
        KeeperError::StoreUnavailable(e.to_string())
    }
}

impl From<url::ParseError> for KeeperError {
    fn from(e: url::ParseError) -> Self {
        KeeperError::Config(format!("URL parse error: {e}"))
    }
}

impl IntoResponse for KeeperError {
    fn into_response(self) -> axum::response::Response {
        let message = self.user_message();
        let (status, code) = match &self {
            KeeperError::NotConnected { .. } | KeeperError::RefreshFailed { .. } => {
                (StatusCode::CONFLICT, "RECONNECT_REQUIRED")
            }
            KeeperError::ProviderUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "PROVIDER_UNAVAILABLE")
            }
            KeeperError::StoreUnavailable(_)
            | KeeperError::RactorError(_)
            | KeeperError::Config(_) => {
                error!(error = %self, "request failed with internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
            KeeperError::InvalidInput(_) | KeeperError::UnknownProvider(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST")
            }
            KeeperError::OauthFlow(_) => (StatusCode::BAD_REQUEST, "OAUTH_FLOW_ERROR"),
        };
        let body = ApiErrorBody {
            code: code.to_string(),
            message,
        };
        (status, Json(ApiErrorResponse { error: body })).into_response()
    }
}

/// Standardized API error response body
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_response(status: u16, kind: BasicErrorResponseType) -> TokenEndpointFailure {
        TokenEndpointFailure::new(
            Some(status),
            RequestTokenError::ServerResponse(StandardErrorResponse::new(
                kind,
                Some("Token has been expired or revoked.".to_string()),
                None,
            )),
        )
    }

    fn empty_body(status: Option<u16>) -> TokenEndpointFailure {
        TokenEndpointFailure::new(
            status,
            RequestTokenError::Other("server returned empty error response".to_string()),
        )
    }

    #[test]
    fn rejected_grant_is_terminal() {
        let err = KeeperError::from_refresh_error(
            Provider::Gmail,
            server_response(400, BasicErrorResponseType::InvalidGrant),
        );
        assert!(matches!(err, KeeperError::RefreshFailed { .. }));
        assert!(err.requires_reconnect());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[test]
    fn oauth_server_error_is_transient() {
        let err = KeeperError::from_refresh_error(
            Provider::Airtable,
            server_response(
                400,
                BasicErrorResponseType::Extension("temporarily_unavailable".to_string()),
            ),
        );
        assert!(err.is_retryable());

        let err = KeeperError::from_refresh_error(
            Provider::Airtable,
            server_response(502, BasicErrorResponseType::InvalidGrant),
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn unauthorized_status_is_terminal_whatever_the_body() {
        let err = KeeperError::from_refresh_error(Provider::Gmail, empty_body(Some(401)));
        assert!(matches!(err, KeeperError::RefreshFailed { .. }));
        assert!(err.to_string().contains("HTTP 401"));

        let err = KeeperError::from_refresh_error(Provider::Gmail, empty_body(Some(403)));
        assert!(matches!(err, KeeperError::RefreshFailed { .. }));
    }

    #[test]
    fn outage_statuses_are_transient() {
        for status in [408, 429, 500, 503] {
            let err = KeeperError::from_refresh_error(Provider::Gmail, empty_body(Some(status)));
            assert!(err.is_retryable(), "status {status} should be retryable");
        }
        let err = KeeperError::from_refresh_error(Provider::Gmail, empty_body(None));
        assert!(matches!(err, KeeperError::ProviderUnavailable { .. }));
    }

    #[test]
    fn rejected_code_exchange_is_a_flow_error() {
        let err = KeeperError::from_exchange_error(
            Provider::Gmail,
            server_response(400, BasicErrorResponseType::InvalidGrant),
        );
        assert!(matches!(err, KeeperError::OauthFlow(_)));

        let err = KeeperError::from_exchange_error(Provider::Gmail, empty_body(Some(401)));
        assert!(matches!(err, KeeperError::OauthFlow(_)));
    }

    #[test]
    fn reconnect_errors_share_a_message() {
        let not_connected = KeeperError::NotConnected {
            user_id: "u1".to_string(),
            provider: Provider::Gmail,
        };
        let refresh_failed = KeeperError::RefreshFailed {
            provider: Provider::Gmail,
            reason: "invalid_grant".to_string(),
        };
        assert_eq!(not_connected.user_message(), refresh_failed.user_message());
        assert!(not_connected.user_message().contains("reconnect"));
    }

    #[test]
    fn status_codes() {
        let resp = KeeperError::StoreUnavailable("disk I/O error".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let resp = KeeperError::ProviderUnavailable {
            provider: Provider::Gmail,
            reason: "timeout".to_string(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

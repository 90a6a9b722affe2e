use axum::Json;
use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, StatusCode, request::Parts};
use axum::response::{IntoResponse, Response};
use headers::authorization::Bearer;
use headers::{Authorization, HeaderMapExt};
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::router::KeeperState;

const KEY_HEADER: &str = "x-keeper-key";

/// Ensure the inbound request carries the service key.
/// Accepts either:
/// - Header: `Authorization: Bearer <key>`
/// - Header: `x-keeper-key: <key>`
/// - Query string: `?key=...`
///
/// An empty configured key rejects everything.
pub fn ensure_authorized(
    headers: &HeaderMap,
    query: Option<&str>,
    expected: &str,
) -> Result<(), Response> {
    if !expected.is_empty() {
        let key_ok = |candidate: &str| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes()));

        if let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>()
            && key_ok(bearer.token())
        {
            return Ok(());
        }

        if let Some(hv) = headers.get(KEY_HEADER).and_then(|v| v.to_str().ok())
            && key_ok(hv)
        {
            return Ok(());
        }

        if let Some(qs) = query {
            for (k, v) in url::form_urlencoded::parse(qs.as_bytes()) {
                if k == "key" && key_ok(&v) {
                    return Ok(());
                }
            }
        }
    }

    Err((
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"code": "UNAUTHORIZED", "message": "invalid or missing key"}})),
    )
        .into_response())
}

#[derive(Debug, Clone, Copy)]
pub struct RequireKeyAuth;

impl FromRequestParts<KeeperState> for RequireKeyAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &KeeperState,
    ) -> Result<Self, Self::Rejection> {
        ensure_authorized(&parts.headers, parts.uri.query(), &state.keeper_key)?;
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn accepts_each_key_location() {
        let mut bearer = HeaderMap::new();
        bearer.insert("authorization", HeaderValue::from_static("Bearer pwd"));
        assert!(ensure_authorized(&bearer, None, "pwd").is_ok());

        let mut custom = HeaderMap::new();
        custom.insert(KEY_HEADER, HeaderValue::from_static("pwd"));
        assert!(ensure_authorized(&custom, None, "pwd").is_ok());

        assert!(ensure_authorized(&HeaderMap::new(), Some("user_id=u1&key=pwd"), "pwd").is_ok());
    }

    #[test]
    fn rejects_wrong_or_unconfigured_key() {
        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, HeaderValue::from_static("nope"));
        let resp = ensure_authorized(&headers, Some("key=nope"), "pwd").unwrap_err();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        assert!(ensure_authorized(&HeaderMap::new(), Some("key="), "").is_err());
    }
}

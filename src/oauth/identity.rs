//! Working out which provider account a token belongs to.

use base64::Engine;
use serde_json::Value;

/// Pull the `email` claim out of an OpenID `id_token` without verifying it.
/// Only ever used as a display label.
pub fn email_from_id_token(id_token: &str) -> Option<String> {
    let payload_b64 = id_token.split('.').nth(1)?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64.trim_end_matches('='))
        .ok()?;
    let payload_json: Value = serde_json::from_slice(&decoded).ok()?;
    payload_json
        .get("email")
        .and_then(|e| e.as_str())
        .map(str::to_string)
}

/// Identity from a userinfo / whoami document: email, else account id, else subject.
pub fn identity_from_profile(profile: &Value) -> Option<String> {
    ["email", "id", "sub"]
        .iter()
        .filter_map(|key| profile.get(key).and_then(|v| v.as_str()))
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

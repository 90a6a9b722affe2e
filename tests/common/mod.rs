#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Duration, Utc};
use oauth_keeper::CredentialsHandle;
use oauth_keeper::config::Config;
use oauth_keeper::db::{CredentialsStorage, connect};
use oauth_keeper::types::{NewCredential, Provider};
use serde_json::json;
use std::{
    fs,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::net::TcpListener;
use url::Url;

/// How the fake token endpoint answers.
#[derive(Debug, Clone)]
pub enum Mode {
    /// 200 with a new access token; includes a rotated refresh token when set.
    Grant { rotate: bool },
    /// An OAuth error body with the given status.
    Reject(StatusCode, &'static str),
    /// 503 with a non-JSON body.
    Unavailable,
    /// The given status with a plain-text (possibly empty) body.
    Plain(StatusCode, &'static str),
    /// 200 with an `expires_in` far past any calendar.
    HugeExpiry,
    /// Wait this many milliseconds, then grant.
    Delayed(u64),
    /// Sleep past any sane client timeout, then grant.
    Slow,
}

#[derive(Clone)]
struct FakeState {
    calls: Arc<AtomicUsize>,
    mode: Arc<Mutex<Mode>>,
    last_authorization: Arc<Mutex<Option<String>>>,
    last_form: Arc<Mutex<String>>,
}

/// Token and identity endpoints standing in for a real provider.
pub struct FakeProvider {
    pub base: Url,
    state: FakeState,
}

impl FakeProvider {
    pub async fn spawn(mode: Mode) -> Self {
        let state = FakeState {
            calls: Arc::new(AtomicUsize::new(0)),
            mode: Arc::new(Mutex::new(mode)),
            last_authorization: Arc::new(Mutex::new(None)),
            last_form: Arc::new(Mutex::new(String::new())),
        };
        let app = Router::new()
            .route("/token", post(token))
            .route("/whoami", get(whoami))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake provider");
        let addr = listener.local_addr().expect("fake provider has no address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let base = Url::parse(&format!("http://{addr}/")).expect("bad fake provider url");
        Self { base, state }
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.state.mode.lock().expect("mode lock poisoned") = mode;
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state
            .last_authorization
            .lock()
            .expect("auth lock poisoned")
            .clone()
    }

    pub fn last_form(&self) -> String {
        self.state.last_form.lock().expect("form lock poisoned").clone()
    }

    pub fn url(&self, path: &str) -> Url {
        self.base.join(path).expect("bad fake provider path")
    }
}

async fn token(State(state): State<FakeState>, headers: HeaderMap, body: String) -> Response {
    let n = state.calls.fetch_add(1, Ordering::SeqCst) + 1;
    *state.last_authorization.lock().expect("auth lock poisoned") = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *state.last_form.lock().expect("form lock poisoned") = body.clone();

    let mode = state.mode.lock().expect("mode lock poisoned").clone();
    let code_grant = body.contains("grant_type=authorization_code");
    match mode {
        Mode::Grant { rotate } => grant(n, rotate || code_grant),
        Mode::Reject(status, code) => (status, Json(json!({"error": code}))).into_response(),
        Mode::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "upstream down").into_response(),
        Mode::Plain(status, body) => (status, body).into_response(),
        Mode::HugeExpiry => Json(json!({
            "access_token": format!("access-{n}"),
            "token_type": "Bearer",
            "expires_in": 1_000_000_000_000_000u64,
        }))
        .into_response(),
        Mode::Delayed(ms) => {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            grant(n, false)
        }
        Mode::Slow => {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            grant(n, false)
        }
    }
}

fn grant(n: usize, with_refresh: bool) -> Response {
    let mut body = json!({
        "access_token": format!("access-{n}"),
        "token_type": "Bearer",
        "expires_in": 3600,
    });
    if with_refresh {
        body["refresh_token"] = json!(format!("refresh-{n}"));
    }
    Json(body).into_response()
}

async fn whoami() -> Json<serde_json::Value> {
    Json(json!({"id": "usrFake123", "email": "owner@example.com"}))
}

/// Config with both providers pointed at `fake` and retries disabled.
pub fn test_config(fake: &FakeProvider) -> Config {
    let mut cfg = Config::default();
    cfg.basic.keeper_key = "pwd".to_string();
    cfg.basic.insecure_cookie = true;
    cfg.refresh.max_retries = 0;
    cfg.refresh.request_timeout_ms = 2_000;
    cfg.refresh.connect_timeout_ms = 1_000;
    for provider in Provider::ALL {
        let p = cfg.providers.get_mut(provider);
        p.client_id = format!("{provider}-client");
        p.client_secret = Some(format!("{provider}-secret"));
        p.token_url = fake.url("token");
        p.identity_url = Some(fake.url("whoami"));
        p.redirect_url = Some(
            Url::parse(&format!("http://localhost:8000/oauth/{provider}/callback"))
                .expect("bad redirect url"),
        );
    }
    cfg
}

/// A fresh SQLite file path under the temp dir.
pub fn temp_database(label: &str) -> (PathBuf, String) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "oauth-keeper-{label}-{}-{}.sqlite",
        std::process::id(),
        nanos
    ));
    let url = format!("sqlite:{}", path.display());
    (path, url)
}

/// A running credential service over its own SQLite file.
pub struct Harness {
    pub handle: CredentialsHandle,
    pub database_url: String,
    path: PathBuf,
}

impl Harness {
    pub async fn start(label: &str, cfg: &Config) -> Self {
        let (path, database_url) = temp_database(label);
        let mut cfg = cfg.clone();
        cfg.basic.database_url = database_url.clone();
        let handle = oauth_keeper::service::start(&cfg)
            .await
            .expect("failed to start credential service");
        Self {
            handle,
            database_url,
            path,
        }
    }

    /// A second view of the same database, for checking what was persisted.
    pub async fn storage(&self) -> CredentialsStorage {
        let pool = connect(&self.database_url)
            .await
            .expect("failed to open test database");
        CredentialsStorage::new(pool)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn credential(user_id: &str, provider: Provider, expires_at: DateTime<Utc>) -> NewCredential {
    NewCredential {
        user_id: user_id.to_string(),
        provider,
        provider_identity: format!("{user_id}@{provider}"),
        access_token: "stored-access".to_string(),
        refresh_token: "stored-refresh".to_string(),
        expires_at,
    }
}

pub fn in_minutes(minutes: i64) -> DateTime<Utc> {
    Utc::now() + Duration::minutes(minutes)
}

use mimalloc::MiMalloc;
use oauth_keeper::config::Config;
use oauth_keeper::router::{KeeperState, cookie_key, keeper_router};
use oauth_keeper::types::provider::Provider;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.basic.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        listen_addr = %cfg.basic.listen_addr,
        database_url = %cfg.basic.database_url,
        proxy = %cfg.refresh.proxy.as_ref().map(|u| u.as_str()).unwrap_or("<none>"),
        loglevel = %cfg.basic.loglevel,
        safety_margin_secs = cfg.refresh.safety_margin_secs,
    );
    if cfg.basic.keeper_key.is_empty() {
        warn!("basic.keeper_key is empty; every keyed route will answer 401");
    }
    for provider in Provider::ALL {
        if cfg.providers.get(provider).client_id.is_empty() {
            warn!(%provider, "OAuth client_id not configured; authorization and refresh will fail");
        }
    }

    let handle = oauth_keeper::service::start(&cfg).await?;

    let key = cookie_key(cfg.basic.cookie_secret.as_deref())?;
    let keeper_key: Arc<str> = Arc::from(cfg.basic.keeper_key.as_str());
    let state = KeeperState::new(handle, keeper_key, key, cfg.basic.insecure_cookie);
    let app = keeper_router(state);

    let listener = TcpListener::bind(&cfg.basic.listen_addr).await?;
    info!("HTTP server listening on {}", cfg.basic.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

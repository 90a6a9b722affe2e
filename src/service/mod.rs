pub mod credential_ops;
pub mod credentials_actor;

use crate::config::Config;
use crate::db::sqlite::{CredentialsStorage, SqlitePool, connect};
use crate::error::KeeperError;
use crate::oauth::OauthService;
use credential_ops::CredentialOps;
use credentials_actor::CredentialsHandle;
use tracing::info;

/// Open the configured database and start the credential service.
pub async fn start(cfg: &Config) -> Result<CredentialsHandle, KeeperError> {
    let pool = connect(&cfg.basic.database_url).await?;
    start_with_pool(pool, cfg).await
}

/// Start the credential service on an existing pool, creating the schema if needed.
pub async fn start_with_pool(
    pool: SqlitePool,
    cfg: &Config,
) -> Result<CredentialsHandle, KeeperError> {
    let storage = CredentialsStorage::new(pool);
    storage.init_schema().await?;
    let oauth = OauthService::new(cfg)?;
    let ops = CredentialOps::new(storage, oauth, cfg.refresh.safety_margin()?);
    info!(
        safety_margin_secs = cfg.refresh.safety_margin_secs,
        "credential service ready"
    );
    credentials_actor::spawn(ops).await
}

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod oauth;
pub mod router;
pub mod service;
pub mod types;

pub use error::KeeperError;
pub use oauth::OauthService;
pub use service::credentials_actor::CredentialsHandle;

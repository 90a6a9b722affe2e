pub mod credential;
pub mod provider;

pub use credential::{AccessToken, ConnectionSummary, NewCredential, SlotKey, TokenGrant};
pub use provider::Provider;

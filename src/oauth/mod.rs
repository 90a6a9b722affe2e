//! OAuth 2.0 plumbing for the supported providers.

mod endpoints;
pub mod identity;
pub mod service;

pub use service::{AuthorizationRequest, OauthService};

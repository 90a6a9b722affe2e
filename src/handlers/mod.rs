pub mod connections;
pub mod oauth;

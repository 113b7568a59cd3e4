//! Usage: Loopback OAuth2 authorization-code flow with PKCE.
//!
//! `flow` orchestrates one attempt; `callback_server` captures the browser redirect;
//! `token_exchange` and `userinfo` talk to the provider.

pub mod browser;
pub(crate) mod callback_server;
pub mod flow;
pub(crate) mod pkce;
pub(crate) mod providers;
pub(crate) mod token_exchange;
pub mod userinfo;

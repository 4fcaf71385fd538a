//! QQ platform adapter: credential lifecycle, proxied outbound calls, and
//! the persistent gateway session with its supervisor.
//!
//! Layering, leaves first: [`token::TokenManager`] owns the access
//! credential and renews it autonomously; [`api::ApiClient`] issues
//! authenticated calls through the reverse proxy, gated on credential
//! freshness; [`session::Session`] drives one connect → identify →
//! heartbeat → dispatch connection; [`supervisor::Supervisor`] keeps exactly
//! one active session alive across drops.

pub mod api;
mod backoff;
pub mod protocol;
pub mod session;
pub mod supervisor;
#[cfg(test)]
pub(crate) mod testutil;
pub mod token;
pub mod transport;

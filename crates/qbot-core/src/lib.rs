//! Framework-agnostic core for the QQ bot: configuration, error taxonomy,
//! logging setup, domain newtypes, and the ports message-handling
//! collaborators plug into.
//!
//! The platform adapter (credential lifecycle, outbound calls, gateway
//! session) lives in `qbot-gateway` and only depends on this crate.

pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod ports;

pub use errors::{Error, Result};

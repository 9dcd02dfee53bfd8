//! pk-core: Core abstractions for portal-keeper
//!
//! This crate provides the single-instance lock, the network allow-list
//! check, configuration loading and the portal capability trait shared
//! by the agent binary.

pub mod config;
pub mod error;
pub mod lockfile;
pub mod network;
pub mod traits;

pub use error::{ConfigError, LockError, PkError, PortalError};

//! Core error types for portal-keeper

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the portal-keeper ecosystem
#[derive(Error, Debug)]
pub enum PkError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Instance lock error
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Portal interaction error
    #[error("Portal error: {0}")]
    Portal(#[from] PortalError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Missing or blank required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Errors raised while claiming the instance lock
///
/// Any of these makes the run unsafe, so callers treat them as fatal.
#[derive(Error, Debug)]
pub enum LockError {
    /// Filesystem failure on the lock file
    #[error("Lock file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another process won every attempt to create the lock file
    #[error("Lock file {0:?} kept changing hands while acquiring")]
    Contended(PathBuf),
}

/// Portal interaction errors
#[derive(Error, Debug)]
pub enum PortalError {
    /// An operation exceeded its time budget
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP transport failure
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The current page has no form with the requested inputs
    #[error("Form not found: {0}")]
    FormNotFound(String),

    /// A URL could not be built from the portal base address
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// No page has been loaded yet
    #[error("No page loaded")]
    NoPage,

    /// The client was shut down
    #[error("Portal client closed")]
    Closed,
}

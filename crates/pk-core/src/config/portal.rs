//! Portal credentials and network allow-list configuration

use serde::Deserialize;
use std::fmt;

use crate::error::ConfigError;
use crate::network::AllowList;

/// User agent presented to the portal unless configured otherwise
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// A credential that must never reach the logs
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for submission to the portal only
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Unvalidated settings from one configuration source
///
/// Every field is optional so that a file, the environment and the command
/// line can each supply part of the configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortalSettings {
    /// Portal account name, also the marker of an authenticated page
    pub username: Option<String>,

    /// Portal account password
    pub password: Option<String>,

    /// Base address of the portal, e.g. `http://10.5.50.1`
    pub base_url: Option<String>,

    /// Comma-separated allow-list (`10.0.0.0/24,192.168.1.*`)
    pub allowed_networks: Option<String>,

    /// Accept self-signed or otherwise invalid TLS certificates
    pub accept_invalid_certs: Option<bool>,

    /// User agent sent with every request
    pub user_agent: Option<String>,
}

impl PortalSettings {
    /// Layer `overrides` on top of `self`; set fields in `overrides` win
    pub fn merge(self, overrides: PortalSettings) -> Self {
        Self {
            username: overrides.username.or(self.username),
            password: overrides.password.or(self.password),
            base_url: overrides.base_url.or(self.base_url),
            allowed_networks: overrides.allowed_networks.or(self.allowed_networks),
            accept_invalid_certs: overrides.accept_invalid_certs.or(self.accept_invalid_certs),
            user_agent: overrides.user_agent.or(self.user_agent),
        }
    }

    /// Check that all required settings are present and well formed
    pub fn validate(self) -> Result<PortalConfig, ConfigError> {
        let username = required("username", self.username)?;
        // Whitespace may be part of a password
        let password = self
            .password
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingField("password".to_string()))?;
        let base_url = normalize_base_url(&required("base_url", self.base_url)?)?;
        let allowed_networks_raw = required("allowed_networks", self.allowed_networks)?;

        let allowed_networks = AllowList::parse(&allowed_networks_raw);
        if allowed_networks.is_empty() {
            tracing::warn!(
                "No usable entry in allowed_networks {:?}; every network will be rejected",
                allowed_networks_raw
            );
        }

        let user_agent = self
            .user_agent
            .map(|ua| ua.trim().to_string())
            .filter(|ua| !ua.is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        Ok(PortalConfig {
            username,
            password: Secret::new(password),
            base_url,
            allowed_networks,
            allowed_networks_raw,
            accept_invalid_certs: self.accept_invalid_certs.unwrap_or(true),
            user_agent,
        })
    }
}

fn required(field: &str, value: Option<String>) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

/// Strip trailing slashes and make sure the result is an absolute http(s) URL
fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim_end_matches('/');
    let url = reqwest::Url::parse(trimmed)
        .map_err(|e| ConfigError::Invalid(format!("base_url {:?}: {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "base_url {:?}: scheme must be http or https",
            raw
        )));
    }

    Ok(trimmed.to_string())
}

/// Validated configuration for one run
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub username: String,
    pub password: Secret,
    /// Base address without trailing slash
    pub base_url: String,
    pub allowed_networks: AllowList,
    /// The allow-list as configured, for status lines
    pub allowed_networks_raw: String,
    pub accept_invalid_certs: bool,
    pub user_agent: String,
}

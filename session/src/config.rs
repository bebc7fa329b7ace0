//! Session engine configuration module.
//!
//! Parses configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `GATEKEEPER_COOKIE_SECRET` | Yes | - | 32 raw bytes, or base64/base64url of 32 bytes |
//! | `GATEKEEPER_COOKIE_FORMAT` | No | compact | `compact` or `rich` |
//! | `GATEKEEPER_COOKIE_COMPRESS` | No | false | LZ4-compress rich cookies |
//! | `GATEKEEPER_CLIENT_ID` | Yes | - | OAuth2 client id |
//! | `GATEKEEPER_CLIENT_SECRET` | No | empty | OAuth2 client secret |
//! | `GATEKEEPER_AZURE_TENANT` | No | common | Azure AD tenant |
//! | `GATEKEEPER_PROTECTED_RESOURCE` | No | `https://graph.microsoft.com` | Resource tokens are requested for |
//! | `GATEKEEPER_SCOPE` | No | openid | Requested scope |
//! | `GATEKEEPER_PROMPT` | No | empty | `prompt` login parameter |
//! | `GATEKEEPER_ACR_VALUES` | No | empty | `acr_values` login parameter |
//! | `GATEKEEPER_ALLOWED_GROUPS` | No | empty | Comma-separated group names |
//! | `GATEKEEPER_REFRESH_LOCK_TTL_SECS` | No | 30 | Refresh lock lifetime |

use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::cipher::AesGcmCipher;
use crate::codec::{CookieFormat, SessionCodec};
use crate::providers::{AzureProvider, Provider, ProviderError};
use crate::refresh::RefreshCoordinator;

/// Default refresh lock lifetime in seconds.
const DEFAULT_REFRESH_LOCK_TTL_SECS: u64 = 30;

/// Default Azure tenant.
const DEFAULT_TENANT: &str = "common";

/// Default requested scope.
const DEFAULT_SCOPE: &str = "openid";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Secret the cookie cipher key is derived from.
    pub cookie_secret: String,

    /// Cookie wire format.
    pub cookie_format: CookieFormat,

    /// Whether rich cookies are LZ4-compressed.
    pub cookie_compress: bool,

    /// OAuth2 client id.
    pub client_id: String,

    /// OAuth2 client secret.
    pub client_secret: String,

    /// Azure AD tenant.
    pub azure_tenant: String,

    /// Resource override. `None` keeps the provider default.
    pub protected_resource: Option<Url>,

    /// Requested scope.
    pub scope: String,

    /// `prompt` login parameter.
    pub prompt: String,

    /// `acr_values` login parameter.
    pub acr_values: String,

    /// Groups allowed through authorization. Empty allows everyone.
    pub allowed_groups: Vec<String>,

    /// Lifetime of a refresh lock.
    pub refresh_lock_ttl: Duration,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `GATEKEEPER_COOKIE_SECRET` or `GATEKEEPER_CLIENT_ID` is missing
    /// - the cookie secret does not yield a 32-byte key
    /// - any other variable has an invalid format
    ///
    /// # Example
    ///
    /// ```no_run
    /// use gatekeeper_session::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Cookies use the {} format", config.cookie_format);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let cookie_secret = required_env("GATEKEEPER_COOKIE_SECRET")?;
        let client_id = required_env("GATEKEEPER_CLIENT_ID")?;

        let cookie_format = match optional_env("GATEKEEPER_COOKIE_FORMAT")? {
            Some(value) => value.parse::<CookieFormat>().map_err(|message| ConfigError::InvalidFormat {
                var: "GATEKEEPER_COOKIE_FORMAT".to_string(),
                message,
            })?,
            None => CookieFormat::default(),
        };

        let protected_resource = match optional_env("GATEKEEPER_PROTECTED_RESOURCE")? {
            Some(value) => Some(Url::parse(&value).map_err(|e| ConfigError::InvalidFormat {
                var: "GATEKEEPER_PROTECTED_RESOURCE".to_string(),
                message: e.to_string(),
            })?),
            None => None,
        };

        let config = Self {
            cookie_secret,
            cookie_format,
            cookie_compress: parse_bool_env("GATEKEEPER_COOKIE_COMPRESS"),
            client_id,
            client_secret: optional_env("GATEKEEPER_CLIENT_SECRET")?.unwrap_or_default(),
            azure_tenant: optional_env("GATEKEEPER_AZURE_TENANT")?
                .unwrap_or_else(|| DEFAULT_TENANT.to_string()),
            protected_resource,
            scope: optional_env("GATEKEEPER_SCOPE")?.unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            prompt: optional_env("GATEKEEPER_PROMPT")?.unwrap_or_default(),
            acr_values: optional_env("GATEKEEPER_ACR_VALUES")?.unwrap_or_default(),
            allowed_groups: parse_list_env("GATEKEEPER_ALLOWED_GROUPS")?,
            refresh_lock_ttl: parse_lock_ttl()?,
        };

        config.validate()?;

        if config.client_secret.is_empty() {
            warn!("GATEKEEPER_CLIENT_SECRET is not set; token requests will be sent without one");
        }

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Ensures the cookie secret yields a usable key and that compression is
    /// only requested for the rich format.
    fn validate(&self) -> Result<(), ConfigError> {
        self.cipher()?;

        if self.cookie_compress && self.cookie_format == CookieFormat::Compact {
            warn!("GATEKEEPER_COOKIE_COMPRESS has no effect with the compact cookie format");
        }

        Ok(())
    }

    /// Builds the cookie cipher.
    pub fn cipher(&self) -> Result<AesGcmCipher, ConfigError> {
        AesGcmCipher::from_secret(&self.cookie_secret).map_err(|e| ConfigError::InvalidFormat {
            var: "GATEKEEPER_COOKIE_SECRET".to_string(),
            message: e.to_string(),
        })
    }

    /// Builds the session codec.
    pub fn codec(&self) -> Result<SessionCodec, ConfigError> {
        Ok(SessionCodec::new(Arc::new(self.cipher()?), self.cookie_format))
    }

    /// Builds the Azure provider described by this configuration.
    pub fn azure_provider(&self) -> Result<AzureProvider, ProviderError> {
        let mut provider = AzureProvider::new()?;
        provider.configure(&self.azure_tenant);

        let data = provider.data_mut();
        data.client_id = self.client_id.clone();
        data.client_secret = self.client_secret.clone();
        data.scope = self.scope.clone();
        data.prompt = self.prompt.clone();
        data.acr_values = self.acr_values.clone();
        data.set_allowed_groups(self.allowed_groups.iter().cloned());
        if let Some(resource) = &self.protected_resource {
            data.protected_resource = Some(resource.clone());
        }

        Ok(provider)
    }

    /// Builds a refresh coordinator for `provider` whose locks live for
    /// `refresh_lock_ttl`.
    pub fn refresh_coordinator(&self, provider: Arc<dyn Provider>) -> RefreshCoordinator {
        RefreshCoordinator::new(provider, self.refresh_lock_ttl)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("cookie_secret", &"[REDACTED]")
            .field("cookie_format", &self.cookie_format)
            .field("cookie_compress", &self.cookie_compress)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("azure_tenant", &self.azure_tenant)
            .field("protected_resource", &self.protected_resource)
            .field("scope", &self.scope)
            .field("prompt", &self.prompt)
            .field("acr_values", &self.acr_values)
            .field("allowed_groups", &self.allowed_groups)
            .field("refresh_lock_ttl", &self.refresh_lock_ttl)
            .finish()
    }
}

/// Reads a required, non-empty environment variable.
fn required_env(name: &str) -> Result<String, ConfigError> {
    match optional_env(name)? {
        Some(value) => Ok(value),
        None => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

/// Reads an optional environment variable. Empty values count as unset.
fn optional_env(name: &str) -> Result<Option<String>, ConfigError> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse a comma-separated list, skipping empty items.
fn parse_list_env(name: &str) -> Result<Vec<String>, ConfigError> {
    Ok(optional_env(name)?
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default())
}

/// Parse the GATEKEEPER_REFRESH_LOCK_TTL_SECS environment variable.
fn parse_lock_ttl() -> Result<Duration, ConfigError> {
    let secs = match optional_env("GATEKEEPER_REFRESH_LOCK_TTL_SECS")? {
        Some(value) => value.parse::<u64>().map_err(|e| ConfigError::InvalidFormat {
            var: "GATEKEEPER_REFRESH_LOCK_TTL_SECS".to_string(),
            message: e.to_string(),
        })?,
        None => DEFAULT_REFRESH_LOCK_TTL_SECS,
    };

    if secs == 0 {
        return Err(ConfigError::ValidationError(
            "GATEKEEPER_REFRESH_LOCK_TTL_SECS must be greater than zero".to_string(),
        ));
    }

    Ok(Duration::from_secs(secs))
}

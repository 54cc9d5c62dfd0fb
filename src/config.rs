//! Startup configuration and credential handling.
//!
//! The two Raccoon secrets are read once from the environment at process
//! start and are immutable afterwards. Missing either is a fatal
//! configuration error: the server refuses to start rather than run with
//! empty credentials.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable holding the Raccoon API secret key.
pub const ENV_SECRET_KEY: &str = "RACCOON_SECRET_KEY";

/// Environment variable holding the Raccoon passcode.
pub const ENV_PASSCODE: &str = "RACCOON_PASSCODE";

/// Environment variable overriding the LAM API base URL.
pub const ENV_BASE_URL: &str = "RACCOON_API_BASE_URL";

/// Environment variable overriding the per-request timeout, in seconds.
pub const ENV_REQUEST_TIMEOUT: &str = "RACCOON_REQUEST_TIMEOUT_SECS";

/// Default LAM API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.flyingraccoon.tech";

/// Default per-request timeout for synchronous LAM calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The Raccoon credential pair.
///
/// Both fields are private and only reachable through accessors so that no
/// serializer or format string can pick them up by accident. The `Debug`
/// impl redacts both values.
#[derive(Clone)]
pub struct Credentials {
    secret_key: String,
    passcode: String,
}

impl Credentials {
    /// Build a credential pair, rejecting empty values.
    pub fn new(secret_key: impl Into<String>, passcode: impl Into<String>) -> Result<Self> {
        let secret_key = secret_key.into();
        let passcode = passcode.into();
        if secret_key.trim().is_empty() {
            return Err(Error::Configuration(format!("{ENV_SECRET_KEY} is empty")));
        }
        if passcode.trim().is_empty() {
            return Err(Error::Configuration(format!("{ENV_PASSCODE} is empty")));
        }
        Ok(Self {
            secret_key,
            passcode,
        })
    }

    /// The API secret key, used as the bearer token on every request.
    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    /// The Raccoon passcode, sent as request metadata on every call.
    pub fn passcode(&self) -> &str {
        &self.passcode
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("secret_key", &"<redacted>")
            .field("passcode", &"<redacted>")
            .finish()
    }
}

/// Immutable process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Raccoon credential pair.
    pub credentials: Credentials,
    /// LAM API base URL (no trailing slash).
    pub base_url: String,
    /// Per-request timeout for synchronous LAM calls.
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Fails with [`Error::Configuration`] if either secret is missing, so
    /// callers can refuse to start before any tool is registered.
    pub fn from_env() -> Result<Self> {
        let secret_key = require_env(ENV_SECRET_KEY)?;
        let passcode = require_env(ENV_PASSCODE)?;
        let base_url = std::env::var(ENV_BASE_URL)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let request_timeout = match std::env::var(ENV_REQUEST_TIMEOUT) {
            Ok(raw) => {
                let secs: u64 = raw.parse().map_err(|_| {
                    Error::Configuration(format!(
                        "{ENV_REQUEST_TIMEOUT} must be an integer number of seconds, got {raw:?}"
                    ))
                })?;
                Duration::from_secs(secs)
            }
            Err(_) => DEFAULT_REQUEST_TIMEOUT,
        };

        Ok(Self {
            credentials: Credentials::new(secret_key, passcode)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    /// Build a configuration directly, bypassing the environment.
    pub fn new(credentials: Credentials, base_url: impl Into<String>) -> Self {
        Self {
            credentials,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Error::Configuration(format!(
            "{name} not found in environment variables"
        ))),
    }
}

//! Connection configuration.
//!
//! DESIGN
//! ======
//! [`ConnectionConfig`] is an immutable snapshot. Every connect call may carry
//! a [`ConfigPatch`]; the patch is merged into a new snapshot (last write wins)
//! and the previous one is left untouched, so an attempt that is already in
//! flight keeps dialing with the values it started with.
//!
//! The patch uses the option names of the wire-facing configuration surface
//! (`minTs`, `maxTs`, `jitter`, `timeout`, `cert`, `key`, `ca`, ...). A zero
//! numeric value means "unset".

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_MIN_BACKOFF_MS: u64 = 200;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 600_000;
pub const DEFAULT_JITTER: f64 = 1.2;
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;

const ENV_HOST: &str = "TETHER_HOST";
const ENV_PORT: &str = "TETHER_PORT";
const ENV_MIN_TS: &str = "TETHER_MIN_TS_MS";
const ENV_MAX_TS: &str = "TETHER_MAX_TS_MS";
const ENV_JITTER: &str = "TETHER_JITTER";
const ENV_TIMEOUT: &str = "TETHER_TIMEOUT_MS";
const ENV_SERVER_NAME: &str = "TETHER_SERVER_NAME";
const ENV_CERT: &str = "TETHER_CERT";
const ENV_KEY: &str = "TETHER_KEY";
const ENV_CA: &str = "TETHER_CA";

// =============================================================================
// TYPES
// =============================================================================

/// Whether a link speaks raw TCP or TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Plain,
    Encrypted,
}

/// PEM-encoded TLS material. Any field present switches the session to TLS.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    /// Client certificate chain, presented when `key` is also set.
    pub cert: Option<String>,
    /// Private key matching `cert`.
    pub key: Option<String>,
    /// Trusted CA certificates for verifying the server.
    pub ca: Vec<String>,
}

impl TlsMaterial {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cert.is_none() && self.key.is_none() && self.ca.is_empty()
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert", &self.cert.as_ref().map(String::len))
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("ca", &self.ca.len())
            .finish()
    }
}

/// Immutable per-attempt connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// First reconnect delay, and the value the delay resets to.
    pub min_backoff: Duration,
    /// Upper bound for the reconnect delay.
    pub max_backoff: Duration,
    /// Growth multiplier applied after each failure-driven reconnect.
    pub jitter: f64,
    /// Default per-invocation timeout.
    pub timeout: Duration,
    pub tls: TlsMaterial,
    /// Name checked against the server certificate. Defaults to `host`.
    pub server_name: Option<String>,
    /// Resolve pending invocations with a closed-connection error on disconnect
    /// instead of letting them run into their timeout.
    pub fail_pending_on_disconnect: bool,
}

/// Partial configuration, merged over a [`ConnectionConfig`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub min_ts: Option<u64>,
    pub max_ts: Option<u64>,
    pub jitter: Option<f64>,
    pub timeout: Option<u64>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Option<Vec<String>>,
    pub server_name: Option<String>,
    pub fail_pending_on_disconnect: Option<bool>,
}

impl ConfigPatch {
    /// A patch that only moves the endpoint.
    pub fn endpoint(host: impl Into<String>, port: u16) -> Self {
        Self { host: Some(host.into()), port: Some(port), ..Self::default() }
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl ConnectionConfig {
    /// Defaults for everything but the endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            min_backoff: Duration::from_millis(DEFAULT_MIN_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            jitter: DEFAULT_JITTER,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            tls: TlsMaterial::default(),
            server_name: None,
            fail_pending_on_disconnect: false,
        }
    }

    /// Build a full config from a patch; `host` and `port` are required.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for an absent endpoint and
    /// [`ConfigError::Invalid`] when the result fails [`Self::validate`].
    pub fn from_patch(patch: ConfigPatch) -> Result<Self, ConfigError> {
        let host = patch.host.clone().ok_or(ConfigError::Missing("host"))?;
        let port = patch.port.ok_or(ConfigError::Missing("port"))?;
        Self::new(host, port).merged(&patch)
    }

    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `TETHER_HOST`, `TETHER_PORT`
    ///
    /// Optional:
    /// - `TETHER_MIN_TS_MS`: default 200
    /// - `TETHER_MAX_TS_MS`: default 600000
    /// - `TETHER_JITTER`: default 1.2
    /// - `TETHER_TIMEOUT_MS`: default 2000
    /// - `TETHER_SERVER_NAME`: TLS name, default host
    /// - `TETHER_CERT`, `TETHER_KEY`: PEM file paths of the client identity
    /// - `TETHER_CA`: comma separated PEM file paths of trusted CAs
    ///
    /// # Errors
    ///
    /// Fails when the endpoint is missing, a PEM file cannot be read, or the
    /// resulting config is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`Self::from_env`] over an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup(ENV_HOST).ok_or(ConfigError::Missing(ENV_HOST))?;
        let port = env_parse::<u16>(&lookup, ENV_PORT).ok_or(ConfigError::Missing(ENV_PORT))?;

        let ca = match lookup(ENV_CA) {
            Some(list) => Some(
                list.split(',')
                    .map(str::trim)
                    .filter(|path| !path.is_empty())
                    .map(read_pem)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        let patch = ConfigPatch {
            host: Some(host),
            port: Some(port),
            min_ts: env_parse(&lookup, ENV_MIN_TS),
            max_ts: env_parse(&lookup, ENV_MAX_TS),
            jitter: env_parse(&lookup, ENV_JITTER),
            timeout: env_parse(&lookup, ENV_TIMEOUT),
            cert: lookup(ENV_CERT).as_deref().map(read_pem).transpose()?,
            key: lookup(ENV_KEY).as_deref().map(read_pem).transpose()?,
            ca,
            server_name: lookup(ENV_SERVER_NAME),
            fail_pending_on_disconnect: None,
        };
        Self::from_patch(patch)
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl ConnectionConfig {
    #[must_use]
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_fail_pending_on_disconnect(mut self, enabled: bool) -> Self {
        self.fail_pending_on_disconnect = enabled;
        self
    }
}

// =============================================================================
// QUERIES
// =============================================================================

impl ConnectionConfig {
    /// `host:port`, as handed to the resolver.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn session_mode(&self) -> SessionMode {
        if self.tls.is_empty() { SessionMode::Plain } else { SessionMode::Encrypted }
    }

    #[must_use]
    pub fn tls_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }

    /// Merge a patch into a new snapshot. `self` is left as it was.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the merged config fails
    /// [`Self::validate`].
    pub fn merged(&self, patch: &ConfigPatch) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(host) = &patch.host {
            next.host.clone_from(host);
        }
        if let Some(port) = patch.port.filter(|p| *p != 0) {
            next.port = port;
        }
        if let Some(ms) = patch.min_ts.filter(|ms| *ms > 0) {
            next.min_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = patch.max_ts.filter(|ms| *ms > 0) {
            next.max_backoff = Duration::from_millis(ms);
        }
        if let Some(jitter) = patch.jitter.filter(|j| j.abs() > f64::EPSILON) {
            next.jitter = jitter;
        }
        if let Some(ms) = patch.timeout.filter(|ms| *ms > 0) {
            next.timeout = Duration::from_millis(ms);
        }
        if let Some(cert) = &patch.cert {
            next.tls.cert = Some(cert.clone());
        }
        if let Some(key) = &patch.key {
            next.tls.key = Some(key.clone());
        }
        if let Some(ca) = &patch.ca {
            next.tls.ca.clone_from(ca);
        }
        if let Some(name) = &patch.server_name {
            next.server_name = Some(name.clone());
        }
        if let Some(enabled) = patch.fail_pending_on_disconnect {
            next.fail_pending_on_disconnect = enabled;
        }
        next.validate()?;
        Ok(next)
    }

    /// Check the invariants the backoff and timeout arithmetic rely on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(invalid("host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("port", "must not be zero"));
        }
        if self.min_backoff < Duration::from_millis(1) {
            return Err(invalid("minTs", "must be at least 1ms"));
        }
        if self.min_backoff > self.max_backoff {
            return Err(invalid("maxTs", "must not be below minTs"));
        }
        if !self.jitter.is_finite() || self.jitter <= 1.0 {
            return Err(invalid("jitter", "must be a finite multiplier above 1"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.to_owned() }
}

fn env_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    let parsed = raw.trim().parse::<T>().ok();
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "config: ignoring unparsable variable");
    }
    parsed
}

fn read_pem(path: &str) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: PathBuf::from(path), source })
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

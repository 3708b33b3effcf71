//! Client and server configuration.
//!
//! Configuration is handed to the core as plain values. Nothing in the library reads
//! files or the environment; the command-line front end is the only place that sources
//! a [`NomadConfig`] from JSON.
//!
//! # Overview
//!
//! - [`NomadConfig`] - Top-level container
//! - [`ClientConfig`] - Dispatch switch, default endpoint, timeout, digest algorithm
//! - [`ServerConfig`] - Module probe paths, sandbox directory, call depth limit
//!
//! # Presets
//!
//! - [`NomadConfig::disabled()`] - Every nomadic method runs locally
//! - [`NomadConfig::loopback()`] - Client and server in one process, short timeout
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use nomad::config::{ClientConfig, NomadConfig};
//!
//! let config = NomadConfig {
//!     client: ClientConfig::new()
//!         .with_default_endpoint("net.tcp://build-01:9000/nomad")
//!         .with_timeout(Duration::from_secs(30)),
//!     ..Default::default()
//! };
//! assert!(config.client.enabled);
//! ```

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::utils::DigestAlgorithm;

/// Default client response timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default mailbox poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default interpreter call depth limit.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Durations are written as whole milliseconds in configuration files.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NomadConfig {
    /// Execution client settings
    pub client: ClientConfig,
    /// Execution server settings
    pub server: ServerConfig,
}

impl NomadConfig {
    /// Configuration under which nomadic methods always run locally.
    #[must_use]
    pub fn disabled() -> Self {
        NomadConfig {
            client: ClientConfig::new().with_enabled(false),
            ..Default::default()
        }
    }

    /// Configuration for a client and server sharing one process.
    ///
    /// Uses the `loopback` endpoint and a five second timeout so a hung test fails fast.
    #[must_use]
    pub fn loopback() -> Self {
        NomadConfig {
            client: ClientConfig::new()
                .with_default_endpoint("loopback")
                .with_timeout(Duration::from_secs(5)),
            ..Default::default()
        }
    }
}

/// Execution client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Global nomad dispatch switch. When `false` every nomadic method runs locally.
    pub enabled: bool,

    /// Endpoint used when neither the call nor an addressed parameter names one.
    pub default_endpoint: Option<String>,

    /// Response timeout. [`Duration::ZERO`] waits forever.
    #[serde(with = "millis")]
    pub timeout: Duration,

    /// Sleep between mailbox polls.
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// Algorithm for module content digests.
    pub digest: DigestAlgorithm,

    /// Full name of the parameter type that carries a destination endpoint.
    ///
    /// A parameter whose declared type equals this name and whose value is a string
    /// selects the endpoint for that call.
    pub address_type: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            enabled: true,
            default_endpoint: None,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            digest: DigestAlgorithm::Sha1,
            address_type: None,
        }
    }
}

impl ClientConfig {
    /// Creates the default client configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the global dispatch switch.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the default endpoint.
    #[must_use]
    pub fn with_default_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.default_endpoint = Some(endpoint.into());
        self
    }

    /// Sets the response timeout, [`Duration::ZERO`] for none.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the mailbox poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the module digest algorithm.
    #[must_use]
    pub fn with_digest(mut self, digest: DigestAlgorithm) -> Self {
        self.digest = digest;
        self
    }

    /// Sets the addressed parameter type.
    #[must_use]
    pub fn with_address_type(mut self, type_name: impl Into<String>) -> Self {
        self.address_type = Some(type_name.into());
        self
    }

    /// The timeout as an `Option`, `None` meaning wait forever.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            None
        } else {
            Some(self.timeout)
        }
    }
}

/// Execution server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directories searched for module files, in order.
    pub probe_paths: Vec<PathBuf>,

    /// Root of the per-hash upload and bundle extraction directories.
    pub sandbox_dir: PathBuf,

    /// Interpreter call depth limit.
    pub max_call_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            probe_paths: Vec::new(),
            sandbox_dir: std::env::temp_dir().join("nomad-sandbox"),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl ServerConfig {
    /// Creates the default server configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a module probe directory.
    #[must_use]
    pub fn with_probe_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.probe_paths.push(path.into());
        self
    }

    /// Sets the sandbox root.
    #[must_use]
    pub fn with_sandbox_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.sandbox_dir = path.into();
        self
    }

    /// Sets the interpreter call depth limit.
    #[must_use]
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// The directory holding uploaded and extracted files of module version `hash`.
    #[must_use]
    pub fn sandbox_for(&self, hash: &str) -> PathBuf {
        self.sandbox_dir.join(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NomadConfig::default();
        assert!(config.client.enabled);
        assert_eq!(config.client.deadline(), Some(DEFAULT_TIMEOUT));
        assert_eq!(config.server.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
        assert!(!NomadConfig::disabled().client.enabled);
    }

    #[test]
    fn test_zero_timeout_waits_forever() {
        let client = ClientConfig::new().with_timeout(Duration::ZERO);
        assert_eq!(client.deadline(), None);
    }

    #[test]
    fn test_sandbox_is_keyed_by_hash() {
        let server = ServerConfig::new().with_sandbox_dir("/srv/nomad");
        assert_eq!(
            server.sandbox_for("abc123"),
            PathBuf::from("/srv/nomad/abc123")
        );
    }
}

//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::node::DEFAULT_PORT;
use crate::session::{SessionConfig, DEFAULT_POLL_INTERVAL};
use crate::types::GREETING;

/// Default node host.
pub const DEFAULT_HOST: &str = "localhost";

/// Keystore location relative to the home directory.
pub const DEFAULT_KEYSTORE: &str = ".dhtchat/keystore.json";

/// Everything a CLI invocation needs to reach the node and the keystore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Node host name.
    pub host: String,

    /// Node port.
    pub port: u16,

    /// Keystore file.
    pub keystore_path: PathBuf,

    /// Pause between empty polls.
    pub poll_interval: Duration,

    /// First line each side sends.
    pub greeting: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            keystore_path: default_keystore_path(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            greeting: GREETING.to_string(),
        }
    }
}

impl ClientConfig {
    /// Session tunables derived from this config.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            greeting: self.greeting.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

/// `~/.dhtchat/keystore.json`, or relative to the working directory when
/// there is no home directory.
pub fn default_keystore_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_KEYSTORE))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_KEYSTORE))
}

/// Log filter for a `-v` count: none is warnings only, one adds info, more
/// adds debug.
pub fn log_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

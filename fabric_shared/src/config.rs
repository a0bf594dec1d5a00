//! Endpoint configuration.
//!
//! Options mirror the constructor options of both roles; JSON parsing is
//! provided for apps that load them from config files (file IO left to the
//! app). Socket path layout lives here too so both roles agree on it.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Domain used when none is configured.
pub const DEFAULT_DOMAIN: &str = "default";

/// Wire text encoding. Only UTF-8 is implemented; the option is kept so
/// configs stay shape-compatible.
pub const DEFAULT_ENCODING: &str = "utf8";

/// Prefix of every socket path the fabric creates.
const SOCKET_PREFIX: &str = "/tmp/IPC.io.";

/// Server constructor options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Domain name selecting the rendezvous socket path.
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Enables diagnostic logging.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            encoding: default_encoding(),
            verbose: false,
        }
    }
}

impl ServerOptions {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn rendezvous_path(&self) -> PathBuf {
        rendezvous_path(&self.domain)
    }
}

/// Client constructor options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Friendly name, unique per domain. Defaults to a fresh hex UUID.
    #[serde(default = "fresh_channel_id")]
    pub name: String,
    #[serde(default)]
    pub verbose: bool,
    /// Delay before a reconnect attempt after the client goes offline.
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            encoding: default_encoding(),
            name: fresh_channel_id(),
            verbose: false,
            reconnect_ms: default_reconnect_ms(),
        }
    }
}

impl ClientOptions {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn rendezvous_path(&self) -> PathBuf {
        rendezvous_path(&self.domain)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_encoding() -> String {
    DEFAULT_ENCODING.to_string()
}

fn default_reconnect_ms() -> u64 {
    2000
}

/// Shared rendezvous socket path for a domain.
pub fn rendezvous_path(domain: &str) -> PathBuf {
    PathBuf::from(format!("{SOCKET_PREFIX}{domain}"))
}

/// Per-client unique socket path.
pub fn unique_path(domain: &str, channel_id: &str) -> PathBuf {
    PathBuf::from(format!("{SOCKET_PREFIX}{domain}.{channel_id}"))
}

/// Fresh hex UUIDv4 with hyphens stripped, used for channel ids, delivery
/// ids, and default client names.
pub fn fresh_channel_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_the_domain() {
        assert_eq!(
            rendezvous_path("d").to_string_lossy(),
            "/tmp/IPC.io.d"
        );
        assert_eq!(
            unique_path("d", "abc123").to_string_lossy(),
            "/tmp/IPC.io.d.abc123"
        );
    }

    #[test]
    fn defaults_apply_from_empty_json() {
        let opts = ServerOptions::from_json_str("{}").unwrap();
        assert_eq!(opts.domain, "default");
        assert_eq!(opts.encoding, "utf8");
        assert!(!opts.verbose);

        let opts = ClientOptions::from_json_str("{}").unwrap();
        assert_eq!(opts.reconnect_ms, 2000);
        assert_eq!(opts.name.len(), 32);
    }

    #[test]
    fn channel_ids_are_dashless_hex() {
        let id = fresh_channel_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// Server configuration consumed by the networking core.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name; its bytes (plus a trailing newline) form the optional
    /// proxy preamble on single-socket ports.
    pub server_name: String,
    /// Address to bind when `bind_only_global_address` is set.
    pub ip: String,
    /// Bind acceptors to `ip` instead of 0.0.0.0.
    pub bind_only_global_address: bool,
    /// Inbound frames allowed per source per second before disconnection.
    pub max_packets_per_second: u32,
    /// Reactor worker threads; 0 selects the hardware concurrency.
    pub worker_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            server_name: "Bastion".to_string(),
            ip: "127.0.0.1".to_string(),
            bind_only_global_address: false,
            max_packets_per_second: 25,
            worker_threads: 0,
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }

    /// The preamble some proxy front-ends send before the first frame.
    #[inline]
    pub fn proxy_preamble(&self) -> String {
        let mut preamble = self.server_name.clone();
        preamble.push('\n');
        preamble
    }

    /// Worker thread count with the hardware-concurrency default applied.
    #[inline]
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.server_name, "Bastion");
        assert_eq!(config.max_packets_per_second, 25);
        assert!(!config.bind_only_global_address);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ServerConfig = serdeconv::from_toml_str(
            r#"
server_name = "OT"
max_packets_per_second = 10
"#,
        )
        .unwrap();

        assert_eq!(config.server_name, "OT");
        assert_eq!(config.max_packets_per_second, 10);
        assert_eq!(config.ip, "127.0.0.1");
    }

    #[test]
    fn test_proxy_preamble_has_newline() {
        let mut config = ServerConfig::default();
        config.server_name = "OT".to_string();
        assert_eq!(config.proxy_preamble(), "OT\n");
    }

    #[test]
    fn test_effective_workers_floor() {
        let config = ServerConfig::default();
        assert!(config.effective_workers() >= 1);

        let mut pinned = ServerConfig::default();
        pinned.worker_threads = 3;
        assert_eq!(pinned.effective_workers(), 3);
    }
}

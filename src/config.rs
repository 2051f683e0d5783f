use crate::watcher::{NotifierOptions, DEFAULT_DEBOUNCE_MS};
use anyhow::{bail, Context, Result};
use flate2::Compression;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4200;

/// Runtime configuration, built once at startup and shared read-only
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorConfig {
    /// Destination host for the watcher; bind host for the listener. Empty means
    /// localhost when dialing and all interfaces when binding.
    pub host: String,
    pub port: u16,
    /// Watch root (watcher role)
    pub watch: PathBuf,
    pub listen: bool,
    /// Output root (listener role)
    pub root: PathBuf,
    pub debounce_ms: u64,
    /// Change events that may wait while a transfer is in flight
    pub queue_depth: usize,
    /// Raw notifications buffered between the OS watcher and dispatch
    pub raw_buffer: usize,
    /// Connections the listener holds open while earlier ones are extracted
    pub max_connections: usize,
    /// Gzip level, 0 (store) to 9 (best)
    pub compression: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            watch: PathBuf::from("."),
            listen: false,
            root: PathBuf::from("."),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            queue_depth: 1,
            raw_buffer: 1024,
            max_connections: 4,
            compression: 6,
        }
    }
}

impl MirrorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.compression > 9 {
            bail!("compression level must be 0-9, got {}", self.compression);
        }
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.queue_depth == 0 {
            bail!("queue_depth must be at least 1");
        }
        if self.raw_buffer == 0 {
            bail!("raw_buffer must be at least 1");
        }
        Ok(())
    }

    pub fn dial_address(&self) -> String {
        let host = if self.host.is_empty() {
            "localhost"
        } else {
            &self.host
        };
        join_host_port(host, self.port)
    }

    pub fn bind_address(&self) -> String {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        };
        join_host_port(host, self.port)
    }

    pub fn compression(&self) -> Compression {
        Compression::new(self.compression)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn notifier_options(&self) -> NotifierOptions {
        NotifierOptions {
            debounce: self.debounce(),
            queue_depth: self.queue_depth,
            raw_buffer: self.raw_buffer,
        }
    }
}

/// `host:port`, bracketing bare IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: MirrorConfig = toml::from_str("root = \"/srv/mirror\"\nlisten = true\n").unwrap();
        assert!(config.listen);
        assert_eq!(config.root, PathBuf::from("/srv/mirror"));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.debounce(), Duration::from_millis(DEFAULT_DEBOUNCE_MS));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<MirrorConfig>("prot = 1\n").is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = MirrorConfig::load(&tmp.path().join("none.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }

    #[test]
    fn addresses() {
        let mut config = MirrorConfig::default();
        assert_eq!(config.dial_address(), "localhost:4200");
        assert_eq!(config.bind_address(), "0.0.0.0:4200");

        config.host = "::1".to_string();
        config.port = 9000;
        assert_eq!(config.dial_address(), "[::1]:9000");
        assert_eq!(join_host_port("[::1]", 1), "[::1]:1");
        assert_eq!(join_host_port("example.com", 80), "example.com:80");
    }

    #[test]
    fn notifier_options_follow_config() {
        let config = MirrorConfig {
            debounce_ms: 0,
            queue_depth: 8,
            ..MirrorConfig::default()
        };
        let options = config.notifier_options();
        assert!(options.debounce.is_zero());
        assert_eq!(options.queue_depth, 8);
        assert_eq!(options.raw_buffer, 1024);
    }

    #[test]
    fn validation_bounds() {
        assert!(MirrorConfig::default().validate().is_ok());
        let config = MirrorConfig {
            compression: 10,
            ..MirrorConfig::default()
        };
        assert!(config.validate().is_err());
        let config = MirrorConfig {
            queue_depth: 0,
            ..MirrorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

//! Command-line surface shared by both roles

use crate::config::MirrorConfig;
use anyhow::Result;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Flags left unset fall back to the `--config` file, then to built-in defaults
#[derive(Clone, Debug, Default, Parser)]
#[command(
    author,
    version,
    about = "Mirror a directory tree to a remote listener whenever a file is written"
)]
pub struct Opts {
    /// What address to copy to; in --listen mode, the address to bind [default: localhost / 0.0.0.0]
    #[arg(long)]
    pub host: Option<String>,

    /// What port to connect to or listen on [default: 4200]
    #[arg(long)]
    pub port: Option<u16>,

    /// Which directory to watch [default: .]
    #[arg(long)]
    pub watch: Option<PathBuf>,

    /// Run as the listening server instead of the watcher
    #[arg(long, action = ArgAction::SetTrue)]
    pub listen: bool,

    /// Directory the listener extracts received trees into [default: .]
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Coalesce writes to one file within this window; 0 sends on every write [default: 100]
    #[arg(long = "debounce-ms")]
    pub debounce_ms: Option<u64>,

    /// Connections the listener holds open; they are extracted one at a time [default: 4]
    #[arg(long = "max-connections")]
    pub max_connections: Option<usize>,

    /// Gzip compression level, 0-9 [default: 6]
    #[arg(long)]
    pub compression: Option<u32>,

    /// TOML file providing defaults for the options above
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    pub verbose: bool,
}

impl Opts {
    /// Build the immutable runtime configuration: file values first, then flags
    pub fn resolve(&self) -> Result<MirrorConfig> {
        let mut config = match &self.config {
            Some(path) => MirrorConfig::load(path)?,
            None => MirrorConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(watch) = &self.watch {
            config.watch = watch.clone();
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(ms) = self.debounce_ms {
            config.debounce_ms = ms;
        }
        if let Some(n) = self.max_connections {
            config.max_connections = n;
        }
        if let Some(level) = self.compression {
            config.compression = level;
        }
        config.listen |= self.listen;

        config.validate()?;
        Ok(config)
    }
}

//! Tarsync - mirror a directory tree to a listener whenever a file is written
//!
//! Two roles share one binary:
//! - watcher (default): watch `--watch`, send the tree to `--host:--port` on every write
//! - listener (`--listen`): accept trees on `--port` and extract them under `--root`

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tarsync::cli::Opts;
use tarsync::net_async::{client, server};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // 128 + SIGINT
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let opts = Opts::parse();
    init_tracing(opts.verbose);

    let mut config = opts.resolve()?;
    if config.listen {
        config.root = canonical_dir(&config.root, "Output root")?;
    } else {
        config.watch = canonical_dir(&config.watch, "Watch root")?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    if config.listen {
        rt.block_on(server::serve(&config))
    } else {
        rt.block_on(client::watch(&config))
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn canonical_dir(path: &Path, what: &str) -> Result<PathBuf> {
    if !path.exists() {
        bail!("{} does not exist: {}", what, path.display());
    }
    if !path.is_dir() {
        bail!("{} is not a directory: {}", what, path.display());
    }
    std::fs::canonicalize(path)
        .with_context(|| format!("Failed to canonicalize {}: {}", what, path.display()))
}

//! Tokio transport between the watcher and the listener.
//!
//! One TCP connection carries exactly one archive stream and is closed by the
//! sender when the tree has been written. The tar and gzip layers are synchronous,
//! so once a connection is established it is detached from the reactor and driven
//! on a blocking worker.

use crate::config::MirrorConfig;
use crate::tar_stream::{decode_stream, encode_tree, ArchiveStats};
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Instant;

/// Convert a connected tokio stream into a blocking std stream
fn into_blocking(stream: tokio::net::TcpStream) -> Result<std::net::TcpStream> {
    let stream = stream
        .into_std()
        .context("failed to detach socket from runtime")?;
    stream
        .set_nonblocking(false)
        .context("failed to switch socket to blocking mode")?;
    Ok(stream)
}

pub mod client {
    use super::*;
    use crate::watcher::{ChangeEvent, ChangeNotifier};
    use flate2::Compression;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tracing::{debug, error, info, warn};

    pub async fn connect(addr: &str) -> Result<std::net::TcpStream> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect {}", addr))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "failed to set TCP_NODELAY");
        }
        into_blocking(stream)
    }

    /// Encode the whole watch root onto `stream`, which is closed on return
    pub async fn send_tree(
        stream: std::net::TcpStream,
        watch_root: &Path,
        compression: Compression,
    ) -> Result<ArchiveStats> {
        let root = watch_root.to_path_buf();
        tokio::task::spawn_blocking(move || encode_tree(&root, stream, compression))
            .await
            .context("archive encoder task failed")?
    }

    pub async fn transfer_once(
        addr: &str,
        watch_root: &Path,
        compression: Compression,
    ) -> Result<ArchiveStats> {
        let stream = connect(addr).await?;
        send_tree(stream, watch_root, compression).await
    }

    /// Mirror the watch root once per change event until the channel closes.
    ///
    /// Transfers run strictly one after another. A failed connect or encode is
    /// logged and the loop moves on to the next event; nothing is retried.
    pub async fn run(config: &MirrorConfig, mut events: mpsc::Receiver<ChangeEvent>) {
        let addr = config.dial_address();

        while let Some(event) = events.recv().await {
            info!(%event, "file change");
            let started = Instant::now();

            let stream = match connect(&addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("connection error, skipping transfer: {:#}", e);
                    continue;
                }
            };

            match send_tree(stream, &config.watch, config.compression()).await {
                Ok(stats) => info!(
                    %addr,
                    %stats,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tree sent"
                ),
                Err(e) => error!(%addr, "archive error: {:#}", e),
            }
        }
    }

    /// Watcher role: register the watch root and mirror it on every write
    pub async fn watch(config: &MirrorConfig) -> Result<()> {
        let (notifier, events) = ChangeNotifier::start(&config.watch, &config.notifier_options())?;
        info!(
            root = %config.watch.display(),
            files = notifier.target().files.len(),
            addr = %config.dial_address(),
            "mirroring on write"
        );
        run(config, events).await;
        Ok(())
    }
}

pub mod server {
    use super::*;
    use anyhow::bail;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
    use tracing::{error, info, warn};

    /// Listener role: bind and serve until the process is terminated
    pub async fn serve(config: &MirrorConfig) -> Result<()> {
        let bind = config.bind_address();
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("bind {}", bind))?;
        info!(
            "tarsync listening on {} root={} max_connections={}",
            bind,
            config.root.display(),
            config.max_connections
        );
        serve_listener(listener, &config.root, config.max_connections).await
    }

    /// A connection waiting for its turn at the output root
    struct Accepted {
        stream: TcpStream,
        peer: SocketAddr,
        _permit: OwnedSemaphorePermit,
    }

    /// Accept loop. At most `max_connections` connections are held open at once;
    /// they are extracted one at a time, in the order they were accepted, so an
    /// older tree never lands on top of a newer one. Accept and extraction errors
    /// are logged and never stop the loop.
    pub async fn serve_listener(
        listener: TcpListener,
        root: &Path,
        max_connections: usize,
    ) -> Result<()> {
        let permits = Arc::new(Semaphore::new(max_connections));
        let (queue, pending) = mpsc::channel(max_connections);
        tokio::spawn(extract_in_order(pending, root.to_path_buf()));

        loop {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .context("connection limiter closed")?;
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept error: {}", e);
                    continue;
                }
            };
            info!(%peer, "received connection");

            if queue
                .send(Accepted {
                    stream,
                    peer,
                    _permit: permit,
                })
                .await
                .is_err()
            {
                bail!("extraction worker stopped");
            }
        }
    }

    async fn extract_in_order(mut pending: mpsc::Receiver<Accepted>, root: PathBuf) {
        while let Some(conn) = pending.recv().await {
            let peer = conn.peer;
            let started = Instant::now();
            match extract_connection(conn.stream, &root).await {
                Ok(stats) => info!(
                    %peer,
                    %stats,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tree extracted"
                ),
                Err(e) => error!(%peer, "extraction error: {:#}", e),
            }
        }
    }

    /// Decode one connection's archive under `root`; the connection is closed on return
    pub async fn extract_connection(stream: TcpStream, root: &Path) -> Result<ArchiveStats> {
        let stream = into_blocking(stream)?;
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || decode_stream(stream, &root))
            .await
            .context("archive decoder task failed")?
    }
}

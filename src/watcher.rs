//! Change notification for the watch root.
//!
//! Every regular file found under the root at startup is registered with a
//! `notify` watcher. Raw notifications are bridged into a tokio channel and a
//! single dispatch task turns write notifications into [`ChangeEvent`]s, with an
//! optional per-path debounce window, before handing them to the transfer client
//! over a bounded channel.
//!
//! # Behavior
//!
//! - Only writes produce events; create, remove, rename and chmod are dropped
//! - Files created after startup are not watched
//! - A busy consumer blocks the dispatch task; raw events then wait in the raw
//!   buffer, and beyond that in the OS queue, whose overflow policy applies

use crate::fs_enum::{discover, WatchTarget};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Default debounce window for write bursts (100ms)
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// A path written continuously is still reported once per this many windows
pub const MAX_WAIT_WINDOWS: u32 = 10;

/// Operation kind of a raw notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Write,
    Create,
    Remove,
    Rename,
    Chmod,
    Other,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Write => "write",
            Operation::Create => "create",
            Operation::Remove => "remove",
            Operation::Rename => "rename",
            Operation::Chmod => "chmod",
            Operation::Other => "other",
        };
        f.write_str(name)
    }
}

/// Map a `notify` event kind onto the operations the mirror distinguishes.
///
/// `Access(Close(Write))` is reported alongside the data modification on Linux and
/// counts as `Other`, so one write does not fire twice.
pub fn classify(kind: &EventKind) -> Operation {
    match kind {
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            Operation::Write
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Operation::Chmod,
        EventKind::Modify(ModifyKind::Name(_)) => Operation::Rename,
        EventKind::Create(_) => Operation::Create,
        EventKind::Remove(_) => Operation::Remove,
        _ => Operation::Other,
    }
}

/// A watched file was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub timestamp: DateTime<Utc>,
    pub path: PathBuf,
    pub operation: Operation,
}

impl ChangeEvent {
    /// The change event for a raw notification, if it is a write
    pub fn from_raw(event: &Event) -> Option<Self> {
        let operation = classify(&event.kind);
        if operation != Operation::Write {
            return None;
        }
        Some(Self {
            timestamp: Utc::now(),
            path: event.paths.first()?.clone(),
            operation,
        })
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.timestamp.to_rfc3339(),
            self.path.display(),
            self.operation
        )
    }
}

#[derive(Debug)]
struct Pending {
    event: ChangeEvent,
    first_seen: Instant,
    deadline: Instant,
}

/// Trailing-edge coalescing of change events per path.
///
/// A write to a path that is already pending replaces the pending event and pushes
/// its deadline out by another window, but never past `max_wait` after the first
/// write of the burst. Due events come out in deadline order.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    max_wait: Duration,
    pending: Vec<Pending>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            max_wait: window * MAX_WAIT_WINDOWS,
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, event: ChangeEvent, now: Instant) {
        match self.pending.iter_mut().find(|p| p.event.path == event.path) {
            Some(pending) => {
                pending.event = event;
                pending.deadline = (now + self.window).min(pending.first_seen + self.max_wait);
            }
            None => self.pending.push(Pending {
                event,
                first_seen: now,
                deadline: now + self.window,
            }),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.deadline).min()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove and return every event whose deadline is at or before `now`
    pub fn drain_due(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let (due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.deadline <= now);
        self.pending = rest;
        Self::in_deadline_order(due)
    }

    pub fn drain_all(&mut self) -> Vec<ChangeEvent> {
        Self::in_deadline_order(std::mem::take(&mut self.pending))
    }

    fn in_deadline_order(mut due: Vec<Pending>) -> Vec<ChangeEvent> {
        due.sort_by_key(|p| p.deadline);
        due.into_iter().map(|p| p.event).collect()
    }
}

/// Tuning for the notifier's two channels and its debounce window
#[derive(Debug, Clone)]
pub struct NotifierOptions {
    /// Zero disables debouncing: every raw write becomes one event
    pub debounce: Duration,
    /// Capacity of the hand-off channel to the transfer client
    pub queue_depth: usize,
    /// Capacity of the raw notification buffer
    pub raw_buffer: usize,
}

impl Default for NotifierOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            queue_depth: 1,
            raw_buffer: 1024,
        }
    }
}

/// Watches the files under a root and emits write events.
///
/// Dropping the notifier stops the OS watcher and the dispatch task.
pub struct ChangeNotifier {
    target: WatchTarget,
    _watcher: RecommendedWatcher,
    dispatch: JoinHandle<()>,
}

impl ChangeNotifier {
    /// Walk `root`, register every file, and start dispatching.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        root: &Path,
        options: &NotifierOptions,
    ) -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let target = discover(root)?;

        let (raw_tx, raw_rx) = mpsc::channel::<notify::Result<Event>>(options.raw_buffer);
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.blocking_send(res);
            },
            Config::default(),
        )
        .context("failed to create file watcher")?;

        for file in &target.files {
            match watcher.watch(file, RecursiveMode::NonRecursive) {
                Ok(()) => info!(path = %file.display(), "watching"),
                Err(e) => warn!(path = %file.display(), error = %e, "failed to watch file"),
            }
        }

        let (tx, rx) = mpsc::channel(options.queue_depth);
        let dispatch = tokio::spawn(dispatch(raw_rx, tx, options.debounce));

        Ok((
            Self {
                target,
                _watcher: watcher,
                dispatch,
            },
            rx,
        ))
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

/// Dispatch loop between the raw notification buffer and the consumer.
///
/// Exits when the consumer is gone, or when the raw source closes (after flushing
/// anything still pending in the debouncer).
pub(crate) async fn dispatch(
    mut raw: mpsc::Receiver<notify::Result<Event>>,
    out: mpsc::Sender<ChangeEvent>,
    window: Duration,
) {
    let mut debouncer = Debouncer::new(window);

    loop {
        let deadline = debouncer.next_deadline();
        tokio::select! {
            res = raw.recv() => match res {
                Some(Ok(event)) => {
                    let Some(change) = ChangeEvent::from_raw(&event) else {
                        trace!(kind = ?event.kind, paths = ?event.paths, "dropping non-write event");
                        continue;
                    };
                    debug!(%change, "write observed");
                    if window.is_zero() {
                        if out.send(change).await.is_err() {
                            return;
                        }
                    } else {
                        debouncer.push(change, Instant::now());
                    }
                }
                Some(Err(e)) => warn!(error = %e, "file watcher error"),
                None => {
                    for change in debouncer.drain_all() {
                        if out.send(change).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
            },
            _ = sleep_until_deadline(deadline) => {
                for change in debouncer.drain_due(Instant::now()) {
                    if out.send(change).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

use anyhow::{bail, Context, Result};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;
use walkdir::WalkDir;
// Filesystem enumeration for the watch root and the archive encoder

/// The two kinds of node the mirror carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Regular,
}

/// Entry with the metadata an archive header needs
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path on disk, as produced by the walk
    pub path: PathBuf,
    /// Path relative to the walk root; never empty
    pub relative: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    /// Seconds since the Unix epoch
    pub mtime: u64,
}

/// Files and directories registered for change notification
#[derive(Debug, Clone, Default)]
pub struct WatchTarget {
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
    pub directories: Vec<PathBuf>,
}

/// Walk `root` in the order `walkdir` discovers entries (parents before children).
///
/// The root itself is not yielded. Symlinks are not followed and, like sockets and
/// fifos, are skipped. Any walk or metadata error is yielded as an `Err` item; callers
/// that need all-or-nothing semantics stop at the first one.
pub fn walk_tree(root: &Path) -> impl Iterator<Item = Result<FileEntry>> + '_ {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(move |res| match res {
            Ok(entry) => file_entry(root, &entry).transpose(),
            Err(e) => Some(Err(
                anyhow::Error::new(e).context(format!("failed to walk {}", root.display()))
            )),
        })
}

fn file_entry(root: &Path, entry: &walkdir::DirEntry) -> Result<Option<FileEntry>> {
    let path = entry.path();
    let relative = path.strip_prefix(root).unwrap_or(path);
    if relative.as_os_str().is_empty() {
        return Ok(None);
    }

    let file_type = entry.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::Regular
    } else {
        debug!(path = %path.display(), "skipping non-regular entry");
        return Ok(None);
    };

    let metadata = entry
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?;

    Ok(Some(FileEntry {
        path: path.to_path_buf(),
        relative: relative.to_path_buf(),
        kind,
        size: match kind {
            EntryKind::Directory => 0,
            EntryKind::Regular => metadata.len(),
        },
        mode: permission_bits(&metadata, kind),
        mtime: modified_secs(&metadata),
    }))
}

/// One full walk of the watch root, collected for watcher registration
pub fn discover(root: &Path) -> Result<WatchTarget> {
    if !root.is_dir() {
        bail!("watch root is not a directory: {}", root.display());
    }

    let mut target = WatchTarget {
        root: root.to_path_buf(),
        ..WatchTarget::default()
    };
    for entry in walk_tree(root) {
        let entry = entry?;
        match entry.kind {
            EntryKind::Directory => target.directories.push(entry.path),
            EntryKind::Regular => target.files.push(entry.path),
        }
    }
    Ok(target)
}

fn modified_secs(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(unix)]
fn permission_bits(metadata: &Metadata, _kind: EntryKind) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &Metadata, kind: EntryKind) -> u32 {
    match kind {
        EntryKind::Directory => 0o755,
        EntryKind::Regular if metadata.permissions().readonly() => 0o444,
        EntryKind::Regular => 0o644,
    }
}

//! Gzip-compressed tar streaming of a directory tree
//!
//! A tree goes out as `gzip(tar(entries))` in walk order and comes back through the
//! same two layers one entry at a time, so neither side holds the tree in memory.
//! The stream carries no count or length prefix: the decoder runs until the gzip
//! stream ends cleanly, and treats anything else as a failed transfer.

use crate::fs_enum::{walk_tree, EntryKind, FileEntry};
use crate::paths::{ensure_parent_exists, resolve_under_root};
use anyhow::{bail, Context, Result};
use filetime::{set_file_mtime, FileTime};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, trace};

/// One header within the archive stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Name relative to the sender's watch root
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Exact number of content bytes following the header
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
}

impl ArchiveEntry {
    fn header(&self) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(match self.kind {
            EntryKind::Directory => EntryType::Directory,
            EntryKind::Regular => EntryType::Regular,
        });
        header.set_size(self.size);
        header.set_mode(self.mode);
        header.set_mtime(self.mtime);
        header
    }

    fn from_header(header: &Header, path: PathBuf) -> Result<Option<Self>> {
        let kind = match header.entry_type() {
            EntryType::Directory => EntryKind::Directory,
            EntryType::Regular | EntryType::Continuous => EntryKind::Regular,
            other => {
                debug!(path = %path.display(), kind = ?other, "skipping unsupported entry type");
                return Ok(None);
            }
        };
        Ok(Some(Self {
            kind,
            size: header
                .entry_size()
                .with_context(|| format!("bad size field for {}", path.display()))?,
            mode: header
                .mode()
                .with_context(|| format!("bad mode field for {}", path.display()))?,
            mtime: header
                .mtime()
                .with_context(|| format!("bad mtime field for {}", path.display()))?,
            path,
        }))
    }
}

impl From<&FileEntry> for ArchiveEntry {
    fn from(entry: &FileEntry) -> Self {
        Self {
            path: entry.relative.clone(),
            kind: entry.kind,
            size: entry.size,
            mode: entry.mode,
            mtime: entry.mtime,
        }
    }
}

/// Counters for one encoded or decoded archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
}

impl ArchiveStats {
    fn record(&mut self, entry: &ArchiveEntry) {
        match entry.kind {
            EntryKind::Directory => self.directories += 1,
            EntryKind::Regular => {
                self.files += 1;
                self.bytes += entry.size;
            }
        }
    }
}

impl fmt::Display for ArchiveStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files, {} directories, {} bytes",
            self.files, self.directories, self.bytes
        )
    }
}

/// Destination wrapper that can be cut off after a failed encode.
///
/// The tar builder and the gzip encoder both write their trailers when dropped.
/// Once poisoned every write fails, so an aborted stream never ends in a trailer
/// the receiver would accept.
struct GuardedWriter<W> {
    inner: W,
    poisoned: bool,
}

impl<W> GuardedWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            poisoned: false,
        }
    }

    fn poison(&mut self) {
        self.poisoned = true;
    }

    fn check(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "archive stream aborted",
            ));
        }
        Ok(())
    }
}

impl<W: Write> Write for GuardedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        self.inner.flush()
    }
}

/// Reader yielding exactly `remaining` bytes of a source file.
///
/// A file that grows while it is archived is clipped to its declared size; one that
/// shrinks fails the encode instead of desynchronizing the framing.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R> ExactReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        if max == 0 {
            return Ok(0);
        }
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "source ended {} bytes short of its declared size",
                    self.remaining
                ),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Stream the tree under `root` into `destination` as a gzip-compressed tar archive.
///
/// `destination` is consumed and dropped exactly once, whatever the outcome. On
/// failure it is poisoned first, leaving the receiver a truncated stream rather
/// than a shorter but well-formed archive.
pub fn encode_tree<W: Write>(
    root: &Path,
    destination: W,
    compression: Compression,
) -> Result<ArchiveStats> {
    let mut builder = Builder::new(GzEncoder::new(GuardedWriter::new(destination), compression));

    match append_tree(&mut builder, root) {
        Ok(stats) => {
            let encoder = builder
                .into_inner()
                .context("failed to write archive trailer")?;
            let mut sink = encoder
                .finish()
                .context("failed to finish compression stream")?;
            sink.flush().context("failed to flush archive stream")?;
            Ok(stats)
        }
        Err(e) => {
            builder.get_mut().get_mut().poison();
            Err(e)
        }
    }
}

fn append_tree<W: Write>(builder: &mut Builder<W>, root: &Path) -> Result<ArchiveStats> {
    let mut stats = ArchiveStats::default();

    for entry in walk_tree(root) {
        let entry = entry?;
        let archived = ArchiveEntry::from(&entry);
        let mut header = archived.header();

        match entry.kind {
            EntryKind::Directory => builder.append_data(&mut header, &archived.path, io::empty()),
            EntryKind::Regular => {
                let file = File::open(&entry.path)
                    .with_context(|| format!("failed to open {}", entry.path.display()))?;
                builder.append_data(
                    &mut header,
                    &archived.path,
                    ExactReader::new(file, entry.size),
                )
            }
        }
        .with_context(|| format!("failed to archive {}", entry.path.display()))?;

        trace!(path = %archived.path.display(), size = archived.size, "archived entry");
        stats.record(&archived);
    }

    Ok(stats)
}

/// Materialize a gzip-compressed tar stream under `output_root`.
///
/// Runs until the stream ends cleanly. Any error aborts the whole decode; entries
/// written before it stay on disk.
pub fn decode_stream<R: Read>(source: R, output_root: &Path) -> Result<ArchiveStats> {
    let mut archive = Archive::new(GzDecoder::new(source));
    let mut stats = ArchiveStats::default();

    for entry in archive
        .entries()
        .context("failed to read archive stream")?
    {
        let mut entry = entry.context("failed to read archive entry header")?;
        let path = entry
            .path()
            .context("archive entry has an unreadable path")?
            .into_owned();
        let Some(archived) = ArchiveEntry::from_header(entry.header(), path)? else {
            continue;
        };
        let dest = resolve_under_root(output_root, &archived.path)?;

        match archived.kind {
            EntryKind::Directory => create_directory(&dest, archived.mode)?,
            EntryKind::Regular => write_file(&mut entry, &dest, &archived)?,
        }

        debug!(path = %dest.display(), size = archived.size, "extracted entry");
        stats.record(&archived);
    }

    // The tar trailer is not the end of the stream; draining verifies the gzip trailer.
    io::copy(&mut archive.into_inner(), &mut io::sink())
        .context("archive stream ended uncleanly")?;

    Ok(stats)
}

fn create_directory(path: &Path, mode: u32) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => set_mode(path, mode | 0o700),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("failed to create directory {}", path.display()))
        }
    }
}

fn write_file<R: Read>(entry: &mut R, path: &Path, archived: &ArchiveEntry) -> Result<()> {
    ensure_parent_exists(path)?;

    let mut file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let copied = io::copy(entry, &mut file)
        .with_context(|| format!("failed to extract {}", path.display()))?;
    if copied != archived.size {
        bail!(
            "short read for {}: header declared {} bytes, stream carried {}",
            archived.path.display(),
            archived.size,
            copied
        );
    }
    drop(file);

    // Owner-write stays set so the next transfer can overwrite the file.
    set_mode(path, archived.mode | 0o200)?;
    set_file_mtime(path, FileTime::from_unix_time(archived.mtime as i64, 0))
        .with_context(|| format!("failed to set mtime on {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

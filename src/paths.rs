//! Path policy for entries arriving from the wire
//!
//! Archive entry names are relative to the sender's watch root. The receiver only
//! ever materializes them strictly below its own output root:
//! 1. Absolute paths, prefixes and parent directory components are rejected
//! 2. NUL bytes are rejected
//! 3. On Windows, ':' in a component is rejected (ADS defense)
//! 4. `.` components and repeated separators are dropped
//! 5. A symlink already on disk below the root may not lead outside it

use anyhow::{bail, Context, Result};
use std::fs::DirBuilder;
use std::path::{Component, Path, PathBuf};

/// Resolve an archive entry name to a destination path under `root`.
///
/// The name is checked lexically, then the deepest part of the destination that
/// already exists is canonicalized and must still lie under the canonical root.
/// The returned path is the lexical join, so it does not depend on what exists yet.
pub fn resolve_under_root(root: &Path, entry: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if entry.to_string_lossy().contains('\0') {
        bail!("entry path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in entry.components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    bail!("path component contains colon (potential ADS attack)");
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                bail!(
                    "entry path {:?} contains disallowed component: {:?}",
                    entry,
                    component
                );
            }
        }
    }

    if safe.as_os_str().is_empty() {
        bail!("entry path {:?} is empty", entry);
    }

    let joined = root.join(safe);
    ensure_stays_under(root, &joined)?;
    Ok(joined)
}

/// Canonicalize the deepest existing ancestor of `path` and require it under `root`
fn ensure_stays_under(root: &Path, path: &Path) -> Result<()> {
    let canonical_root = root
        .canonicalize()
        .with_context(|| format!("failed to canonicalize root {}", root.display()))?;
    let Some(existing) = path.ancestors().find(|p| p.symlink_metadata().is_ok()) else {
        return Ok(());
    };
    let resolved = existing
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {}", existing.display()))?;
    if !resolved.starts_with(&canonical_root) {
        bail!(
            "entry path {} escapes root {} through {}",
            path.display(),
            root.display(),
            existing.display()
        );
    }
    Ok(())
}

/// Create every missing parent of `path`.
///
/// New directories are world-writable before umask, so whichever user runs the
/// listener can keep writing into them on later transfers.
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
            let mut builder = DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o777);
            }
            builder
                .create(parent)
                .with_context(|| format!("failed to create {}", parent.display()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolves_relative_entries_under_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let result = resolve_under_root(root, Path::new("subdir/file.txt")).unwrap();
        assert_eq!(result, root.join("subdir/file.txt"));

        let result = resolve_under_root(root, Path::new("./subdir/./file.txt")).unwrap();
        assert_eq!(result, root.join("subdir/file.txt"));

        let result = resolve_under_root(root, Path::new("subdir//file.txt")).unwrap();
        assert_eq!(result, root.join("subdir/file.txt"));
    }

    #[test]
    fn rejects_entries_that_escape_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        assert!(resolve_under_root(root, Path::new("../etc/passwd")).is_err());
        assert!(resolve_under_root(root, Path::new("subdir/../../etc/passwd")).is_err());
        assert!(resolve_under_root(root, Path::new("/etc/passwd")).is_err());
        assert!(resolve_under_root(root, Path::new("file\0.txt")).is_err());
    }

    #[test]
    fn rejects_empty_entries() {
        let temp_dir = TempDir::new().unwrap();
        assert!(resolve_under_root(temp_dir.path(), Path::new("")).is_err());
        assert!(resolve_under_root(temp_dir.path(), Path::new("./.")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_entries_through_symlinks_leaving_root() {
        let temp_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::write(outside.path().join("target.txt"), b"keep").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("escape")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("target.txt"), root.join("alias.txt"))
            .unwrap();

        assert!(resolve_under_root(root, Path::new("escape/evil.txt")).is_err());
        assert!(resolve_under_root(root, Path::new("escape/new/evil.txt")).is_err());
        assert!(resolve_under_root(root, Path::new("alias.txt")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn accepts_symlinks_that_stay_inside_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();

        let result = resolve_under_root(root, Path::new("link/file.txt")).unwrap();
        assert_eq!(result, root.join("link/file.txt"));
    }

    #[cfg(windows)]
    #[test]
    fn rejects_alternate_data_streams() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        assert!(resolve_under_root(root, Path::new("file.txt:stream")).is_err());
    }

    #[test]
    fn ensure_parent_exists_creates_nested_parents() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("new").join("nested").join("file.txt");

        assert!(!file_path.parent().unwrap().exists());
        ensure_parent_exists(&file_path).unwrap();
        assert!(file_path.parent().unwrap().is_dir());

        // Idempotent
        ensure_parent_exists(&file_path).unwrap();
    }

    #[test]
    fn ensure_parent_exists_accepts_bare_names() {
        ensure_parent_exists(Path::new("file.txt")).unwrap();
    }
}

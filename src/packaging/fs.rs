//! Read access to the script tree, behind a trait so packaging can be driven
//! against any file source.

use std::fs::{self, File, FileTimes};
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    Dir,
    File,
}

/// One entry of a listed tree, relative to the listing root.
///
/// The root itself is listed with an empty relative path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TreeEntry {
    pub relative: PathBuf,
    pub kind: EntryKind,
}

impl TreeEntry {
    pub fn is_root(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }

    /// Relative path with `/` separators, as matched by dependency patterns.
    pub fn slash_path(&self) -> String {
        self.relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

pub trait FileTree: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Every entry under `root`, root first, in a stable order. Symlinks are
    /// listed as what they point at; dangling ones are skipped.
    fn list_tree(&self, root: &Path) -> Result<Vec<TreeEntry>>;

    fn copy(&self, src: &Path, dst: &Path, preserve_timestamps: bool) -> Result<()>;
}

/// [`FileTree`] over the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileTree;

impl FileTree for LocalFileTree {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_tree(&self, root: &Path) -> Result<Vec<TreeEntry>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if is_dangling(&e) => {
                    warn!(path = ?e.path(), "skipping dangling symlink");
                    continue;
                }
                Err(e) => {
                    return Err(DispatchError::Packaging(format!(
                        "walking {}: {e}",
                        root.display()
                    )))
                }
            };
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| DispatchError::Packaging(e.to_string()))?
                .to_path_buf();
            let kind = if entry.file_type().is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            entries.push(TreeEntry { relative, kind });
        }
        Ok(entries)
    }

    fn copy(&self, src: &Path, dst: &Path, preserve_timestamps: bool) -> Result<()> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst).map_err(|e| {
            DispatchError::Packaging(format!(
                "copy {} -> {}: {e}",
                src.display(),
                dst.display()
            ))
        })?;

        if preserve_timestamps {
            let meta = fs::metadata(src)?;
            let mut times = FileTimes::new().set_modified(meta.modified()?);
            if let Ok(accessed) = meta.accessed() {
                times = times.set_accessed(accessed);
            }
            File::options().write(true).open(dst)?.set_times(times)?;
        }
        Ok(())
    }
}

/// A link whose target is missing. Loops and permission errors are not.
fn is_dangling(e: &walkdir::Error) -> bool {
    e.loop_ancestor().is_none()
        && e.path().is_some_and(|p| p.is_symlink())
        && e.io_error()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
}

//! Script artifact packaging: resolve a script's dependency subtree, stage
//! it in a private scratch directory and compress it into one archive.
//!
//! Every pack call gets its own staging directory, removed when the call
//! returns on any path. The archive lives in a second private directory owned
//! by the returned [`Artifact`] and disappears when the artifact is dropped,
//! unless it is persisted elsewhere first.

pub mod archive;
pub mod fs;
pub mod resolver;

pub use self::fs::{EntryKind, FileTree, LocalFileTree, TreeEntry};
pub use self::resolver::{DependencyResolver, PathPredicate, ScriptName};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::ScriptsConfig;
use crate::error::{DispatchError, Result};

/// A packed archive on disk.
#[derive(Debug)]
pub struct Artifact {
    script: String,
    path: PathBuf,
    size: u64,
    _dir: TempDir,
}

impl Artifact {
    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<script>.<archive extension>`
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy the archive to `dest`, overwriting whatever is there.
    pub fn persist(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::copy(&self.path, dest)?;
        Ok(())
    }
}

struct Inner {
    tree: Arc<dyn FileTree>,
    resolver: DependencyResolver,
    archive_extension: String,
    staging_parent: Option<PathBuf>,
    timeout: Duration,
}

#[derive(Clone)]
pub struct Packager {
    inner: Arc<Inner>,
}

impl Packager {
    pub fn new(
        tree: Arc<dyn FileTree>,
        resolver: DependencyResolver,
        archive_extension: impl Into<String>,
        staging_parent: Option<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tree,
                resolver,
                archive_extension: archive_extension.into(),
                staging_parent,
                timeout,
            }),
        }
    }

    /// Local-filesystem packager configured from `[scripts]`.
    pub fn from_config(cfg: &ScriptsConfig) -> Result<Self> {
        let predicates = cfg
            .dependencies
            .iter()
            .map(PathPredicate::from_rule)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(
            Arc::new(LocalFileTree),
            DependencyResolver::new(&cfg.root, &cfg.extension, predicates),
            &cfg.archive_extension,
            cfg.staging_parent.clone(),
            cfg.pack_timeout(),
        ))
    }

    pub fn parse_script(&self, raw: &str) -> Result<ScriptName> {
        ScriptName::parse(raw, self.inner.resolver.extension())
    }

    /// Pack `script` on the blocking pool, bounded by the configured timeout.
    pub async fn pack(&self, script: &str) -> Result<Artifact> {
        let script = self.parse_script(script)?;
        let this = self.clone();
        let timeout = self.inner.timeout;
        let name = script.to_string();

        let job = tokio::task::spawn_blocking(move || this.pack_blocking(&script));
        match tokio::time::timeout(timeout, job).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(DispatchError::Packaging(format!("pack {name} aborted: {join}"))),
            Err(_) => {
                // The abandoned job still drops its scratch directories when it ends.
                warn!(script = %name, ?timeout, "packaging timed out");
                Err(DispatchError::Packaging(format!(
                    "pack {name} timed out after {timeout:?}"
                )))
            }
        }
    }

    /// Synchronous pack; see [`Packager::pack`].
    pub fn pack_blocking(&self, script: &ScriptName) -> Result<Artifact> {
        let started = Instant::now();
        let inner = &self.inner;
        let root = inner.resolver.root();

        let selected = inner.resolver.resolve(inner.tree.as_ref(), script)?;

        let stage = self.scratch_dir("stage-")?;
        debug!(script = %script, stage = %stage.path().display(), "staging");

        let mut files = Vec::new();
        for entry in &selected {
            let dst = stage.path().join(&entry.relative);
            match entry.kind {
                EntryKind::Dir => std::fs::create_dir_all(&dst)?,
                EntryKind::File => {
                    inner.tree.copy(&root.join(&entry.relative), &dst, true)?;
                    files.push(entry.relative.clone());
                }
            }
        }

        let out_dir = self.scratch_dir("artifact-")?;
        let path = out_dir
            .path()
            .join(format!("{}.{}", script, inner.archive_extension));
        let size = archive::write_tar_gz(stage.path(), &files, &path).map_err(|e| {
            DispatchError::Packaging(format!("compressing {}: {e}", path.display()))
        })?;

        // Explicit close so removal errors are logged rather than ignored.
        if let Err(e) = stage.close() {
            warn!(script = %script, error = %e, "failed to remove staging directory");
        }

        info!(
            script = %script,
            files = files.len(),
            bytes = size,
            elapsed = ?started.elapsed(),
            "packed artifact"
        );

        Ok(Artifact {
            script: script.to_string(),
            path,
            size,
            _dir: out_dir,
        })
    }

    fn scratch_dir(&self, prefix: &str) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        let dir = match &self.inner.staging_parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        };
        dir.map_err(|e| DispatchError::Packaging(format!("creating scratch directory: {e}")))
    }
}

//! TOML configuration for the dispatch daemon.
//!
//! Layered model: an explicit path, the `TASKDISPATCH_CONFIG` environment
//! variable, a standard system location, then compiled-in defaults. Every
//! section is `serde(default)` so partial files only override what they name.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming a config file to load.
pub const CONFIG_ENV: &str = "TASKDISPATCH_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/taskdispatch/taskdispatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the dispatch process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DispatchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded dispatch configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. `explicit` (a `--config` flag). A failure here is fatal.
    /// 2. The path in the `TASKDISPATCH_CONFIG` environment variable.
    /// 3. `/etc/taskdispatch/taskdispatch.toml`.
    /// 4. Compiled-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{CONFIG_ENV} set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Reject values that would make the daemon misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.storage.pool_size == 0 {
            anyhow::bail!("storage.pool_size must be at least 1");
        }
        if self.storage.operation_timeout_ms == 0 {
            anyhow::bail!("storage.operation_timeout_ms must be non-zero");
        }
        if self.storage.busy_timeout_ms >= self.storage.operation_timeout_ms {
            anyhow::bail!("storage.busy_timeout_ms must be below storage.operation_timeout_ms");
        }
        if self.storage.max_update_retries == 0 {
            anyhow::bail!("storage.max_update_retries must be at least 1");
        }
        if self.scripts.root.as_os_str().is_empty() {
            anyhow::bail!("scripts.root must not be empty");
        }
        if self.scripts.extension.is_empty() || self.scripts.archive_extension.is_empty() {
            anyhow::bail!("scripts.extension and scripts.archive_extension must not be empty");
        }
        if self.scripts.pack_timeout_ms == 0 {
            anyhow::bail!("scripts.pack_timeout_ms must be non-zero");
        }
        for rule in &self.scripts.dependencies {
            if let DependencyRule::Pattern { pattern } = rule {
                regex::Regex::new(pattern)
                    .with_context(|| format!("invalid dependency pattern: {pattern}"))?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API listener.
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Document store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Maximum pooled connections.
    pub pool_size: u32,
    /// SQLite `busy_timeout` for connection setup and migrations. Store
    /// calls wait at most for what is left of `operation_timeout_ms`.
    pub busy_timeout_ms: u64,
    /// Upper bound on any single repository call.
    pub operation_timeout_ms: u64,
    /// Compare-and-update attempts before a contended queue update gives up.
    pub max_update_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/taskdispatch.db"),
            pool_size: 8,
            busy_timeout_ms: 2000,
            operation_timeout_ms: 5000,
            max_update_retries: 16,
        }
    }
}

impl StorageConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// Script tree and packaging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Directory holding test scripts and their library subtrees.
    pub root: PathBuf,
    /// Script file extension, without the dot.
    pub extension: String,
    /// Extension given to produced archives, without the dot.
    pub archive_extension: String,
    /// Upper bound on one staging + compression run.
    pub pack_timeout_ms: u64,
    /// Parent directory for per-call staging areas. System temp dir if unset.
    pub staging_parent: Option<PathBuf>,
    /// Ordered dependency rules; a path matching any of them is bundled.
    pub dependencies: Vec<DependencyRule>,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("scripts"),
            extension: "py".to_string(),
            archive_extension: "tgz".to_string(),
            pack_timeout_ms: 30_000,
            staging_parent: None,
            dependencies: vec![DependencyRule::Under {
                under: "customtestlibs".to_string(),
            }],
        }
    }
}

impl ScriptsConfig {
    pub fn pack_timeout(&self) -> Duration {
        Duration::from_millis(self.pack_timeout_ms)
    }
}

/// One dependency rule as written in TOML.
///
/// ```toml
/// [[scripts.dependencies]]
/// under = "customtestlibs"
///
/// [[scripts.dependencies]]
/// pattern = "^resources/.*\\.robot$"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyRule {
    /// Any path with a directory component equal to `under`.
    Under { under: String },
    /// Regex over the root-relative, `/`-separated path.
    Pattern { pattern: String },
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

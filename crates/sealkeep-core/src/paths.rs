//! Standard paths used by sealkeep
//!
//! Everything lives under one per-user root directory. The root is the only
//! thing standing between other local users and the daemon socket, so its
//! mode is checked strictly before anything binds.

use std::fs::{self, DirBuilder};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Mode the root directory must have: owner-only
pub const REQUIRED_MODE: u32 = 0o700;

/// Environment variable overriding the root directory
pub const ROOT_ENV: &str = "SEALKEEP_ROOT";

/// Standard sealkeep paths
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root directory (~/.sealkeep)
    pub root: PathBuf,
    /// Control channel socket
    pub socket: PathBuf,
    /// Daemon process file
    pub pid: PathBuf,
    /// Local registry store
    pub registry: PathBuf,
    /// Daemon configuration
    pub config: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let root = match std::env::var(ROOT_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join(".sealkeep"),
        };
        Self::with_root(root)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            socket: root.join("daemon.socket"),
            pid: root.join("daemon.pid"),
            registry: root.join("registry.json"),
            config: root.join("config.json"),
            root,
        }
    }

    /// Create the root directory with mode 0700 if missing, otherwise verify
    /// it is a directory with exactly that mode.
    pub fn ensure_root(&self) -> Result<()> {
        ensure_private_dir(&self.root)
    }
}

/// Create `dir` owner-only if absent; refuse anything broader if present.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    let meta = match fs::metadata(dir) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            DirBuilder::new().mode(REQUIRED_MODE).create(dir)?;
            // umask can only narrow the mode, pin it exactly
            fs::set_permissions(dir, fs::Permissions::from_mode(REQUIRED_MODE))?;
            fs::metadata(dir)?
        }
        Err(e) => return Err(e.into()),
    };

    if !meta.is_dir() {
        return Err(Error::PermissionDenied(format!(
            "{} exists but is not a directory",
            dir.display()
        )));
    }

    let mode = meta.permissions().mode() & 0o777;
    if mode != REQUIRED_MODE {
        return Err(Error::PermissionDenied(format!(
            "{} has permissions {:o}, requires {:o}",
            dir.display(),
            mode,
            REQUIRED_MODE
        )));
    }

    Ok(())
}

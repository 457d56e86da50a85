//! Transient operation flags.
//!
//! TTL-bounded marker files signalling that a long operation is presumed in
//! progress for an instance (`Rebuilding...` / `Updating...` status overlays).
//! Flags are advisory UI hints, not a correctness mechanism: every operation
//! is best-effort and errors are swallowed. The operation that sets a flag is
//! responsible for clearing it on all exit paths, including failure; a stale
//! flag simply ages out.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;

/// Default age past which a flag is considered stale: 6 hours.
pub const DEFAULT_FLAG_TTL: Duration = Duration::from_secs(6 * 3600);

/// Kinds of transient operation markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    /// Image rebuild plus recreate in flight.
    Rebuilding,
    /// In-instance package update in flight.
    Updating,
}

impl FlagKind {
    /// File name of the marker (`.rebuilding` / `.updating`).
    fn file_name(self) -> &'static str {
        match self {
            FlagKind::Rebuilding => ".rebuilding",
            FlagKind::Updating => ".updating",
        }
    }

    /// Status string shown while the flag is fresh.
    pub fn display_status(self) -> &'static str {
        match self {
            FlagKind::Rebuilding => "Rebuilding...",
            FlagKind::Updating => "Updating...",
        }
    }
}

/// File-backed flag store rooted at the instances directory.
#[derive(Debug, Clone)]
pub struct FlagStore {
    instances_dir: PathBuf,
}

impl FlagStore {
    /// Create a store over `<state>/instances/`.
    pub fn new(instances_dir: impl Into<PathBuf>) -> Self {
        Self {
            instances_dir: instances_dir.into(),
        }
    }

    fn flag_path(&self, name: &str, kind: FlagKind) -> PathBuf {
        self.instances_dir.join(name).join(kind.file_name())
    }

    /// Set or clear a marker. Creates parent directories as needed. Errors
    /// are logged at debug and swallowed.
    pub fn set(&self, name: &str, kind: FlagKind, on: bool) {
        let path = self.flag_path(name, kind);
        let result = if on {
            create_marker(&path)
        } else {
            match std::fs::remove_file(&path) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        };
        if let Err(err) = result {
            debug!("flag {}:{:?} set({}) failed: {}", name, kind, on, err);
        }
    }

    /// Whether the marker exists and is younger than `max_age`. A stale
    /// marker reports `false` but is left on disk; cleanup belongs to the
    /// operation that set it.
    pub fn has(&self, name: &str, kind: FlagKind, max_age: Duration) -> bool {
        let path = self.flag_path(name, kind);
        let Ok(meta) = std::fs::metadata(&path) else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age < max_age,
            // mtime in the future (clock skew): treat as fresh
            Err(_) => true,
        }
    }

    /// `has` with the default 6-hour TTL.
    pub fn has_fresh(&self, name: &str, kind: FlagKind) -> bool {
        self.has(name, kind, DEFAULT_FLAG_TTL)
    }
}

fn create_marker(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    std::fs::write(path, epoch.to_string())
}

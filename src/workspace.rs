//! Per-run working directories.
//!
//! ```text
//! <work_root>/<stamp>/
//!     input.apk     copy of the APK being patched
//!     extracted/    unpacked archive, smali directories alongside the dex units
//!     units.json    dex unit table
//!     build/        staging tree for the rebuilt archive (transient)
//!     output/       unsigned, aligned and signed archives
//! ```
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::units::UNITS_FILE;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S%3f";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Creates a fresh, uniquely named workspace below `work_root`.
    pub fn create(work_root: &Path) -> io::Result<Workspace> {
        fs::create_dir_all(work_root)?;
        let stamp = chrono::Local::now().format(STAMP_FORMAT);
        let counter = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = rand::random();
        let root = work_root.join(format!("{stamp}_{counter}_{suffix:08x}"));
        // create_dir, not create_dir_all: an existing directory means a name clash.
        fs::create_dir(&root)?;
        log::info!("created workspace {}", root.display());
        Ok(Workspace { root })
    }

    /// Reopens a workspace left by an earlier patch.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Workspace> {
        let workspace = Workspace { root: root.into() };
        if !workspace.extracted_dir().is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} has no extracted/ tree", workspace.root.display()),
            ));
        }
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_apk(&self) -> PathBuf {
        self.root.join("input.apk")
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.root.join("extracted")
    }

    pub fn units_file(&self) -> PathBuf {
        self.root.join(UNITS_FILE)
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn remove(self) -> io::Result<()> {
        log::info!("removing workspace {}", self.root.display());
        fs::remove_dir_all(&self.root)
    }
}

fn is_workspace_name(name: &str) -> bool {
    let mut parts = name.split('_');
    let date = parts.next().unwrap_or_default();
    date.len() == 8 && date.bytes().all(|b| b.is_ascii_digit()) && parts.count() == 3
}

/// Deletes all but the `keep` newest workspaces under `work_root` and returns how many went.
///
/// Only directories named like [`Workspace::create`] names them are considered.
pub fn cleanup_stale(work_root: &Path, keep: usize) -> io::Result<usize> {
    if !work_root.is_dir() {
        return Ok(0);
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(work_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_workspace_name(&name) {
            let modified = entry.metadata()?.modified()?;
            runs.push((modified, name, entry.path()));
        }
    }
    runs.sort();
    let stale = runs.len().saturating_sub(keep);
    let mut removed = 0;
    for (_, _, path) in runs.into_iter().take(stale) {
        match fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(err) => log::warn!("cannot remove {}: {err}", path.display()),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspaces_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let a = Workspace::create(dir.path()).unwrap();
        let b = Workspace::create(dir.path()).unwrap();
        assert_ne!(a.root(), b.root());
        assert!(a.root().is_dir() && b.root().is_dir());
        let name = a.root().file_name().unwrap().to_string_lossy().into_owned();
        assert!(is_workspace_name(&name), "{name}");
    }

    #[test]
    fn open_requires_extracted_tree() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        assert!(Workspace::open(ws.root()).is_err());
        fs::create_dir_all(ws.extracted_dir()).unwrap();
        let reopened = Workspace::open(ws.root()).unwrap();
        assert_eq!(reopened.units_file(), ws.root().join("units.json"));
        reopened.remove().unwrap();
        assert!(!ws.root().exists());
    }

    #[test]
    fn cleanup_keeps_newest_and_ignores_strangers() {
        let dir = tempfile::tempdir().unwrap();
        let first = Workspace::create(dir.path()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = Workspace::create(dir.path()).unwrap();
        fs::create_dir_all(dir.path().join("keep-me")).unwrap();

        assert_eq!(cleanup_stale(dir.path(), 1).unwrap(), 1);
        assert!(!first.root().exists());
        assert!(second.root().exists());
        assert!(dir.path().join("keep-me").exists());
        assert_eq!(cleanup_stale(&dir.path().join("absent"), 0).unwrap(), 0);
    }
}

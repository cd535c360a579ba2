//! Finds the `.smali` file of a class across every smali directory of a workspace.
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::EntryPoint;
use crate::units::smali_dir_order;

#[derive(Debug)]
pub enum LocateError {
    NotFound { class_name: String },
    Io(io::Error),
}

impl fmt::Display for LocateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocateError::NotFound { class_name } => {
                write!(f, "no smali file for {class_name} in any smali directory")
            }
            LocateError::Io(err) => write!(f, "I/O error while searching smali: {err}"),
        }
    }
}

impl std::error::Error for LocateError {}

impl From<io::Error> for LocateError {
    fn from(value: io::Error) -> Self {
        LocateError::Io(value)
    }
}

/// Smali directories directly under `work_dir`, unit directories first in unit order.
pub fn smali_dirs(work_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(work_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("smali") {
            names.push(name);
        }
    }
    names.sort_by(|a, b| smali_dir_order(a, b));
    Ok(names.into_iter().map(|name| work_dir.join(name)).collect())
}

/// Returns the first `<smali dir>/a/b/C.smali` for class `a.b.C`.
pub fn locate(work_dir: &Path, class_name: &str) -> Result<PathBuf, LocateError> {
    let relative = EntryPoint::new(class_name).smali_relative_path();
    for dir in smali_dirs(work_dir)? {
        let direct = dir.join(&relative);
        if direct.is_file() {
            log::debug!("found {class_name} at {}", direct.display());
            return Ok(direct);
        }
        if let Some(found) = walk_for(&dir, &dir, &relative)? {
            log::debug!("found {class_name} by walking {}", dir.display());
            return Ok(found);
        }
    }
    Err(LocateError::NotFound {
        class_name: class_name.to_string(),
    })
}

fn walk_for(root: &Path, current: &Path, relative: &Path) -> io::Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(current)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if let Some(found) = walk_for(root, &path, relative)? {
                return Ok(Some(found));
            }
        } else if file_type.is_file() && path.strip_prefix(root).ok() == Some(relative) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

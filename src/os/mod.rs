//! Host environment: mount resolution, raw volume access and directory
//! walks. The engine never names the host kernel; everything
//! platform-specific lives here.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{open_raw, resolve_device};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::{open_raw, resolve_device};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{FatwipeError, Result};

/// Raw volume backing a host path.
pub struct ResolvedVolume {
    pub device_path: PathBuf,
    /// Host mount point to strip from target paths.
    pub mount_prefix: String,
    /// Path separator the host uses below the mount point.
    pub separator: char,
}

/// Enumerate a directory bottom-up: children precede their parent and the
/// root comes last, so tombstoning a directory never strands live
/// children.
pub fn walk_post_order(root: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(root).map_err(|e| walk_error(root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| walk_error(&path, e))?;
        if file_type.is_dir() {
            walk_post_order(&path, out)?;
        } else {
            out.push(path);
        }
    }
    out.push(root.to_path_buf());
    Ok(())
}

pub(crate) fn walk_error(path: &Path, err: io::Error) -> FatwipeError {
    FatwipeError::Io(io::Error::new(
        err.kind(),
        format!("{}: {err}", path.display()),
    ))
}

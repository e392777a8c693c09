//! Atomic file writes.
//!
//! Every persisted artifact (feature state, heartbeats, diagnostic output)
//! goes through [`write_atomic`]: write to a temp file in the same
//! directory, fsync, then rename over the target. This is the only place
//! in the codebase that renames a persisted file, so a crash at any point
//! leaves either the old contents or the new contents, never a partial
//! write.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::{DroverError, Result};

/// Atomically replace `path` with `bytes`.
///
/// The temp file lives in the target's directory so the final rename stays
/// on one filesystem. On any failure the original file is untouched and
/// the temp file is cleaned up best-effort.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        DroverError::state(format!("path has no parent directory: {}", path.display()))
    })?;
    fs::create_dir_all(dir).map_err(|e| {
        DroverError::state(format!("failed to create {}: {e}", dir.display()))
    })?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DroverError::state(format!("invalid file name: {}", path.display())))?;
    let tmp_path = dir.join(format!(".{file_name}.tmp-{}", std::process::id()));

    let write_result = (|| -> std::io::Result<()> {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(DroverError::state(format!(
            "failed to write {}: {e}",
            tmp_path.display()
        )));
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        DroverError::state(format!(
            "failed to rename {} over {}: {e}",
            tmp_path.display(),
            path.display()
        ))
    })
}

//! Scratch directory for one sandboxed run.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::SandboxFile;
use crate::error::SandboxError;
use crate::store::is_plain_file_name;

/// Name of the evaluation script inside the workspace.
pub const SCRIPT_NAME: &str = ".script";

const OPEN_MODE: u32 = 0o777;

/// A fresh, empty directory that is removed when dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a workspace under `parent`, or the OS temp dir.
    pub fn create(parent: Option<&Path>) -> Result<Self, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("demograder-");
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(SandboxError::Workspace)?;

        debug!(path = %dir.path().display(), "Created workspace");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write the evaluation script and mark it executable.
    pub fn write_script(&self, script: &str) -> Result<PathBuf, SandboxError> {
        let path = self.path().join(SCRIPT_NAME);
        fs::write(&path, normalize_script(script)).map_err(SandboxError::Workspace)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(OPEN_MODE))
            .map_err(SandboxError::Workspace)?;
        Ok(path)
    }

    /// Copy a stored file in under its stored name, replacing any earlier
    /// file of the same name.
    pub fn copy_in(&self, file: &SandboxFile) -> Result<(), SandboxError> {
        if !is_plain_file_name(&file.name) || file.name == SCRIPT_NAME {
            return Err(SandboxError::UnsafeFileName(file.name.clone()));
        }
        fs::copy(&file.source, self.path().join(&file.name)).map_err(SandboxError::Workspace)?;
        Ok(())
    }

    /// Grant everyone read, write and execute on the whole tree.
    pub fn open_up(&self) -> Result<(), SandboxError> {
        for entry in WalkDir::new(self.path()) {
            let entry = entry.map_err(|e| SandboxError::Workspace(e.into()))?;
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(OPEN_MODE))
                .map_err(SandboxError::Workspace)?;
        }
        Ok(())
    }

    /// Remove the directory and everything the script left in it.
    pub fn close(self) {
        let path = self.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove workspace");
        } else {
            debug!(path = %path.display(), "Removed workspace");
        }
    }
}

/// Right-trim every line, end each with `\n`, and append one blank line.
pub fn normalize_script(script: &str) -> String {
    let mut normalized = String::with_capacity(script.len() + 2);
    for line in script.lines() {
        normalized.push_str(line.trim_end());
        normalized.push('\n');
    }
    normalized.push('\n');
    normalized
}

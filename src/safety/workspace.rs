/// Run-scoped workspaces
///
/// Every sandbox gets its own UUID-named directory under the work root;
/// no two runs ever share files.
use crate::config::types::{Result, SandboxError};
use crate::safety::safe_cleanup;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Name of the writable scratch directory inside a workspace
pub const SCRATCH_DIR: &str = "tmp";

/// Workspace for one sandbox run
#[derive(Debug)]
pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
    scratch_dir: Option<PathBuf>,
    files: Vec<PathBuf>,
    cleaned: bool,
}

impl Workspace {
    /// Create new workspace for a run
    pub fn new(base_dir: &Path) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = base_dir.join(&run_id);

        fs::DirBuilder::new()
            .mode(0o700)
            .create(&run_dir)
            .map_err(|e| {
                SandboxError::from_io(
                    &format!("Failed to create workspace {}", run_dir.display()),
                    e,
                )
            })?;

        Ok(Self {
            run_id,
            run_dir,
            scratch_dir: None,
            files: Vec::new(),
            cleaned: false,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch_dir.as_deref()
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Write a file directly inside the run directory
    pub fn write_file(&mut self, name: &str, content: &[u8]) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(SandboxError::Filesystem(format!(
                "Refusing workspace file name {:?}",
                name
            )));
        }

        let path = self.run_dir.join(name);
        fs::write(&path, content).map_err(|e| {
            SandboxError::from_io(&format!("Failed to write {}", path.display()), e)
        })?;
        self.files.push(path.clone());
        Ok(path)
    }

    /// Create the private writable scratch directory
    pub fn create_scratch_dir(&mut self) -> Result<PathBuf> {
        let path = self.run_dir.join(SCRATCH_DIR);
        fs::DirBuilder::new()
            .mode(0o700)
            .create(&path)
            .map_err(|e| {
                SandboxError::from_io(&format!("Failed to create {}", path.display()), e)
            })?;
        self.scratch_dir = Some(path.clone());
        Ok(path)
    }

    /// Make written files and the run directory read-only.
    /// The scratch directory keeps its own permissions.
    pub fn seal(&self) -> Result<()> {
        for file in &self.files {
            fs::set_permissions(file, fs::Permissions::from_mode(0o444)).map_err(|e| {
                SandboxError::Filesystem(format!("Failed to seal {}: {}", file.display(), e))
            })?;
        }
        fs::set_permissions(&self.run_dir, fs::Permissions::from_mode(0o555)).map_err(|e| {
            SandboxError::Filesystem(format!(
                "Failed to seal {}: {}",
                self.run_dir.display(),
                e
            ))
        })
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned
    }

    /// Cleanup workspace (idempotent)
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        safe_cleanup::remove_tree_secure(&self.run_dir)?;
        self.cleaned = true;
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!(
                "Failed to remove workspace {}: {}",
                self.run_dir.display(),
                e
            );
        }
    }
}

/// Owner of the work root
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    /// Create the work root if it doesn't exist
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o711)
            .create(&base_dir)
            .map_err(|e| {
                SandboxError::from_io(
                    &format!("Failed to create work root {}", base_dir.display()),
                    e,
                )
            })?;

        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn create_workspace(&self) -> Result<Workspace> {
        Workspace::new(&self.base_dir)
    }

    /// Remove run directories left behind by a previous process.
    /// Only UUID-named directories are considered.
    pub fn cleanup_old_workspaces(&self, max_age: std::time::Duration) -> Result<usize> {
        let mut cleaned = 0;
        let now = std::time::SystemTime::now();

        let entries = fs::read_dir(&self.base_dir).map_err(|e| {
            SandboxError::from_io(
                &format!("Failed to read work root {}", self.base_dir.display()),
                e,
            )
        })?;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            let is_run_dir = entry
                .file_name()
                .to_str()
                .map(|name| Uuid::parse_str(name).is_ok())
                .unwrap_or(false);
            if !is_run_dir {
                continue;
            }

            let metadata = match fs::symlink_metadata(&path) {
                Ok(m) if m.is_dir() => m,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Failed to get metadata for {}: {}", path.display(), e);
                    continue;
                }
            };

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            match age {
                Some(age) if age >= max_age => {}
                _ => continue,
            }

            log::info!("Removing stale workspace {}", path.display());
            match safe_cleanup::remove_tree_secure(&path) {
                Ok(()) => cleaned += 1,
                Err(e) => log::warn!("Failed to remove stale workspace {}: {}", path.display(), e),
            }
        }

        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_workspace_creation_is_unique() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path().join("work")).unwrap();

        let first = manager.create_workspace().unwrap();
        let second = manager.create_workspace().unwrap();
        assert!(first.run_dir().is_dir());
        assert_ne!(first.run_dir(), second.run_dir());
        assert!(first.run_dir().starts_with(manager.base_dir()));
    }

    #[test]
    fn test_write_seal_and_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path().to_path_buf()).unwrap();
        let mut workspace = manager.create_workspace().unwrap();

        let source = workspace.write_file("solution.py", b"x = 1").unwrap();
        let scratch = workspace.create_scratch_dir().unwrap();
        workspace.seal().unwrap();

        let mode = fs::metadata(&source).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o444);
        assert!(scratch.is_dir());

        let run_dir = workspace.run_dir().to_path_buf();
        workspace.cleanup().unwrap();
        assert!(!run_dir.exists());
        assert!(workspace.is_cleaned());
        workspace.cleanup().unwrap();
    }

    #[test]
    fn test_rejects_nested_file_names() {
        let root = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::new(root.path()).unwrap();
        assert!(workspace.write_file("../escape.py", b"").is_err());
        assert!(workspace.write_file("", b"").is_err());
    }

    #[test]
    fn test_drop_removes_run_dir() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(root.path()).unwrap();
        let run_dir = workspace.run_dir().to_path_buf();
        drop(workspace);
        assert!(!run_dir.exists());
    }

    #[test]
    fn test_cleanup_old_workspaces_skips_foreign_entries() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path().to_path_buf()).unwrap();

        let stale = root.path().join(Uuid::new_v4().to_string());
        fs::create_dir(&stale).unwrap();
        let foreign = root.path().join("keep-me");
        fs::create_dir(&foreign).unwrap();

        let cleaned = manager.cleanup_old_workspaces(Duration::from_secs(0)).unwrap();
        assert_eq!(cleaned, 1);
        assert!(!stale.exists());
        assert!(foreign.exists());
    }
}

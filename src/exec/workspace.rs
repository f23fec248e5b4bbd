use crate::error::Result;
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

/// Exclusive per-operation scratch directory under the engine's temp root.
///
/// Created with a random suffix and mode 0700; removed on drop on every exit
/// path, normal or not.
#[derive(Debug)]
pub struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix("op-")
            .rand_bytes(8)
            .tempdir_in(root)?;
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700))?;
        Ok(Workspace { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn subdir(&self, name: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        fs::create_dir_all(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_private_and_removed_on_drop() -> Result<()> {
        let root = tempfile::tempdir()?;
        let path = {
            let workspace = Workspace::create(root.path())?;
            let mode = fs::metadata(workspace.path())?.permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
            assert!(workspace
                .path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("op-"));
            workspace.path().to_path_buf()
        };
        assert!(!path.exists());
        Ok(())
    }
}

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Temporary directory of a SAPI instance, holding its generated
/// configuration and diagnostic log.
///
/// The directory is removed on drop unless it was preserved.
#[derive(Debug)]
pub struct InstanceDir {
    dir: TempDir,
}

impl InstanceDir {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn save(&self, name: &str, contents: &str) -> Result<PathBuf, String> {
        let path = self.file(name);
        std::fs::write(&path, contents)
            .map(|_| path.clone())
            .map_err(|err| format!("cannot write {}: {}", path.display(), err))
    }

    pub fn read(&self, name: &str) -> Result<String, String> {
        let path = self.file(name);
        std::fs::read(&path)
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            .map_err(|err| format!("cannot read {}: {}", path.display(), err))
    }

    /// Keeps the directory on disk and returns its path.
    pub fn preserve(self) -> PathBuf {
        self.dir.into_path()
    }

    pub fn delete(self) -> Result<(), String> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|err| format!("cannot delete {}: {}", path.display(), err))
    }
}

pub trait TmpDirSupplier: Send + Sync {
    fn create(&self, prefix: &str) -> Result<InstanceDir, String>;
}

pub struct TmpDirFactory {
    root: Option<PathBuf>,
}

impl TmpDirSupplier for TmpDirFactory {
    fn create(&self, prefix: &str) -> Result<InstanceDir, String> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        match &self.root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map(|dir| InstanceDir { dir })
        .map_err(|err| format!("failed to create tmp dir: {}", err))
    }
}

impl TmpDirFactory {
    pub fn new(root: Option<&Path>) -> Self {
        Self {
            root: root.map(Path::to_path_buf),
        }
    }
}

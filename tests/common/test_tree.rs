//! Builder for directory trees used as server roots and client mirrors

use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub struct TestTree {
    dir: TempDir,
}

impl TestTree {
    /// Create a new empty tree
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Canonical root, matching what the server reports
    pub fn path(&self) -> PathBuf {
        self.dir
            .path()
            .canonicalize()
            .expect("Failed to canonicalize temp dir")
    }

    pub fn join(&self, relative_path: &str) -> PathBuf {
        self.path().join(relative_path)
    }

    /// Add a file, creating parent directories
    pub fn add_file(&self, relative_path: &str, content: impl AsRef<[u8]>) -> &Self {
        let full_path = self.join(relative_path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        fs::write(&full_path, content).expect("Failed to write file");
        self
    }

    pub fn add_dir(&self, relative_path: &str) -> &Self {
        fs::create_dir_all(self.join(relative_path)).expect("Failed to create dir");
        self
    }

    pub fn remove(&self, relative_path: &str) -> &Self {
        let full_path = self.join(relative_path);
        if full_path.is_dir() {
            fs::remove_dir_all(&full_path).expect("Failed to remove dir");
        } else {
            fs::remove_file(&full_path).expect("Failed to remove file");
        }
        self
    }

    pub fn rename(&self, from: &str, to: &str) -> &Self {
        fs::rename(self.join(from), self.join(to)).expect("Failed to rename");
        self
    }

    pub fn read(&self, relative_path: &str) -> Option<Vec<u8>> {
        fs::read(self.join(relative_path)).ok()
    }

    pub fn exists(&self, relative_path: &str) -> bool {
        self.join(relative_path).exists()
    }
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new()
    }
}

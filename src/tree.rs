//! Directory tree helpers shared by the watcher and initial sync

use std::path::{Component, Path, PathBuf};

use ignore::WalkBuilder;

use crate::protocol::is_frameable;

/// One entry found under a walked directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Root-relative, `/`-separated
    pub relative_path: String,
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Root-relative path using `/` separators.
///
/// `None` for the root itself, for paths outside the root, and for paths
/// that cannot be carried on the wire (non UTF-8, embedded newlines).
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    let joined = parts.join("/");
    is_frameable(&joined).then_some(joined)
}

/// Every entry below `start` (not `start` itself), parents before children,
/// siblings in file-name order. Unreadable entries are logged and skipped.
pub fn walk(root: &Path, start: &Path) -> Vec<TreeEntry> {
    let mut builder = WalkBuilder::new(start);

    // Replicate everything: no .gitignore, no hidden-file filtering
    builder.standard_filters(false);
    builder.follow_links(false);
    builder.sort_by_file_name(|a, b| a.cmp(b));

    let mut entries = Vec::new();
    for result in builder.build() {
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry under {}: {}", start.display(), e);
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        let Some(relative_path) = relative_path(root, entry.path()) else {
            tracing::warn!("Skipping path that cannot be replicated: {:?}", entry.path());
            continue;
        };
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        entries.push(TreeEntry {
            relative_path,
            path: entry.into_path(),
            is_dir,
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_relative_path() {
        let root = Path::new("/srv/root");
        assert_eq!(
            relative_path(root, Path::new("/srv/root/a/b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(relative_path(root, Path::new("/srv/root")), None);
        assert_eq!(relative_path(root, Path::new("/srv/other/x")), None);
        assert_eq!(relative_path(root, Path::new("/srv/root/bad\nname")), None);
    }

    #[test]
    fn test_walk_order_and_hidden_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        fs::write(dir.path().join("sub/deep/x.bin"), [0u8, 1, 2]).unwrap();
        fs::write(dir.path().join(".hidden"), "h").unwrap();
        fs::write(dir.path().join(".gitignore"), "*.txt\n").unwrap();

        let entries = walk(dir.path(), dir.path());
        let names: Vec<_> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(
            names,
            vec![
                ".gitignore",
                ".hidden",
                "a.txt",
                "b.txt",
                "sub",
                "sub/deep",
                "sub/deep/x.bin"
            ]
        );
        assert!(entries.iter().find(|e| e.relative_path == "sub").unwrap().is_dir);
        assert!(!entries.iter().find(|e| e.relative_path == "a.txt").unwrap().is_dir);
    }

    #[test]
    fn test_walk_subtree_keeps_root_relative_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        fs::write(dir.path().join("sub/deep/x"), "x").unwrap();

        let entries = walk(dir.path(), &dir.path().join("sub"));
        let names: Vec<_> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(names, vec!["sub/deep", "sub/deep/x"]);
    }
}

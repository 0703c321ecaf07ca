//! Input file discovery
//!
//! Walks the input tree once at startup and builds the [`FileRegistry`].
//! Hidden directories (name starting with `.`) are pruned together with
//! everything beneath them, and directories we are not allowed to read are
//! skipped with a warning.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{IngestError, Result};
use crate::registry::{FileEntry, FileId, FileRegistry};

fn is_hidden_dir(entry: &DirEntry) -> bool {
    // The root is always walked, even when it is itself a dot-directory.
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry.file_name().to_string_lossy().starts_with('.')
}

/// Whether the text after the last `.` in `path`'s file name equals
/// `extension` (leading dot optional). A file named `.zst` matches `zst`.
pub fn has_extension(path: &Path, extension: &str) -> bool {
    let wanted = extension.trim_start_matches('.');
    path.file_name()
        .map(|name| name.to_string_lossy())
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext == wanted))
        .unwrap_or(false)
}

/// Find every regular file under `root` whose extension is `extension`.
pub fn discover(root: &Path, extension: &str) -> Result<FileRegistry> {
    let mut entries = BTreeMap::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_hidden_dir(entry));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let denied = e
                    .io_error()
                    .is_some_and(|io| io.kind() == ErrorKind::PermissionDenied);
                if denied && e.depth() > 0 {
                    warn!(path = ?e.path(), "Permission denied, skipping");
                    continue;
                }
                return Err(IngestError::Discovery {
                    path: e.path().unwrap_or(root).to_path_buf(),
                    source: e,
                });
            }
        };

        if !entry.file_type().is_file() || !has_extension(entry.path(), extension) {
            continue;
        }

        debug!(path = %entry.path().display(), "Found input file");
        let path = entry.into_path();
        entries.insert(FileId::new(&path), FileEntry::new(path));
    }

    info!(
        root = %root.display(),
        extension,
        files = entries.len(),
        "Discovered input files"
    );

    Ok(FileRegistry::new(entries))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    fn names(registry: &FileRegistry, root: &Path) -> Vec<String> {
        registry
            .ids()
            .iter()
            .map(|id| {
                id.path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect()
    }

    #[test]
    fn test_finds_matching_files_recursively() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.zst");
        touch(dir.path(), "2020/01/b.zst");
        touch(dir.path(), "2020/c.zst");
        touch(dir.path(), "notes.txt");

        let registry = discover(dir.path(), ".zst").unwrap();
        assert_eq!(
            names(&registry, dir.path()),
            vec!["2020/01/b.zst", "2020/c.zst", "a.zst"]
        );
    }

    #[test]
    fn test_hidden_directories_are_pruned() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), ".git/objects/x.zst");
        touch(dir.path(), ".cache/y.zst");
        touch(dir.path(), "data/.hidden/z.zst");
        touch(dir.path(), "data/keep.zst");
        // hidden files are not directories, they stay
        touch(dir.path(), "data/.dotfile.zst");

        let registry = discover(dir.path(), ".zst").unwrap();
        assert_eq!(
            names(&registry, dir.path()),
            vec!["data/.dotfile.zst", "data/keep.zst"]
        );
    }

    #[test]
    fn test_extension_must_match_exactly() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.zst");
        touch(dir.path(), "b.zstd");
        touch(dir.path(), "c.jsonl.zst");
        touch(dir.path(), "d.zst.bak");
        touch(dir.path(), "zst");
        touch(dir.path(), "e/.zst");

        let registry = discover(dir.path(), "zst").unwrap();
        assert_eq!(
            names(&registry, dir.path()),
            vec!["a.zst", "c.jsonl.zst", "e/.zst"]
        );
    }

    #[test]
    fn test_empty_tree() {
        let dir = TempDir::new().unwrap();
        let registry = discover(dir.path(), ".zst").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let result = discover(Path::new("/definitely/not/here"), ".zst");
        assert!(matches!(result, Err(IngestError::Discovery { .. })));
    }

    #[test]
    fn test_has_extension() {
        assert!(has_extension(Path::new("x/y.zst"), ".zst"));
        assert!(has_extension(Path::new("x/y.zst"), "zst"));
        assert!(!has_extension(Path::new("x/y"), ".zst"));
        assert!(!has_extension(Path::new("x/y.gz"), ".zst"));
        assert!(has_extension(Path::new("x/.zst"), ".zst"));
        assert!(!has_extension(Path::new("x/zst"), "zst"));
        assert!(!has_extension(Path::new("x/y."), ".zst"));
    }
}

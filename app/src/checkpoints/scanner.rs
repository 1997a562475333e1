use std::path::{Path, PathBuf};

use log::{debug, warn};
use walkdir::WalkDir;

/// File extensions the engine loads as checkpoints.
pub const CHECKPOINT_EXTENSIONS: &[&str] = &["safetensors", "ckpt"];

/// Model directories nest one level per family; deeper trees are not walked.
const MAX_SCAN_DEPTH: usize = 4;

pub fn is_checkpoint_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'));
    if hidden {
        return false;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            CHECKPOINT_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Lists checkpoint files under `dir`, sorted. A missing or unreadable
/// directory yields an empty list.
pub fn scan_checkpoints(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        warn!("Model directory {:?} does not exist", dir);
        return Vec::new();
    }

    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(MAX_SCAN_DEPTH)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_name().to_str().is_some_and(|n| n.starts_with('.'))
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_checkpoint_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_is_checkpoint_file() {
        assert!(is_checkpoint_file(Path::new("/m/a.safetensors")));
        assert!(is_checkpoint_file(Path::new("/m/b.CKPT")));
        assert!(!is_checkpoint_file(Path::new("/m/c.yaml")));
        assert!(!is_checkpoint_file(Path::new("/m/.hidden.safetensors")));
        assert!(!is_checkpoint_file(Path::new("/m/noext")));
    }

    #[test]
    fn test_scan_finds_nested_checkpoints_only() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sdxl")).unwrap();
        fs::create_dir_all(dir.path().join(".cache")).unwrap();
        fs::write(dir.path().join("a.safetensors"), b"").unwrap();
        fs::write(dir.path().join("sdxl/b.ckpt"), b"").unwrap();
        fs::write(dir.path().join("a.yaml"), b"").unwrap();
        fs::write(dir.path().join(".cache/c.safetensors"), b"").unwrap();

        let found = scan_checkpoints(dir.path());
        assert_eq!(
            found,
            vec![dir.path().join("a.safetensors"), dir.path().join("sdxl/b.ckpt")]
        );
    }

    #[test]
    fn test_scan_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(scan_checkpoints(&dir.path().join("missing")).is_empty());
    }
}

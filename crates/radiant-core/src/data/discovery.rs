//! File discovery for dataset image directories.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extensions found in the benchmark datasets.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// All image files under `dir`, sorted by path. A missing directory yields
/// an empty list; callers decide whether that is an error.
pub fn discover_images(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_supported(e.path()))
        .map(|e| e.into_path())
        .collect();

    // Sort by path for deterministic ordering
    files.sort();
    files
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = ext.to_lowercase();
            IMAGE_EXTENSIONS.iter().any(|&supported| supported == ext_lower)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_supported() {
        assert!(is_supported(Path::new("scan.png")));
        assert!(is_supported(Path::new("scan.PNG")));
        assert!(is_supported(Path::new("slide.tif")));
        assert!(!is_supported(Path::new("notes.txt")));
        assert!(!is_supported(Path::new("README")));
    }

    #[test]
    fn test_discovery_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.png", "c.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("0.jpg"), b"").unwrap();

        let files = discover_images(dir.path());
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.png", "b.png", "nested/0.jpg"]);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        assert!(discover_images(Path::new("/nonexistent/radiant/dir")).is_empty());
    }
}

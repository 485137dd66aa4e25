//! Directory traversal over frozen snapshots.
//!
//! Relative paths are reported with `/` separators because they become keys
//! in the backup record and path segments in the archive.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,
}

/// A file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the walk root, `/`-separated
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// Symlinks are resolved; links to directories and broken links yield None.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved,
                _ => return Ok(None),
            }
        } else {
            entry.metadata()?
        };
        if metadata.is_dir() {
            return Ok(None);
        }

        Ok(Some(Self {
            relative_path: relative(&path, root),
            path,
            size: metadata.len(),
        }))
    }
}

fn relative(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn walker(root: &Path, options: &WalkOptions) -> WalkDir {
    let mut walker = WalkDir::new(root).follow_links(options.follow_links).sort_by_file_name();
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }
    walker
}

/// Walk a directory tree and collect all files
pub fn walk_directory(root: &Path, options: WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_directory_with_callback(root, options, |file| {
        files.push(file.clone());
        true
    })?;
    Ok(files)
}

/// Walk a directory tree with a callback for each file. The walk stops early
/// when the callback returns `false`.
pub fn walk_directory_with_callback<F>(root: &Path, options: WalkOptions, mut callback: F) -> std::io::Result<()>
where
    F: FnMut(&FileInfo) -> bool,
{
    for entry in walker(root, &options) {
        let entry = entry?;

        if entry.file_type().is_dir() {
            continue;
        }

        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            if !callback(&file_info) {
                break;
            }
        }
    }

    Ok(())
}

/// Immediate subdirectory names of `root`, sorted.
pub fn subdirectories(root: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in walker(root, &WalkOptions { follow_links: false, max_depth: Some(1) }).min_depth(1) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

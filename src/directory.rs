//! Virtual asset directory.
//!
//! Scans the configured root directories once and keeps eligible files in
//! memory, keyed by their normalized request path. Files above the buffering
//! threshold are left on disk and reached through [`AssetDirectory::find_on_disk`],
//! which also picks up files created after the scan.
//!
//! Paths with a leading-dot segment are invisible everywhere, regardless of
//! the extension filter.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use walkdir::WalkDir;

/// A file held by the directory. Identity is the resolved filesystem path.
///
/// The modification time is deliberately not stored here: freshness is read
/// from the filesystem at cache-key time, never cached.
#[derive(Debug, Clone)]
pub struct StaticFile {
    /// Resolved filesystem path.
    pub path: PathBuf,
    /// File stem, e.g. `site` for `site.css`.
    pub name: String,
    /// Lowercased extension without the dot, e.g. `css`.
    pub extension: String,
    /// Full file content.
    pub content: Bytes,
}

/// Thread-safe in-memory index over one or more asset roots.
#[derive(Debug)]
pub struct AssetDirectory {
    roots: Vec<PathBuf>,
    allowed: HashSet<String>,
    max_buffered: u64,
    files: DashMap<String, Arc<StaticFile>>,
}

impl AssetDirectory {
    /// Build the index. Roots are scanned in order; when the same relative
    /// path exists under several roots, the first root wins.
    pub fn new(roots: Vec<PathBuf>, allowed_extensions: &[String], max_buffered: u64) -> Self {
        let allowed = allowed_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();

        let dir = Self {
            roots,
            allowed,
            max_buffered,
            files: DashMap::new(),
        };
        dir.scan();
        dir
    }

    fn scan(&self) {
        for root in &self.roots {
            for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = match entry.path().strip_prefix(root) {
                    Ok(rel) => rel,
                    Err(_) => continue,
                };
                if has_hidden_segment(rel) {
                    continue;
                }
                let extension = extension_of(entry.path());
                if !self.allowed.contains(&extension) {
                    continue;
                }
                let len = entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
                if len > self.max_buffered {
                    // Served by the disk fallback, streamed.
                    continue;
                }
                let key = request_key(rel);
                if self.files.contains_key(&key) {
                    continue;
                }
                match std::fs::read(entry.path()) {
                    Ok(bytes) => {
                        let file = StaticFile {
                            path: entry.path().to_path_buf(),
                            name: stem_of(entry.path()),
                            extension,
                            content: Bytes::from(bytes),
                        };
                        self.files.insert(key, Arc::new(file));
                    }
                    Err(err) => {
                        tracing::warn!(path = %entry.path().display(), %err, "skipping unreadable asset");
                    }
                }
            }
        }
    }

    /// Look up an in-memory file by request path.
    pub fn get(&self, request_path: &str) -> Option<Arc<StaticFile>> {
        let key = if request_path.starts_with('/') {
            request_path.to_string()
        } else {
            format!("/{request_path}")
        };
        self.files.get(&key).map(|r| Arc::clone(r.value()))
    }

    /// Resolve a request path against the roots on disk. Used for files too
    /// large to buffer and files that appeared after the scan.
    pub fn find_on_disk(&self, request_path: &str) -> Option<PathBuf> {
        let rel = request_path.trim_start_matches('/');
        if rel.is_empty() {
            return None;
        }
        let rel_path = Path::new(rel);
        if has_hidden_segment(rel_path) {
            return None;
        }
        // Never resolve outside the roots.
        if rel_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return None;
        }
        if !self.allowed.contains(&extension_of(rel_path)) {
            return None;
        }

        self.roots
            .iter()
            .map(|root| root.join(rel_path))
            .find(|candidate| candidate.is_file())
    }

    /// Number of buffered files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the in-memory index is empty.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn request_key(rel: &Path) -> String {
    let mut key = String::from("/");
    key.push_str(&rel.to_string_lossy().replace('\\', "/"));
    key
}

fn has_hidden_segment(rel: &Path) -> bool {
    rel.components().any(|c| match c {
        Component::Normal(part) => part.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

//! Persistent purge manifest.
//!
//! Records, per stylesheet, which page templates are known to reference it.
//! The whole document lives in a single JSON file inside the cache directory
//! and is rewritten in full on every update. An absent or corrupt file loads
//! as the empty manifest.
//!
//! Every load-mutate-save cycle runs under the store's mutex so concurrent
//! updates for different stylesheets cannot clobber each other's entries,
//! and the save itself goes through a sibling temp file plus rename so a
//! concurrent reader never observes a torn document.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Stylesheet key to tracked paths, as persisted on disk.
pub type Manifest = BTreeMap<String, ManifestEntry>;

/// The tracked paths for one stylesheet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Template files known to reference the stylesheet. Duplicate-free,
    /// grows as new referring pages are seen, shrinks only when a recorded
    /// file no longer exists.
    pub content: Vec<PathBuf>,
    /// The stylesheet's own path. Normally a singleton.
    pub css: Vec<PathBuf>,
}

/// Serialized access to the manifest document.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ManifestStore {
    /// File name of the manifest inside the cache directory.
    pub const FILE_NAME: &'static str = "purge-manifest.json";

    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(Self::FILE_NAME),
            lock: Mutex::new(()),
        }
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current manifest. Absent or unparseable documents yield the
    /// empty manifest.
    pub fn load(&self) -> Manifest {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!(path = %self.path.display(), %err, "ignoring corrupt manifest");
                Manifest::default()
            }),
            Err(_) => Manifest::default(),
        }
    }

    fn save(&self, manifest: &Manifest) -> io::Result<()> {
        let json = serde_json::to_string_pretty(manifest)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)
    }

    /// Run one load-mutate-save cycle under the store mutex. The manifest is
    /// written back unconditionally, even when the mutation changed nothing.
    pub async fn update<F, T>(&self, mutate: F) -> io::Result<T>
    where
        F: FnOnce(&mut Manifest) -> T,
    {
        let _guard = self.lock.lock().await;
        let mut manifest = self.load();
        let out = mutate(&mut manifest);
        self.save(&manifest)?;
        Ok(out)
    }
}

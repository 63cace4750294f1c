//! Association tracking between stylesheets and referring templates.
//!
//! Each stylesheet request carries (at most) one new piece of knowledge: the
//! page that referenced it. The tracker merges that page's template path into
//! the manifest entry for the stylesheet, prunes entries whose backing files
//! have disappeared, and persists the result.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::directory::StaticFile;
use crate::manifest::{ManifestEntry, ManifestStore};
use crate::referrer;

/// Accumulates stylesheet-to-template associations in the manifest.
#[derive(Debug, Clone)]
pub struct AssociationTracker {
    store: Arc<ManifestStore>,
    cache_dir: PathBuf,
}

impl AssociationTracker {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            store: Arc::new(ManifestStore::new(&cache_dir)),
            cache_dir,
        }
    }

    /// The underlying manifest store.
    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    /// Merge the referring page identified by `slug` into the manifest entry
    /// for `file`, prune template paths that no longer exist, and persist.
    ///
    /// Returns the refreshed entry, or `None` while no referencing template
    /// is on record. Callers treat `None` as "nothing to purge", not as an
    /// error.
    pub async fn record(
        &self,
        file: &StaticFile,
        slug: &str,
    ) -> io::Result<Option<ManifestEntry>> {
        let key = referrer::snake_case(&file.name);
        let template = (!slug.is_empty()).then(|| referrer::template_path(&self.cache_dir, slug));
        let css_path = file.path.clone();

        let entry = self
            .store
            .update(move |manifest| {
                let entry = manifest.entry(key).or_insert_with(|| ManifestEntry {
                    content: Vec::new(),
                    css: vec![css_path],
                });
                if let Some(template) = template {
                    if !entry.content.contains(&template) {
                        entry.content.push(template);
                    }
                }
                // Self-healing: drop templates whose files are gone.
                entry.content.retain(|path| path.exists());
                entry.clone()
            })
            .await?;

        tracing::debug!(
            stylesheet = %file.path.display(),
            templates = entry.content.len(),
            "recorded stylesheet association"
        );

        Ok((!entry.content.is_empty()).then_some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn css_file(path: PathBuf) -> StaticFile {
        StaticFile {
            name: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            extension: "css".to_string(),
            content: Bytes::from_static(b"body{}"),
            path,
        }
    }

    #[tokio::test]
    async fn first_record_creates_entry() {
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(cache.path().join("x_test_about"), "<p class=\"a\">").unwrap();

        let tracker = AssociationTracker::new(cache.path().to_path_buf());
        let file = css_file(PathBuf::from("/srv/site.css"));

        let entry = tracker
            .record(&file, "x_test_about")
            .await
            .unwrap()
            .expect("template on record");
        assert_eq!(entry.css, vec![PathBuf::from("/srv/site.css")]);
        assert_eq!(entry.content, vec![cache.path().join("x_test_about")]);
    }

    #[tokio::test]
    async fn empty_slug_yields_no_knowledge() {
        let cache = tempfile::tempdir().unwrap();
        let tracker = AssociationTracker::new(cache.path().to_path_buf());
        let file = css_file(PathBuf::from("/srv/site.css"));

        assert!(tracker.record(&file, "").await.unwrap().is_none());

        // The entry itself still exists in the manifest, just without
        // template knowledge.
        let manifest = tracker.store().load();
        assert!(manifest.get("site").unwrap().content.is_empty());
    }

    #[tokio::test]
    async fn repeated_referrers_do_not_duplicate() {
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(cache.path().join("x_test_about"), "x").unwrap();

        let tracker = AssociationTracker::new(cache.path().to_path_buf());
        let file = css_file(PathBuf::from("/srv/site.css"));

        tracker.record(&file, "x_test_about").await.unwrap();
        let entry = tracker
            .record(&file, "x_test_about")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.content.len(), 1);
    }

    #[tokio::test]
    async fn associations_accumulate_across_pages() {
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(cache.path().join("x_test_about"), "x").unwrap();
        std::fs::write(cache.path().join("x_test_pricing"), "x").unwrap();

        let tracker = AssociationTracker::new(cache.path().to_path_buf());
        let file = css_file(PathBuf::from("/srv/site.css"));

        tracker.record(&file, "x_test_about").await.unwrap();
        let entry = tracker
            .record(&file, "x_test_pricing")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.content.len(), 2);
    }

    #[tokio::test]
    async fn missing_template_files_are_pruned() {
        let cache = tempfile::tempdir().unwrap();
        let about = cache.path().join("x_test_about");
        std::fs::write(&about, "x").unwrap();

        let tracker = AssociationTracker::new(cache.path().to_path_buf());
        let file = css_file(PathBuf::from("/srv/site.css"));

        tracker.record(&file, "x_test_about").await.unwrap();
        std::fs::remove_file(&about).unwrap();

        assert!(tracker.record(&file, "").await.unwrap().is_none());
        let manifest = tracker.store().load();
        assert!(manifest.get("site").unwrap().content.is_empty());
    }

    #[tokio::test]
    async fn stylesheet_key_is_normalized() {
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(cache.path().join("p"), "x").unwrap();

        let tracker = AssociationTracker::new(cache.path().to_path_buf());
        let file = css_file(PathBuf::from("/srv/Main-Styles.css"));

        tracker.record(&file, "p").await.unwrap();
        let manifest = tracker.store().load();
        assert!(manifest.contains_key("main_styles"));
    }
}

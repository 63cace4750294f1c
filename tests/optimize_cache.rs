use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use optiserve::optimize::{CssPipeline, LightningPipeline, OptimizeError, PipelineError};
use optiserve::{AssociationTracker, CssCache, OptimizeOptions, StaticFile};
use pretty_assertions::assert_eq;

/// Pipeline wrapper that counts invocations, with an optional artificial
/// delay to widen concurrency windows.
struct CountingPipeline {
    inner: LightningPipeline,
    purge_calls: AtomicUsize,
    minify_calls: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingPipeline {
    fn new(delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            inner: LightningPipeline::new(),
            purge_calls: AtomicUsize::new(0),
            minify_calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn purges(&self) -> usize {
        self.purge_calls.load(Ordering::SeqCst)
    }

    fn minifies(&self) -> usize {
        self.minify_calls.load(Ordering::SeqCst)
    }
}

impl CssPipeline for CountingPipeline {
    fn purge(&self, css: &str, templates: &[PathBuf]) -> Result<String, PipelineError> {
        self.purge_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.inner.purge(css, templates)
    }

    fn minify(&self, css: &str) -> Result<String, PipelineError> {
        self.minify_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.inner.minify(css)
    }
}

fn stylesheet(dir: &Path, css: &str) -> StaticFile {
    let path = dir.join("site.css");
    std::fs::write(&path, css).expect("write stylesheet");
    StaticFile {
        name: "site".to_string(),
        extension: "css".to_string(),
        content: Bytes::from(css.as_bytes().to_vec()),
        path,
    }
}

fn template(dir: &Path, name: &str, markup: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, markup).expect("write template");
    path
}

fn bump_mtime(path: &Path) {
    let file = std::fs::File::options()
        .write(true)
        .open(path)
        .expect("open for mtime bump");
    file.set_modified(SystemTime::now() + Duration::from_secs(10))
        .expect("set mtime");
}

// ============================================================================
// Memoization: unchanged fingerprints never recompute
// ============================================================================

#[tokio::test]
async fn repeat_call_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let tpl = template(dir.path(), "x_test_about", r#"<div class="keep"></div>"#);
    let file = stylesheet(
        dir.path(),
        ".keep { margin-top: 1px; } .gone { padding-left: 2px; }",
    );

    let pipeline = CountingPipeline::new(None);
    let cache = CssCache::with_pipeline(
        OptimizeOptions::default(),
        Arc::clone(&pipeline) as Arc<dyn CssPipeline>,
    );

    let first = cache.optimize(&file, &[tpl.clone()]).await.unwrap();
    let second = cache.optimize(&file, &[tpl]).await.unwrap();

    assert_eq!(first.css(), second.css());
    assert_eq!(pipeline.purges(), 1);
    assert_eq!(pipeline.minifies(), 1);
}

#[tokio::test]
async fn empty_template_set_never_purges() {
    let dir = tempfile::tempdir().unwrap();
    let file = stylesheet(dir.path(), ".a { margin-top: 1px; }");

    let pipeline = CountingPipeline::new(None);
    let cache = CssCache::with_pipeline(
        OptimizeOptions::default(),
        Arc::clone(&pipeline) as Arc<dyn CssPipeline>,
    );

    let out = cache.optimize(&file, &[]).await.unwrap();

    assert!(!out.purged());
    assert_eq!(pipeline.purges(), 0);
    assert_eq!(pipeline.minifies(), 1);
}

// ============================================================================
// Invalidation: modification times drive the fingerprint
// ============================================================================

#[tokio::test]
async fn touched_template_recomputes() {
    let dir = tempfile::tempdir().unwrap();
    let tpl = template(dir.path(), "x_test_about", r#"<div class="keep"></div>"#);
    let file = stylesheet(dir.path(), ".keep { margin-top: 1px; }");

    let pipeline = CountingPipeline::new(None);
    let cache = CssCache::with_pipeline(
        OptimizeOptions::default(),
        Arc::clone(&pipeline) as Arc<dyn CssPipeline>,
    );

    let first = cache.optimize(&file, &[tpl.clone()]).await.unwrap();
    bump_mtime(&tpl);
    let second = cache.optimize(&file, &[tpl]).await.unwrap();

    // Same inputs, so the same output, but computed twice.
    assert_eq!(first.css(), second.css());
    assert_eq!(pipeline.purges(), 2);
}

#[tokio::test]
async fn touching_a_template_does_not_change_the_manifest() {
    let cache_dir = tempfile::tempdir().unwrap();
    let assets = tempfile::tempdir().unwrap();
    let tpl = template(cache_dir.path(), "x_test_about", r#"<div class="keep"></div>"#);
    let file = stylesheet(assets.path(), ".keep { margin-top: 1px; }");

    let tracker = AssociationTracker::new(cache_dir.path().to_path_buf());
    let before = tracker
        .record(&file, "x_test_about")
        .await
        .unwrap()
        .expect("template on record");

    bump_mtime(&tpl);
    let after = tracker.record(&file, "").await.unwrap().expect("still on record");

    assert_eq!(before.content, after.content);
}

#[tokio::test]
async fn touched_stylesheet_recomputes() {
    let dir = tempfile::tempdir().unwrap();
    let tpl = template(dir.path(), "x_test_about", r#"<div class="keep"></div>"#);
    let file = stylesheet(dir.path(), ".keep { margin-top: 1px; }");

    let pipeline = CountingPipeline::new(None);
    let cache = CssCache::with_pipeline(
        OptimizeOptions::default(),
        Arc::clone(&pipeline) as Arc<dyn CssPipeline>,
    );

    cache.optimize(&file, &[tpl.clone()]).await.unwrap();
    bump_mtime(&file.path);
    cache.optimize(&file, &[tpl]).await.unwrap();

    assert_eq!(pipeline.purges(), 2);
}

#[tokio::test]
async fn template_order_does_not_change_the_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let a = template(dir.path(), "x_test_about", r#"<div class="keep"></div>"#);
    let b = template(dir.path(), "x_test_pricing", r#"<div class="keep"></div>"#);
    let file = stylesheet(dir.path(), ".keep { margin-top: 1px; }");

    let pipeline = CountingPipeline::new(None);
    let cache = CssCache::with_pipeline(
        OptimizeOptions::default(),
        Arc::clone(&pipeline) as Arc<dyn CssPipeline>,
    );

    cache.optimize(&file, &[a.clone(), b.clone()]).await.unwrap();
    cache.optimize(&file, &[b, a]).await.unwrap();

    assert_eq!(pipeline.purges(), 1);
}

// ============================================================================
// Tracker pruning feeds back into the fingerprint
// ============================================================================

#[tokio::test]
async fn deleted_template_is_pruned_and_leaves_the_fingerprint() {
    let cache_dir = tempfile::tempdir().unwrap();
    let assets = tempfile::tempdir().unwrap();
    template(cache_dir.path(), "x_test_about", r#"<div class="keep"></div>"#);
    let pricing = template(cache_dir.path(), "x_test_pricing", r#"<div class="keep"></div>"#);
    let file = stylesheet(assets.path(), ".keep { margin-top: 1px; }");

    let tracker = AssociationTracker::new(cache_dir.path().to_path_buf());
    tracker.record(&file, "x_test_about").await.unwrap();
    let entry = tracker
        .record(&file, "x_test_pricing")
        .await
        .unwrap()
        .expect("two templates on record");
    assert_eq!(entry.content.len(), 2);

    let pipeline = CountingPipeline::new(None);
    let cache = CssCache::with_pipeline(
        OptimizeOptions::default(),
        Arc::clone(&pipeline) as Arc<dyn CssPipeline>,
    );
    cache.optimize(&file, &entry.content).await.unwrap();

    std::fs::remove_file(&pricing).unwrap();
    let entry = tracker
        .record(&file, "")
        .await
        .unwrap()
        .expect("one template left");
    assert_eq!(entry.content.len(), 1);

    // New fingerprint excludes the deleted template, so this recomputes
    // instead of erroring on its missing mtime.
    let out = cache.optimize(&file, &entry.content).await.unwrap();
    assert!(out.purged());
    assert_eq!(pipeline.purges(), 2);
}

// ============================================================================
// Single-flight: one computation per fingerprint, shared by all callers
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_share_one_computation() {
    let dir = tempfile::tempdir().unwrap();
    let tpl = template(dir.path(), "x_test_about", r#"<div class="keep"></div>"#);
    let file = stylesheet(dir.path(), ".keep { margin-top: 1px; }");

    let pipeline = CountingPipeline::new(Some(Duration::from_millis(150)));
    let cache = CssCache::with_pipeline(
        OptimizeOptions::default(),
        Arc::clone(&pipeline) as Arc<dyn CssPipeline>,
    );

    let mut handles = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        let file = file.clone();
        let tpl = tpl.clone();
        handles.push(tokio::spawn(
            async move { cache.optimize(&file, &[tpl]).await },
        ));
    }

    let mut outputs = Vec::new();
    for handle in handles {
        outputs.push(handle.await.unwrap().unwrap().css());
    }

    assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(pipeline.purges(), 1);
    assert_eq!(pipeline.minifies(), 1);
}

// ============================================================================
// Bounded wait: timed-out callers fall back, the computation still lands
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_falls_back_while_the_computation_populates_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let tpl = template(dir.path(), "x_test_about", r#"<div class="keep"></div>"#);
    let file = stylesheet(dir.path(), ".keep { margin-top: 1px; }");

    let pipeline = CountingPipeline::new(Some(Duration::from_millis(200)));
    let options = OptimizeOptions {
        timeout: Some(Duration::from_millis(20)),
        ..Default::default()
    };
    let cache =
        CssCache::with_pipeline(options, Arc::clone(&pipeline) as Arc<dyn CssPipeline>);

    let err = cache.optimize(&file, &[tpl.clone()]).await.unwrap_err();
    assert!(matches!(err, OptimizeError::Timeout(_)));

    // Let the abandoned computation finish.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let out = cache.optimize(&file, &[tpl]).await.unwrap();
    assert!(out.purged());
    assert_eq!(pipeline.purges(), 1, "cache was populated by the abandoned run");
}

//! Memoized, single-flight stylesheet optimization.
//!
//! Optimized output is cached under a fingerprint of every file contributing
//! to it: the stylesheet's path and modification time plus the sorted
//! `(path, mtime)` pairs of the tracked templates. An unchanged fingerprint
//! returns the cached bytes with no I/O and no recomputation. Concurrent
//! requests for the same fingerprint share a single computation through a
//! per-fingerprint watch channel; the channel entry is removed once the
//! computation resolves, success or failure.
//!
//! Failures never propagate as responses. The caller maps any [`OptimizeError`]
//! to "serve the unmodified original".

pub mod pipeline;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;

use crate::directory::StaticFile;
use crate::OptimizeOptions;
pub use pipeline::{CssPipeline, LightningPipeline, PipelineError};

/// Successful optimization outcome.
#[derive(Debug, Clone)]
pub enum Optimized {
    /// Unused selectors removed, then minified.
    Purged(Arc<str>),
    /// Minified only: no templates on record, selector removal disabled, or
    /// selector removal failed while minification still succeeded.
    MinifiedOnly(Arc<str>),
}

impl Optimized {
    /// The optimized stylesheet text.
    pub fn css(&self) -> Arc<str> {
        match self {
            Optimized::Purged(css) | Optimized::MinifiedOnly(css) => Arc::clone(css),
        }
    }

    /// Whether unused selectors were removed.
    pub fn purged(&self) -> bool {
        matches!(self, Optimized::Purged(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum OptimizeError {
    #[error("modification time unavailable for '{path}'")]
    Mtime { path: String },

    #[error("stylesheet pipeline failed: {0}")]
    Pipeline(String),

    #[error("optimization timed out after {0:?}")]
    Timeout(Duration),

    #[error("optimization task aborted")]
    Aborted,
}

type Outcome = Result<Optimized, OptimizeError>;

/// Memoizing layer over the purge/minify pipeline.
///
/// Cheap to clone; clones share the same caches.
#[derive(Clone)]
pub struct CssCache {
    options: OptimizeOptions,
    pipeline: Arc<dyn CssPipeline>,
    results: Arc<DashMap<String, Optimized>>,
    in_flight: Arc<DashMap<String, watch::Receiver<Option<Outcome>>>>,
}

impl CssCache {
    pub fn new(options: OptimizeOptions) -> Self {
        Self::with_pipeline(options, Arc::new(LightningPipeline::new()))
    }

    /// Build a cache over a custom pipeline. Tests use this to count
    /// invocations.
    pub fn with_pipeline(options: OptimizeOptions, pipeline: Arc<dyn CssPipeline>) -> Self {
        Self {
            options,
            pipeline,
            results: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Produce optimized bytes for `file` using `templates` as the purge
    /// reference set.
    ///
    /// With an empty `templates`, purging is skipped and the stylesheet is
    /// minified only. Any error means "no optimized output available" and the
    /// caller falls back to the original content.
    pub async fn optimize(&self, file: &StaticFile, templates: &[PathBuf]) -> Outcome {
        let purge = self.options.remove_unused_css && !templates.is_empty();
        let fingerprint = self.fingerprint(file, templates, purge)?;

        if let Some(hit) = self.results.get(&fingerprint) {
            tracing::debug!(stylesheet = %file.path.display(), "optimization cache hit");
            return Ok(hit.clone());
        }

        // Single-flight: the first caller for a fingerprint registers the
        // channel and spawns the computation; everyone else attaches.
        let mut spawn_with = None;
        let rx = match self.in_flight.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx.clone());
                spawn_with = Some(tx);
                rx
            }
        };
        if let Some(tx) = spawn_with {
            self.spawn_computation(fingerprint, file, templates.to_vec(), purge, tx);
        }

        match self.options.timeout {
            Some(limit) => tokio::time::timeout(limit, await_outcome(rx))
                .await
                .map_err(|_| OptimizeError::Timeout(limit))?,
            None => await_outcome(rx).await,
        }
    }

    /// Run the pipeline on a blocking thread and broadcast the outcome. The
    /// task is detached from its callers: a caller that stops waiting does
    /// not cancel it, and a late result still lands in the cache.
    fn spawn_computation(
        &self,
        fingerprint: String,
        file: &StaticFile,
        templates: Vec<PathBuf>,
        purge: bool,
        tx: watch::Sender<Option<Outcome>>,
    ) {
        let cache = self.clone();
        let css = String::from_utf8_lossy(&file.content).into_owned();
        let stylesheet = file.path.clone();

        tokio::spawn(async move {
            let pipeline = Arc::clone(&cache.pipeline);
            let outcome = tokio::task::spawn_blocking(move || {
                run_pipeline(pipeline.as_ref(), &css, &templates, purge)
            })
            .await
            .map_err(|_| OptimizeError::Aborted)
            .and_then(|result| result);

            match &outcome {
                Ok(optimized) => {
                    cache.results.insert(fingerprint.clone(), optimized.clone());
                }
                Err(err) => {
                    tracing::warn!(stylesheet = %stylesheet.display(), %err, "stylesheet optimization failed");
                }
            }
            cache.in_flight.remove(&fingerprint);
            let _ = tx.send(Some(outcome));
        });
    }

    /// Deterministic memoization key: stylesheet path, effective purge flag,
    /// stylesheet mtime, then `(path, mtime)` per template sorted by path so
    /// the key is independent of insertion order.
    fn fingerprint(
        &self,
        file: &StaticFile,
        templates: &[PathBuf],
        purge: bool,
    ) -> Result<String, OptimizeError> {
        let mut pairs = templates
            .iter()
            .map(|path| Ok((path.clone(), mtime_millis(path)?)))
            .collect::<Result<Vec<_>, OptimizeError>>()?;
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut key = format!(
            "{}|purge={purge}|self={}",
            file.path.display(),
            mtime_millis(&file.path)?
        );
        for (path, mtime) in pairs {
            let _ = write!(key, "|{}={mtime}", path.display());
        }
        Ok(key)
    }
}

async fn await_outcome(mut rx: watch::Receiver<Option<Outcome>>) -> Outcome {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return Err(OptimizeError::Aborted);
        }
    }
}

/// Purge failure degrades to minified-only; minify failure is total.
fn run_pipeline(
    pipeline: &dyn CssPipeline,
    css: &str,
    templates: &[PathBuf],
    purge: bool,
) -> Outcome {
    if purge {
        match pipeline.purge(css, templates) {
            Ok(purged) => {
                let minified = pipeline
                    .minify(&purged)
                    .map_err(|e| OptimizeError::Pipeline(e.to_string()))?;
                return Ok(Optimized::Purged(minified.into()));
            }
            Err(err) => {
                tracing::warn!(%err, "selector removal failed, minifying unpurged stylesheet");
            }
        }
    }

    let minified = pipeline
        .minify(css)
        .map_err(|e| OptimizeError::Pipeline(e.to_string()))?;
    Ok(Optimized::MinifiedOnly(minified.into()))
}

fn mtime_millis(path: &Path) -> Result<u128, OptimizeError> {
    let modified = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|_| OptimizeError::Mtime {
            path: path.display().to_string(),
        })?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis())
}

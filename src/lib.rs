//! # Optiserve
//!
//! Static asset server with an on-demand CSS optimization cache.
//!
//! Assets are served from one or more root directories. Stylesheet
//! responses additionally run through an optimization pipeline that removes
//! selectors unused by the pages known to reference the stylesheet, then
//! minifies the result. The expensive part is memoized: which pages
//! reference a stylesheet is learned from the `Referer` of incoming
//! requests and persisted in a manifest, and optimized output is cached
//! under a fingerprint of every contributing file's modification time.
//!
//! # Architecture
//!
//! ```text
//! request → AssetDirectory (lookup) → StaticAssets (respond)
//!                                         │ stylesheet?
//!                                         ▼
//!         referrer slug → AssociationTracker → ManifestStore (JSON)
//!                                         │
//!                                         ▼
//!                     CssCache (fingerprint, single-flight, memoized)
//!                                         │
//!                                         ▼
//!                     CssPipeline (purge unused selectors, minify)
//! ```
//!
//! Optimization is strictly best-effort: any failure falls back to the
//! unmodified stylesheet bytes, never to a failed response.

pub mod directory;
pub mod manifest;
pub mod optimize;
pub mod referrer;
pub mod serve;
pub mod tracker;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use directory::{AssetDirectory, StaticFile};
pub use manifest::{Manifest, ManifestEntry, ManifestStore};
pub use optimize::{CssCache, OptimizeError, Optimized};
pub use serve::{ServeOutcome, StaticAssets};
pub use tracker::AssociationTracker;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Configuration for the asset server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticOptions {
    /// File extensions (with leading dot) eligible for serving.
    pub allowed_extensions: Vec<String>,
    /// Appended to request paths that carry no extension.
    pub default_extension: String,
    /// On a disallowed method: pass to the next handler (`true`) or answer
    /// with an explicit 403 (`false`).
    pub fall_through: bool,
    /// Directory holding the manifest and the per-page template files.
    /// Stylesheet optimization is skipped entirely when unset or missing.
    pub cache_dir: Option<PathBuf>,
    /// Stylesheet optimization switches.
    pub optimize: OptimizeOptions,
    /// Files larger than this are never buffered in memory; they are
    /// streamed from disk instead.
    pub max_buffered_size: u64,
}

impl Default for StaticOptions {
    fn default() -> Self {
        Self {
            allowed_extensions: [".html", ".htm", ".css", ".js", ".json"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
            default_extension: ".html".to_string(),
            fall_through: true,
            cache_dir: None,
            optimize: OptimizeOptions::default(),
            max_buffered_size: 8 * 1024 * 1024,
        }
    }
}

/// Switches for the stylesheet optimization pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeOptions {
    /// Master switch for stylesheet optimization.
    pub css: bool,
    /// Remove selectors unused by the tracked templates. Minification still
    /// applies when this is off.
    pub remove_unused_css: bool,
    /// How long a request waits for an optimization computation before
    /// serving the original. The computation keeps running and its result
    /// still lands in the cache. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            css: true,
            remove_unused_css: true,
            timeout: Some(Duration::from_secs(10)),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while constructing the server. Configuration problems are
/// fatal at setup time, before any request is handled.
#[derive(Debug, Error)]
pub enum StaticError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

//! The asset responder.
//!
//! Per-request state machine: method check, default-extension resolution,
//! directory lookup, then buffered, streamed, or optimized delivery.
//! Stylesheets go through the association tracker and the optimization cache
//! when optimization is enabled; everything else is raw bytes. A resolved
//! file always produces a response — optimization failures fall back to the
//! original content, never to an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use tokio_util::io::ReaderStream;

use crate::directory::{AssetDirectory, StaticFile};
use crate::optimize::CssCache;
use crate::referrer;
use crate::tracker::AssociationTracker;
use crate::{StaticError, StaticOptions};

/// What a request resolved to.
#[derive(Debug)]
pub enum ServeOutcome {
    /// A complete response.
    Response(Response),
    /// Not handled here; pass to the next handler.
    Next,
}

/// The static asset server.
pub struct StaticAssets {
    directory: AssetDirectory,
    options: StaticOptions,
    css: Option<CssContext>,
}

/// Present only while stylesheet optimization is active.
struct CssContext {
    tracker: AssociationTracker,
    cache: CssCache,
}

impl StaticAssets {
    /// Validate the configuration and index the asset roots. Configuration
    /// problems are fatal here, before any request is handled.
    pub fn new(roots: Vec<PathBuf>, options: StaticOptions) -> Result<Self, StaticError> {
        if roots.is_empty() {
            return Err(StaticError::Config(
                "at least one asset root is required".to_string(),
            ));
        }
        if !options.default_extension.is_empty() && !options.default_extension.starts_with('.') {
            return Err(StaticError::Config(format!(
                "default_extension must start with '.': '{}'",
                options.default_extension
            )));
        }

        let roots: Vec<PathBuf> = roots.into_iter().map(trim_trailing_slashes).collect();
        for root in &roots {
            if !root.is_dir() {
                return Err(StaticError::Config(format!(
                    "asset root '{}' is not a directory",
                    root.display()
                )));
            }
        }

        let css = match (&options.cache_dir, options.optimize.css) {
            (Some(dir), true) if dir.is_dir() => Some(CssContext {
                tracker: AssociationTracker::new(dir.clone()),
                cache: CssCache::new(options.optimize.clone()),
            }),
            _ => None,
        };

        let directory = AssetDirectory::new(
            roots,
            &options.allowed_extensions,
            options.max_buffered_size,
        );

        Ok(Self {
            directory,
            options,
            css,
        })
    }

    /// The backing asset directory.
    pub fn directory(&self) -> &AssetDirectory {
        &self.directory
    }

    /// Resolve one request.
    pub async fn handle(
        &self,
        method: &Method,
        path: &str,
        referer: Option<&str>,
    ) -> ServeOutcome {
        if method != Method::GET && method != Method::HEAD {
            if self.options.fall_through {
                return ServeOutcome::Next;
            }
            return ServeOutcome::Response(method_not_allowed());
        }

        let mut lookup = path.to_string();
        if Path::new(path).extension().is_none() && !self.options.default_extension.is_empty() {
            lookup.push_str(&self.options.default_extension);
        }

        if let Some(file) = self.directory.get(&lookup) {
            if file.extension == "css" {
                if let Some(ctx) = &self.css {
                    let body = match self.optimized_css(ctx, file.as_ref(), referer).await {
                        Some(css) => Bytes::copy_from_slice(css.as_bytes()),
                        None => file.content.clone(),
                    };
                    return ServeOutcome::Response(buffered(&file.extension, body));
                }
            }
            return ServeOutcome::Response(buffered(&file.extension, file.content.clone()));
        }

        // Files too large to buffer (or created after the scan) stream from
        // disk. The handle is held only for the duration of the stream; read
        // errors surface through the body.
        if let Some(disk_path) = self.directory.find_on_disk(&lookup) {
            return match tokio::fs::File::open(&disk_path).await {
                Ok(handle) => {
                    let mime = mime_guess::from_path(&disk_path).first_or_text_plain();
                    let response = Response::builder()
                        .status(StatusCode::OK)
                        .header(header::CONTENT_TYPE, mime.as_ref())
                        .body(Body::from_stream(ReaderStream::new(handle)))
                        .expect("stream response");
                    ServeOutcome::Response(response)
                }
                Err(err) => {
                    tracing::warn!(path = %disk_path.display(), %err, "failed to open asset for streaming");
                    ServeOutcome::Next
                }
            };
        }

        ServeOutcome::Next
    }

    /// Best-effort stylesheet optimization. `None` means "serve the original
    /// bytes".
    async fn optimized_css(
        &self,
        ctx: &CssContext,
        file: &StaticFile,
        referer: Option<&str>,
    ) -> Option<Arc<str>> {
        let slug = referrer::referrer_slug(referer);

        let entry = match ctx.tracker.record(file, &slug).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(stylesheet = %file.path.display(), %err, "manifest update failed, serving original");
                return None;
            }
        };

        let templates = entry.map(|e| e.content).unwrap_or_default();
        match ctx.cache.optimize(file, &templates).await {
            Ok(optimized) => Some(optimized.css()),
            Err(err) => {
                tracing::warn!(stylesheet = %file.path.display(), %err, "optimization unavailable, serving original");
                None
            }
        }
    }

    /// Mount the responder as an axum fallback route. `ServeOutcome::Next`
    /// maps to a plain 404 here; embedders that need real middleware
    /// chaining consume [`StaticAssets::handle`] directly.
    pub fn into_router(self) -> Router {
        let assets = Arc::new(self);
        Router::new().fallback(handle_request).with_state(assets)
    }

    /// Bind a listener and serve until shutdown.
    pub async fn serve(self, addr: &str) -> Result<(), StaticError> {
        let router = self.into_router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "serving static assets");
        axum::serve(listener, router).await?;
        Ok(())
    }
}

async fn handle_request(State(assets): State<Arc<StaticAssets>>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let referer = req
        .headers()
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match assets.handle(&method, &path, referer.as_deref()).await {
        ServeOutcome::Response(response) => response,
        ServeOutcome::Next => StatusCode::NOT_FOUND.into_response(),
    }
}

fn method_not_allowed() -> Response {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header(header::ALLOW, "GET, HEAD")
        .header(header::CONTENT_LENGTH, "0")
        .body(Body::empty())
        .expect("static response")
}

fn buffered(extension: &str, bytes: Bytes) -> Response {
    let mime = mime_guess::from_ext(extension).first_or_text_plain();
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime.as_ref())
        .body(Body::from(bytes))
        .expect("static response")
}

fn trim_trailing_slashes(path: PathBuf) -> PathBuf {
    let raw = path.to_string_lossy();
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

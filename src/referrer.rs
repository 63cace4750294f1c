//! Referrer resolution.
//!
//! The page that references a stylesheet is only known indirectly: through
//! the `Referer` header of the request that fetches the stylesheet. That
//! address is reduced to a filesystem-safe slug (`host` + `path`,
//! snake_cased) which doubles as the file name of the page's template
//! snapshot inside the cache directory.

use std::path::{Path, PathBuf};

use url::Url;

/// Derive the tracking slug for a referring-page address.
///
/// Absent, relative, or malformed addresses yield the empty slug, which
/// disables template tracking for the request. This never fails.
pub fn referrer_slug(referer: Option<&str>) -> String {
    let raw = match referer {
        Some(r) if !r.trim().is_empty() => r,
        _ => return String::new(),
    };

    match Url::parse(raw) {
        Ok(url) => {
            let host = url.host_str().unwrap_or("");
            if host.is_empty() {
                return String::new();
            }
            snake_case(&format!("{} {}", host, url.path()))
        }
        Err(_) => String::new(),
    }
}

/// The template file a non-empty slug maps to inside the cache directory.
pub fn template_path(cache_dir: &Path, slug: &str) -> PathBuf {
    cache_dir.join(slug)
}

/// Lowercased, underscore-separated normalization. Runs of
/// non-alphanumeric characters collapse into a single separator; camelCase
/// boundaries also separate.
pub fn snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_sep = false;
    let mut prev_lower = false;

    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            } else if ch.is_ascii_uppercase() && prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            pending_sep = false;
        } else {
            pending_sep = true;
            prev_lower = false;
        }
    }

    out
}

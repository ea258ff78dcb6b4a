//! Which image URLs may be cached.
//!
//! Local handles (`blob:`, `data:`) are already in memory. Signed URLs expire
//! within minutes, so a cached copy would outlive the permission to fetch it
//! and key the cache on a one-off token.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static SIGNED_QUERY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(^|&)(x-amz-signature|x-amz-expires|x-amz-credential|x-goog-signature|signature|sig|expires)=")
        .ok()
});

/// Why a URL bypasses the cache, if it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bypass {
    LocalHandle,
    SignedUrl,
    Unparseable,
}

/// `None` when `raw` may be cached.
pub fn bypass_reason(raw: &str) -> Option<Bypass> {
    let Ok(url) = Url::parse(raw) else {
        return Some(Bypass::Unparseable);
    };
    match url.scheme() {
        "blob" | "data" => return Some(Bypass::LocalHandle),
        "http" | "https" => {}
        _ => return Some(Bypass::Unparseable),
    }

    let signed = url
        .query()
        .zip(SIGNED_QUERY.as_ref())
        .is_some_and(|(query, pattern)| pattern.is_match(query));
    signed.then_some(Bypass::SignedUrl)
}

pub fn is_cacheable(raw: &str) -> bool {
    bypass_reason(raw).is_none()
}

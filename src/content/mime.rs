//! MIME types and cache lifetimes.

use std::collections::HashMap;
use std::path::Path;

/// MIME lookup plus the configured cache lifetime per type.
#[derive(Debug, Clone, Default)]
pub struct MimeTypes {
    expires: HashMap<String, u64>,
}

impl MimeTypes {
    /// `expires` maps a MIME type (`text/css`) or family (`image/*`) to seconds.
    pub fn new(expires: HashMap<String, u64>) -> Self {
        let expires = expires
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self { expires }
    }

    /// MIME type by file extension; unknown extensions are octet streams.
    pub fn guess(&self, path: &Path) -> String {
        mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }

    /// Cache lifetime in seconds. `None` when unset or zero.
    pub fn expiry(&self, mime: &str) -> Option<u64> {
        let mime = mime.to_ascii_lowercase();
        let family = mime.split('/').next().map(|t| format!("{}/*", t));
        self.expires
            .get(&mime)
            .or_else(|| family.and_then(|f| self.expires.get(&f)))
            .copied()
            .filter(|secs| *secs > 0)
    }
}

//! Case-insensitive, order-preserving header storage.

/// Ordered multimap of header fields with case-insensitive names.
///
/// Names keep the spelling they were first inserted with; lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value of `name` with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut idx = pos + 1;
                while idx < self.entries.len() {
                    if self.entries[idx].0.eq_ignore_ascii_case(&name) {
                        self.entries.remove(idx);
                    } else {
                        idx += 1;
                    }
                }
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Append a value, keeping any existing ones (e.g. `Set-Cookie`).
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Merge a value into an existing field with a comma, as duplicate request headers are.
    pub fn append_joined(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// True when the comma-separated field `name` carries `token` (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_ignore_case() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Type", "text/html");
        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert!(headers.contains("CONTENT-TYPE"));
    }

    #[test]
    fn set_replaces_all_values() {
        let mut headers = HeaderMap::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("set-cookie", "b=2");
        headers.set("SET-COOKIE", "c=3");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("Set-Cookie"), Some("c=3"));
    }

    #[test]
    fn append_joined_merges_duplicates() {
        let mut headers = HeaderMap::new();
        headers.append_joined("Accept", "text/html");
        headers.append_joined("accept", "text/plain");
        assert_eq!(headers.get("Accept"), Some("text/html, text/plain"));
    }

    #[test]
    fn token_lookup() {
        let mut headers = HeaderMap::new();
        headers.set("Connection", "Upgrade, Close");
        assert!(headers.has_token("connection", "close"));
        assert!(!headers.has_token("connection", "keep-alive"));
    }
}

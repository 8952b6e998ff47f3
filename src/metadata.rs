//! Call metadata (initial metadata and trailers).

/// Metadata key-value pairs.
///
/// Keys are normalized to lowercase ASCII. Insertion order is preserved and
/// a key may carry several values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into().to_ascii_lowercase();
        self.entries.push((key, value.into()));
    }

    /// Get the first value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).next()
    }

    /// Get all values for a key, in insertion order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Append every entry of `other`.
    pub fn extend(&mut self, other: &Metadata) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries, counting repeated keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_keys_are_case_insensitive() {
        let mut md = Metadata::new();
        md.insert("X-Request-Id", "42");

        assert_eq!(md.get("x-request-id"), Some("42"));
        assert_eq!(md.get("X-REQUEST-ID"), Some("42"));
        assert!(md.contains_key("x-Request-id"));
        assert!(!md.contains_key("other"));
    }

    #[test]
    fn test_metadata_multiple_values_keep_order() {
        let mut md = Metadata::new();
        md.insert("key", "value1");
        md.insert("other", "x");
        md.insert("key", "value2");

        assert_eq!(md.get("key"), Some("value1"));
        assert_eq!(md.get_all("key").collect::<Vec<_>>(), ["value1", "value2"]);
        assert_eq!(md.len(), 3);
    }

    #[test]
    fn test_metadata_extend() {
        let mut a: Metadata = [("a", "1")].into_iter().collect();
        let b: Metadata = [("b", "2"), ("a", "3")].into_iter().collect();
        a.extend(&b);

        let entries: Vec<_> = a.iter().collect();
        assert_eq!(entries, [("a", "1"), ("b", "2"), ("a", "3")]);
    }

    #[test]
    fn test_metadata_empty() {
        let md = Metadata::new();
        assert!(md.is_empty());
        assert_eq!(md.len(), 0);
        assert!(md.get("missing").is_none());
        assert_eq!(md.get_all("missing").count(), 0);
    }
}

//! Case-insensitive header map.

use crate::{Error, Result};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// A header map with case-insensitive keys.
///
/// The last write for a key wins, but the casing of the name as it was first
/// inserted is kept for enumeration.
///
/// # Examples
///
/// ```
/// use skypipe::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Length", "42");
/// headers.insert("content-length", "43");
///
/// assert_eq!(headers.get("CONTENT-LENGTH"), Some("43"));
/// assert_eq!(headers.iter().next(), Some(("Content-Length", "43")));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    // lowercase name -> (name as first inserted, value)
    entries: BTreeMap<String, (String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any previous value for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.entry(name.to_ascii_lowercase()) {
            Entry::Occupied(mut entry) => entry.get_mut().1 = value,
            Entry::Vacant(entry) => {
                entry.insert((name, value));
            }
        }
    }

    /// Returns the value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    /// Returns `true` if a header with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Removes a header, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries
            .remove(&name.to_ascii_lowercase())
            .map(|(_, value)| value)
    }

    /// Iterates `(name, value)` pairs in case-insensitive name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Number of distinct headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every header.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Copies every header of `other` into `self`, overwriting on collision.
    pub fn extend_from(&mut self, other: &Headers) {
        for (name, value) in other.iter() {
            self.insert(name, value);
        }
    }

    /// Converts to an `http::HeaderMap` for handing to a transport.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a name or value is not valid HTTP.
    pub fn to_header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::with_capacity(self.len());
        for (name, value) in self.iter() {
            let (name, value) = validate(name, value)?;
            map.insert(name, value);
        }
        Ok(map)
    }

    /// Builds from an `http::HeaderMap`. Non-UTF-8 values are skipped and
    /// repeated values are joined with `", "`.
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut headers = Headers::new();
        for name in map.keys() {
            let values: Vec<&str> = map
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            if !values.is_empty() {
                headers.insert(name.as_str(), values.join(", "));
            }
        }
        headers
    }
}

/// Checks that `name` and `value` are legal on the wire.
pub(crate) fn validate(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::try_from(name)
        .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
    let value = HeaderValue::try_from(value)
        .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
    Ok((name, value))
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.insert("Content-Length", "10");

        assert_eq!(headers.get("content-length"), Some("10"));
        assert_eq!(headers.get("CONTENT-LENGTH"), Some("10"));
        assert!(headers.contains("content-LENGTH"));
    }

    #[test]
    fn test_last_write_wins_first_casing_kept() {
        let mut headers = Headers::new();
        headers.insert("X-Custom", "one");
        headers.insert("x-custom", "two");

        assert_eq!(headers.len(), 1);
        let entries: Vec<_> = headers.iter().collect();
        assert_eq!(entries, vec![("X-Custom", "two")]);
    }

    #[test]
    fn test_remove() {
        let mut headers = Headers::new();
        headers.insert("Authorization", "Bearer t");
        assert_eq!(headers.remove("authorization"), Some("Bearer t".to_string()));
        assert!(headers.is_empty());
    }

    #[test]
    fn test_to_header_map_rejects_newlines() {
        let mut headers = Headers::new();
        headers.insert("x-bad", "a\r\nb");
        assert!(matches!(
            headers.to_header_map(),
            Err(Error::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_from_header_map_joins_repeats() {
        let mut map = HeaderMap::new();
        map.append("vary", HeaderValue::from_static("accept"));
        map.append("vary", HeaderValue::from_static("origin"));

        let headers = Headers::from_header_map(&map);
        assert_eq!(headers.get("Vary"), Some("accept, origin"));
    }
}

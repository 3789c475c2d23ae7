//! Per-call request description used by [`Client::call`](crate::Client::call).

use crate::headers::{self, Headers};
use http::Method;
use std::collections::BTreeMap;

/// Method, path, headers and query parameters for one client call.
///
/// The path is resolved against the client's base URL.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    /// The HTTP method.
    pub method: Method,

    /// Path relative to the base URL, e.g. `/secrets/db-password`.
    pub path: String,

    /// Headers added on top of the client's default headers.
    pub headers: Headers,

    /// Query parameters, appended in key order.
    pub query_params: BTreeMap<String, String>,
}

impl RequestMetadata {
    /// Creates metadata for `method` on `path`.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Headers::new(),
            query_params: BTreeMap::new(),
        }
    }

    /// Adds a header.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the name or value is not a valid
    /// HTTP header.
    pub fn with_header(
        mut self,
        name: impl AsRef<str>,
        value: impl AsRef<str>,
    ) -> Result<Self, crate::Error> {
        headers::validate(name.as_ref(), value.as_ref())?;
        self.headers.insert(name.as_ref(), value.as_ref());
        Ok(self)
    }

    /// Adds a query parameter to the request.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    /// Adds multiple query parameters to the request.
    pub fn with_query_params(mut self, params: impl IntoIterator<Item = (String, String)>) -> Self {
        self.query_params.extend(params);
        self
    }
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self::new(Method::GET, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_header_validates() {
        let metadata = RequestMetadata::new(Method::GET, "/items")
            .with_header("X-Trace", "abc")
            .unwrap();
        assert_eq!(metadata.headers.get("x-trace"), Some("abc"));

        let result = RequestMetadata::default().with_header("X-Bad", "line\r\nbreak");
        assert!(matches!(result, Err(crate::Error::ConfigurationError(_))));
    }

    #[test]
    fn test_query_params_are_ordered() {
        let metadata = RequestMetadata::default()
            .with_query_param("b", "2")
            .with_query_params(vec![("a".to_string(), "1".to_string())]);
        let keys: Vec<_> = metadata.query_params.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}

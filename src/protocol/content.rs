//! Typed payloads carried inside envelopes.
//!
//! Field order of every struct here is part of the wire format: postcard
//! encodes fields positionally. Append new fields at the end only.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

/// Status code reported when a response leaves it unset.
pub const DEFAULT_STATUS: u16 = 200;

/// Case-insensitive header map. Keys are stored lowercase and are unique;
/// repeated headers keep every value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, keeping any values already present for `name`.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .entry(name.as_ref().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Replace all values of `name` with a single value.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(name.as_ref().to_ascii_lowercase(), vec![value.into()]);
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(name, value)` pairs, one per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(name, values)| {
            values.iter().map(move |value| (name.as_str(), value.as_str()))
        })
    }

    /// Copy an `http` header map. Values that are not visible ASCII are
    /// dropped rather than rewritten.
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut headers = Self::new();
        for (name, value) in map {
            match value.to_str() {
                Ok(v) => headers.append(name.as_str(), v),
                Err(_) => tracing::warn!(header = %name, len = value.len(), "Dropping header with non-text value"),
            }
        }
        headers
    }

    /// Build an `http` header map, skipping entries that are not valid header
    /// names or values.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in self.iter() {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                tracing::debug!(header = %name, "Dropping invalid header");
                continue;
            };
            map.append(name, value);
        }
        map
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

/// A public HTTP request forwarded to an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestContent {
    pub method: String,
    /// Path and query, relative to the agent's local server.
    pub uri: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequestContent {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// The agent's answer to a forwarded request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponseContent {
    pub status: Option<u16>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponseContent {
    pub fn new(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Status code, defaulting to 200 when the agent left it unset.
    pub fn status_code(&self) -> u16 {
        self.status.unwrap_or(DEFAULT_STATUS)
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// Credentials an agent presents when opening a session.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeContent {
    pub identity_key: String,
    pub password: String,
    pub channel_key: Option<String>,
}

impl std::fmt::Debug for AuthorizeContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizeContent")
            .field("identity_key", &self.identity_key)
            .field("password", &"<redacted>")
            .field("channel_key", &self.channel_key)
            .finish()
    }
}

/// Free-form, uncorrelated message routed by `kind`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContent {
    pub kind: String,
    pub properties: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

impl RawContent {
    pub fn new(kind: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            properties: BTreeMap::new(),
            data: data.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));

        headers.insert("CONTENT-TYPE", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get_all("content-type"), ["application/json"]);
    }

    #[test]
    fn repeated_headers_keep_all_values() {
        let headers: Headers = [("Set-Cookie", "a=1"), ("set-cookie", "b=2")]
            .into_iter()
            .collect();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get_all("set-cookie"), ["a=1", "b=2"]);

        let map = headers.to_header_map();
        assert_eq!(map.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn header_map_conversion_preserves_entries() {
        let mut map = HeaderMap::new();
        map.insert("x-one", HeaderValue::from_static("1"));
        map.append("x-two", HeaderValue::from_static("2a"));
        map.append("x-two", HeaderValue::from_static("2b"));

        let headers = Headers::from_header_map(&map);
        assert_eq!(headers.iter().count(), 3);
        assert_eq!(headers.to_header_map(), map);
    }

    #[test]
    fn non_text_header_values_are_dropped_not_rewritten() {
        let mut map = HeaderMap::new();
        map.insert("x-raw", HeaderValue::from_bytes(&[b'a', 0xff, b'b']).unwrap());
        map.insert("x-text", HeaderValue::from_static("ok"));

        let headers = Headers::from_header_map(&map);
        assert_eq!(headers.iter().collect::<Vec<_>>(), vec![("x-text", "ok")]);
    }

    #[test]
    fn response_status_defaults_to_ok() {
        let response = HttpResponseContent::default();
        assert_eq!(response.status_code(), 200);
        assert_eq!(HttpResponseContent::new(404).status_code(), 404);
    }

    #[test]
    fn authorize_debug_hides_password() {
        let content = AuthorizeContent {
            identity_key: "alice".into(),
            password: "hunter2".into(),
            channel_key: None,
        };
        assert!(!format!("{content:?}").contains("hunter2"));
    }
}

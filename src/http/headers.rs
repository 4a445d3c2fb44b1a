//! HTTP headers handling
//!
//! Request headers are never tokenized as a whole: the daemon only reads
//! the fixed set of [`KnownHeader`] values by locating each field name in
//! the header block. Response headers set by services live in [`Headers`].

use super::MAX_HEADERS;
use std::fmt;

/// Request headers the parser extracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownHeader {
    Host,
    Connection,
    Accept,
    AcceptCharset,
    AcceptEncoding,
    AcceptLanguage,
    Cookie,
    Referer,
    UserAgent,
    Range,
    IfModifiedSince,
    ContentLength,
}

impl KnownHeader {
    pub const ALL: [KnownHeader; 12] = [
        KnownHeader::Host,
        KnownHeader::Connection,
        KnownHeader::Accept,
        KnownHeader::AcceptCharset,
        KnownHeader::AcceptEncoding,
        KnownHeader::AcceptLanguage,
        KnownHeader::Cookie,
        KnownHeader::Referer,
        KnownHeader::UserAgent,
        KnownHeader::Range,
        KnownHeader::IfModifiedSince,
        KnownHeader::ContentLength,
    ];

    /// Field name as it is searched for, colon included
    pub fn field(&self) -> &'static str {
        match self {
            KnownHeader::Host => "Host:",
            KnownHeader::Connection => "Connection:",
            KnownHeader::Accept => "Accept:",
            KnownHeader::AcceptCharset => "Accept-Charset:",
            KnownHeader::AcceptEncoding => "Accept-Encoding:",
            KnownHeader::AcceptLanguage => "Accept-Language:",
            KnownHeader::Cookie => "Cookie:",
            KnownHeader::Referer => "Referer:",
            KnownHeader::UserAgent => "User-Agent:",
            KnownHeader::Range => "Range:",
            KnownHeader::IfModifiedSince => "If-Modified-Since:",
            KnownHeader::ContentLength => "Content-Length:",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Locate `field` in `block` and return the rest of its line
///
/// Matching is textual: first occurrence, case-sensitive. A single space
/// after the field name is skipped. Returns `None` when the field is
/// absent or its line has no terminator.
pub fn find_value<'a>(block: &'a str, field: &str) -> Option<&'a str> {
    let start = block.find(field)? + field.len();
    let rest = block.get(start..)?;
    let rest = rest.strip_prefix(' ').unwrap_or(rest);

    let end = rest.find('\n')?;
    let value = &rest[..end];
    Some(value.strip_suffix('\r').unwrap_or(value))
}

/// Values of the known request headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownHeaders {
    values: [Option<String>; 12],
}

impl KnownHeaders {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract every known header from a header block
    pub fn extract(block: &str) -> Self {
        let mut headers = KnownHeaders::new();
        for header in KnownHeader::ALL {
            if let Some(value) = find_value(block, header.field()) {
                headers.set(header, value);
            }
        }
        headers
    }

    /// Get a header value
    pub fn get(&self, header: KnownHeader) -> Option<&str> {
        self.values[header.index()].as_deref()
    }

    /// Set a header value
    pub fn set(&mut self, header: KnownHeader, value: impl Into<String>) {
        self.values[header.index()] = Some(value.into());
    }

    /// Iterate over the headers that are present
    pub fn iter(&self) -> impl Iterator<Item = (KnownHeader, &str)> {
        KnownHeader::ALL
            .into_iter()
            .filter_map(|h| self.get(h).map(|v| (h, v)))
    }
}

/// Response headers collection
///
/// Headers are kept in insertion order with case-insensitive lookups and
/// support multiple values per name.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty headers collection
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    /// Insert a header, returning false once [`MAX_HEADERS`] is reached
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        if self.headers.len() >= MAX_HEADERS {
            return false;
        }

        self.headers.push((name.into(), value.into()));
        true
    }

    /// Get the first value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Get the number of headers
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: &str = "GET / HTTP/1.1\r\n\
        Host: example.com:8080\r\n\
        Accept: text/html\r\n\
        Accept-Language: es\r\n\
        User-Agent: curl/8.0\r\n\
        \r\n";

    #[test]
    fn test_find_value() {
        assert_eq!(find_value(BLOCK, "Host:"), Some("example.com:8080"));
        assert_eq!(find_value(BLOCK, "User-Agent:"), Some("curl/8.0"));
        assert_eq!(find_value(BLOCK, "Cookie:"), None);
    }

    #[test]
    fn test_find_value_is_case_sensitive() {
        assert_eq!(find_value(BLOCK, "host:"), None);
    }

    #[test]
    fn test_find_value_bare_newline() {
        assert_eq!(find_value("X\nReferer: /a\n\n", "Referer:"), Some("/a"));
    }

    #[test]
    fn test_find_value_unterminated_line() {
        assert_eq!(find_value("X\r\nCookie: a=1", "Cookie:"), None);
    }

    #[test]
    fn test_accept_does_not_match_longer_fields() {
        let headers = KnownHeaders::extract(BLOCK);
        assert_eq!(headers.get(KnownHeader::Accept), Some("text/html"));
        assert_eq!(headers.get(KnownHeader::AcceptLanguage), Some("es"));
        assert_eq!(headers.get(KnownHeader::AcceptCharset), None);
        assert_eq!(headers.iter().count(), 4);
    }

    #[test]
    fn test_response_headers() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        headers.insert("X-Keep", "1");

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert!(headers.contains("X-KEEP"));
        assert!(!headers.contains("Content-Length"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_max_headers() {
        let mut headers = Headers::new();
        for i in 0..MAX_HEADERS {
            assert!(headers.insert(format!("X-{}", i), "v"));
        }
        assert!(!headers.insert("X-Over", "v"));
        assert_eq!(headers.len(), MAX_HEADERS);
    }
}

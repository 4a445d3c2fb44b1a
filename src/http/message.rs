//! HTTP message types
//!
//! This module defines the parsed request record and the response head
//! written back to clients.

use super::{Headers, KnownHeader, KnownHeaders, CRLF};
use bytes::Bytes;
use std::fmt;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Parse method from its request-line token
    pub fn from_token(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "CONNECT" => Some(Method::Connect),
            "OPTIONS" => Some(Method::Options),
            "TRACE" => Some(Method::Trace),
            "PATCH" => Some(Method::Patch),
            _ => None,
        }
    }

    /// Convert method to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }

    /// Methods the daemon serves; anything else is answered with 405
    pub fn is_allowed(&self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Post)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    Http09,
    Http10,
    Http11,
}

impl Version {
    /// Decode a protocol token, `None` when unsupported
    pub fn from_token(s: &str) -> Option<Self> {
        match s {
            "HTTP/0.9" => Some(Version::Http09),
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    /// Convert version to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http09 => "HTTP/0.9",
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    /// Whether requests of this version must carry a Host header
    pub fn requires_host(&self) -> bool {
        matches!(self, Version::Http11)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::Http11
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a status code, `None` outside 100..600
    pub fn new(code: u16) -> Option<Self> {
        (100..600).contains(&code).then_some(Status { code })
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            416 => "Range Not Satisfiable",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }

    /// Check if this is a client error status (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Check if this is a server error status (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code)
    }

    pub const OK: Status = Status { code: 200 };
    pub const BAD_REQUEST: Status = Status { code: 400 };
    pub const FORBIDDEN: Status = Status { code: 403 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const METHOD_NOT_ALLOWED: Status = Status { code: 405 };
    pub const REQUEST_TIMEOUT: Status = Status { code: 408 };
    pub const LENGTH_REQUIRED: Status = Status { code: 411 };
    pub const PAYLOAD_TOO_LARGE: Status = Status { code: 413 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };
    pub const HTTP_VERSION_NOT_SUPPORTED: Status = Status { code: 505 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// A request parsed out of the raw header block
///
/// Immutable once the parser hands it out; the server only fills in the
/// fallback host for HTTP/1.0 requests and attaches the POST body before
/// dispatch.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub(crate) method: Method,
    pub(crate) uri: String,
    pub(crate) query_string: Option<String>,
    pub(crate) uri_processed: Option<String>,
    pub(crate) version: Option<Version>,
    pub(crate) host: Option<String>,
    pub(crate) port: u16,
    pub(crate) keep_alive: bool,
    pub(crate) headers: KnownHeaders,
    pub(crate) body: Bytes,
}

impl ParsedRequest {
    /// Get the request method
    pub fn method(&self) -> Method {
        self.method
    }

    /// Request URI as sent, without the query string
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Query string without the leading `?`
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Percent-decoded URI, `None` when decoding failed
    pub fn uri_processed(&self) -> Option<&str> {
        self.uri_processed.as_deref()
    }

    /// Protocol version, `None` when the token was not recognized
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Host name without port
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Port from the Host header, or the configured standard port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the client asked for a persistent connection
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Value of one of the known request headers
    pub fn header(&self, header: KnownHeader) -> Option<&str> {
        self.headers.get(header)
    }

    /// All known header values
    pub fn headers(&self) -> &KnownHeaders {
        &self.headers
    }

    /// Request body, empty for anything but POST
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Status line and headers of a response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    version: Version,
    status: Status,
    headers: Headers,
}

impl ResponseHead {
    /// Create a response head for the given status
    pub fn new(status: Status) -> Self {
        ResponseHead {
            version: Version::Http11,
            status,
            headers: Headers::new(),
        }
    }

    /// Get the status code
    pub fn status(&self) -> Status {
        self.status
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get mutable headers
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Convert the head to wire format, including the blank line
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);

        buf.extend_from_slice(self.version.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.code().to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.reason_phrase().as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());

        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF.as_bytes());
        }

        buf.extend_from_slice(CRLF.as_bytes());
        buf
    }
}

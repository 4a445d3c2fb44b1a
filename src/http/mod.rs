//! HTTP/1.x request core
//!
//! This module turns the bytes of a client connection into a
//! [`ParsedRequest`] and runs the worker loop that feeds parsed requests to
//! stage handlers.
//!
//! # Architecture
//!
//! - [`parser`] extracts method, URI, query string, protocol and the known
//!   header values from the raw header block
//! - [`session`] abstracts the transport behind `SessionOps` so every read
//!   and write goes through a bounded `poll` wait
//! - [`server`] accumulates request bytes, validates the parsed request and
//!   hands it to the Duda stage, falling back to an external handler
//!
//! # Examples
//!
//! ```
//! use monkey::http::{parse_request, Method, Version};
//!
//! let req = parse_request(b"GET /blog/posts/list HTTP/1.1\r\nHost: example.com\r\n\r\n", 80)
//!     .unwrap();
//! assert_eq!(req.method(), Method::Get);
//! assert_eq!(req.uri(), "/blog/posts/list");
//! assert_eq!(req.version(), Some(Version::Http11));
//! assert_eq!(req.host(), Some("example.com"));
//! ```

pub mod headers;
pub mod message;
pub mod parser;
pub mod server;
pub mod session;

pub use headers::{Headers, KnownHeader, KnownHeaders};
pub use message::{Method, ParsedRequest, ResponseHead, Status, Version};
pub use parser::parse_request;
pub use server::{
    receive_request, validate_request, ErrorResponder, Handlers, HttpServer, NotFound,
    PlainErrors, Received, Reply, RequestHandler, Server,
};
pub use session::{FdSessionOps, HttpSession, PollEvents, SessionOps};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP request errors
///
/// Every variant except [`Error::Io`] and [`Error::ConnectionClosed`] maps to
/// a status code through [`Error::status`], which the response collaborator
/// renders on the wire.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed request line: {0}")]
    MalformedRequestLine(String),

    #[error("Unsupported protocol version")]
    UnsupportedProtocolVersion,

    #[error("Missing Host header")]
    MissingRequiredHost,

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Length required")]
    LengthRequired,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request body of {0} bytes exceeds the size limit")]
    PayloadTooLarge(usize),

    #[error("Request timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Status code to answer the client with
    pub fn status(&self) -> Status {
        match self {
            Error::MalformedRequestLine(_) | Error::MissingRequiredHost => Status::BAD_REQUEST,
            Error::Forbidden(_) => Status::FORBIDDEN,
            Error::NotFound(_) => Status::NOT_FOUND,
            Error::MethodNotAllowed(_) => Status::METHOD_NOT_ALLOWED,
            Error::Timeout => Status::REQUEST_TIMEOUT,
            Error::LengthRequired => Status::LENGTH_REQUIRED,
            Error::PayloadTooLarge(_) => Status::PAYLOAD_TOO_LARGE,
            Error::UnsupportedProtocolVersion => Status::HTTP_VERSION_NOT_SUPPORTED,
            Error::Io(_) | Error::ConnectionClosed => Status::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Maximum number of response headers a service may add
pub const MAX_HEADERS: usize = 64;

/// CRLF line ending
pub const CRLF: &str = "\r\n";

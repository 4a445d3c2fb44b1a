//! Per-request Duda context
//!
//! A [`DudaRequest`] is created when dispatch begins and handed to the
//! service method. It buffers the response the service builds and carries
//! the write-event mask the [`EventQueue`](super::EventQueue) drives.

use super::router::RoutedPath;
use crate::http::message::ResponseHead;
use crate::http::{Error as HttpError, Headers, ParsedRequest, SessionOps, Status};
use bytes::{Buf, BytesMut};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Write-event kinds a request can wait on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Events(u8);

impl Events {
    pub const NONE: Events = Events(0);
    /// Flush the buffered body across write-ready notifications
    pub const BODY_FLUSH: Events = Events(0x01);

    pub fn from_bits(bits: u8) -> Self {
        Events(bits & Self::BODY_FLUSH.0)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Events) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Events) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Events) {
        self.0 &= !other.0;
    }
}

/// Callback run once the request completes
pub type EndCallback = Box<dyn FnOnce(&mut DudaRequest)>;

/// The per-request state threaded through dispatch and write continuation
pub struct DudaRequest {
    id: RequestId,
    socket: RawFd,
    request: Arc<ParsedRequest>,
    path: RoutedPath,
    events_mask: Events,
    status: Status,
    headers: Headers,
    body: BytesMut,
    end_callback: Option<EndCallback>,
    headers_sent: bool,
    body_writes: usize,
}

impl DudaRequest {
    /// Create a context for a routed request on `socket`
    pub fn new(socket: RawFd, request: Arc<ParsedRequest>, path: RoutedPath) -> Self {
        DudaRequest {
            id: RequestId::next(),
            socket,
            request,
            path,
            events_mask: Events::NONE,
            status: Status::OK,
            headers: Headers::new(),
            body: BytesMut::new(),
            end_callback: None,
            headers_sent: false,
            body_writes: 0,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Socket the response is written to
    pub fn socket(&self) -> RawFd {
        self.socket
    }

    /// The originating parsed request
    pub fn request(&self) -> &ParsedRequest {
        &self.request
    }

    pub fn app_name(&self) -> &str {
        self.path.app_name()
    }

    pub fn interface(&self) -> &str {
        self.path.interface()
    }

    pub fn method(&self) -> &str {
        self.path.method()
    }

    /// Positional parameter after the method segment
    pub fn param(&self, index: usize) -> Option<&str> {
        self.path.params().get(index).map(String::as_str)
    }

    pub fn params(&self) -> &[String] {
        self.path.params()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Set the response status, ignored once headers went out
    pub fn set_status(&mut self, status: Status) {
        if !self.headers_sent {
            self.status = status;
        }
    }

    /// Add a response header, false once headers went out or the set is full
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        !self.headers_sent && self.headers.insert(name, value)
    }

    /// Append to the response body
    ///
    /// The body must be complete before headers are sent, since they
    /// announce its length. Returns false afterwards.
    pub fn body_write(&mut self, data: &[u8]) -> bool {
        if self.headers_sent {
            return false;
        }
        self.body.extend_from_slice(data);
        true
    }

    /// Bytes of body not yet written to the socket
    pub fn pending_body(&self) -> usize {
        self.body.len()
    }

    /// Run `callback` when the request completes
    pub fn set_end_callback(&mut self, callback: impl FnOnce(&mut DudaRequest) + 'static) {
        self.end_callback = Some(Box::new(callback));
    }

    /// Ask for write-ready continuation; setting a kind twice is a no-op
    pub fn event_register_write(&mut self, event: Events) {
        self.events_mask.insert(event);
    }

    /// Drop interest in `event`, false when it was not set
    pub fn event_unregister_write(&mut self, event: Events) -> bool {
        if !self.events_mask.contains(event) {
            return false;
        }
        self.events_mask.remove(event);
        true
    }

    pub fn event_is_registered_write(&self, event: Events) -> bool {
        self.events_mask.contains(event)
    }

    pub fn events(&self) -> Events {
        self.events_mask
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Number of socket writes the body took so far
    pub fn body_writes(&self) -> usize {
        self.body_writes
    }

    pub(crate) fn take_end_callback(&mut self) -> Option<EndCallback> {
        self.end_callback.take()
    }

    /// Response head announcing the buffered body
    pub(crate) fn response_head(&self) -> ResponseHead {
        let mut head = ResponseHead::new(self.status);
        for (name, value) in self.headers.iter() {
            head.headers_mut().insert(name, value);
        }
        if !self.headers.contains("Content-Length") {
            head.headers_mut()
                .insert("Content-Length", self.body.len().to_string());
        }
        let connection = if self.request.keep_alive() {
            "Keep-Alive"
        } else {
            "close"
        };
        head.headers_mut().insert("Connection", connection);
        head
    }

    pub(crate) fn mark_headers_sent(&mut self) {
        self.headers_sent = true;
    }

    /// Drop the buffered body, for responses that must not carry one
    pub(crate) fn discard_body(&mut self) {
        self.body.clear();
    }

    /// Write as much pending body as one socket write takes
    ///
    /// Returns the number of bytes still pending.
    pub(crate) fn body_flush<S: SessionOps>(
        &mut self,
        session: &mut S,
    ) -> Result<usize, HttpError> {
        if self.body.is_empty() {
            return Ok(0);
        }

        match session.write(&self.body) {
            Ok(0) => Err(HttpError::ConnectionClosed),
            Ok(n) => {
                self.body.advance(n);
                self.body_writes += 1;
                Ok(self.body.len())
            }
            Err(HttpError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(self.body.len()),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for DudaRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DudaRequest")
            .field("id", &self.id)
            .field("socket", &self.socket)
            .field("path", &self.path)
            .field("events", &self.events_mask)
            .field("status", &self.status)
            .field("pending_body", &self.body.len())
            .field("headers_sent", &self.headers_sent)
            .field("body_writes", &self.body_writes)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::duda::router::parse_path;
    use crate::http::parse_request;

    pub(crate) fn request_for(uri: &str, socket: RawFd) -> DudaRequest {
        let raw = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", uri);
        let parsed = parse_request(raw.as_bytes(), 80).unwrap();
        let path = parse_path(parsed.uri_processed().unwrap(), 8).unwrap();
        DudaRequest::new(socket, Arc::new(parsed), path)
    }

    #[test]
    fn test_path_accessors() {
        let dr = request_for("/blog/posts/list/5/draft", 3);
        assert_eq!(dr.app_name(), "blog");
        assert_eq!(dr.interface(), "posts");
        assert_eq!(dr.method(), "list");
        assert_eq!(dr.param(0), Some("5"));
        assert_eq!(dr.param(1), Some("draft"));
        assert_eq!(dr.param(2), None);
        assert_eq!(dr.socket(), 3);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = request_for("/a/b/c", 3);
        let b = request_for("/a/b/c", 3);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_event_mask() {
        let mut dr = request_for("/a/b/c", 3);
        assert!(!dr.event_is_registered_write(Events::BODY_FLUSH));

        dr.event_register_write(Events::BODY_FLUSH);
        dr.event_register_write(Events::BODY_FLUSH);
        assert_eq!(dr.events(), Events::BODY_FLUSH);

        assert!(dr.event_unregister_write(Events::BODY_FLUSH));
        assert!(!dr.event_unregister_write(Events::BODY_FLUSH));
        assert!(dr.events().is_empty());
    }

    #[test]
    fn test_events_contains() {
        assert!(!Events::NONE.contains(Events::NONE));
        assert!(Events::BODY_FLUSH.contains(Events::BODY_FLUSH));
        assert_eq!(Events::from_bits(0xff), Events::BODY_FLUSH);
    }

    #[test]
    fn test_response_head() {
        let mut dr = request_for("/a/b/c", 3);
        dr.set_status(Status::NOT_FOUND);
        dr.add_header("Content-Type", "text/plain");
        dr.body_write(b"missing");

        let wire = String::from_utf8(dr.response_head().to_wire()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.contains("Content-Type: text/plain\r\n"));
        assert!(wire.contains("Content-Length: 7\r\n"));
        assert!(wire.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_frozen_after_headers_sent() {
        let mut dr = request_for("/a/b/c", 3);
        dr.mark_headers_sent();
        dr.set_status(Status::NOT_FOUND);
        assert_eq!(dr.status(), Status::OK);
        assert!(!dr.add_header("X-Late", "1"));
        assert!(!dr.body_write(b"late"));
    }
}

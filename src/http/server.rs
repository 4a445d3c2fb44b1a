//! Connection handling
//!
//! A [`Server`] binds the listening socket and runs `workers` threads. Each
//! worker accepts a connection, then loops over its requests with an
//! [`HttpServer`]. Each request is received and validated, and a POST body
//! is read up to its Content-Length. The request then goes to the Duda
//! stage or, when no service claims it, to the external [`RequestHandler`].
//! Any write continuation the stage left behind is driven to completion
//! before the next request is read. Bytes the client sent past a request
//! start the next one.

use super::message::ResponseHead;
use super::parser::{find_header_end, parse_request};
use super::session::poll_fd;
use super::{
    Error, FdSessionOps, HttpSession, KnownHeader, Method, ParsedRequest, PollEvents, Result,
    SessionOps, Status,
};
use crate::config::ServerConfig;
use crate::duda::{self, Duda, EventQueue, RequestEnd, Stage};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// How long a worker waits on the listener before rechecking shutdown
const ACCEPT_POLL: Duration = Duration::from_millis(200);

const READ_CHUNK: usize = 4096;

/// Result of reading one request from a connection
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// Raw bytes through the header terminator, plus whatever the client
    /// sent after it in the same reads
    Request(Vec<u8>),
    /// The peer closed the connection
    Closed,
    /// A persistent connection stayed idle past its timeout
    KeepAliveExpired,
}

/// Read the next request head from `session`
///
/// `pending` holds bytes already received past the previous request and is
/// consumed before reading from the socket. `served` is the number of
/// requests already answered on the connection; a timeout before any
/// request is an error, a timeout between requests is an ordinary end of
/// the connection.
pub fn receive_request<S: SessionOps>(
    session: &mut HttpSession<S>,
    config: &ServerConfig,
    served: usize,
    pending: Vec<u8>,
) -> Result<Received> {
    let mut wait = if served > 0 {
        config.keep_alive_timeout()
    } else {
        config.timeout()
    };
    let mut deadline = Instant::now() + wait;
    let mut buf = pending;
    let mut chunk = [0u8; READ_CHUNK];
    let mut checked = false;
    let mut reads = 0;

    loop {
        if !checked && !buf.is_empty() {
            if buf.iter().filter(|&&b| b == b' ').count() < 2 {
                return Err(Error::MalformedRequestLine(
                    "incomplete request line".to_string(),
                ));
            }
            if buf.starts_with(b"POST ") {
                wait = config.post_timeout();
                deadline = Instant::now() + wait;
            }
            checked = true;
        }
        if find_header_end(&buf).is_some() {
            return Ok(Received::Request(buf));
        }

        let room = config.max_request_size.saturating_sub(buf.len());
        if room == 0 {
            return Err(Error::MalformedRequestLine(format!(
                "request head exceeds {} bytes",
                config.max_request_size
            )));
        }
        if reads >= config.max_recv_times {
            return Err(Error::MalformedRequestLine(format!(
                "request head not complete after {} reads",
                reads
            )));
        }

        let left = deadline.saturating_duration_since(Instant::now());
        let limit = room.min(READ_CHUNK);
        let n = match session.read_within(&mut chunk[..limit], Some(wait.min(left))) {
            Ok(n) => n,
            Err(Error::Timeout) if served > 0 => return Ok(Received::KeepAliveExpired),
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(Received::Closed);
        }

        buf.extend_from_slice(&chunk[..n]);
        reads += 1;
    }
}

/// Read a request body of `length` bytes
///
/// `buf` holds body bytes that arrived along with the head. Returns the
/// body and anything the client sent past it.
pub fn receive_body<S: SessionOps>(
    session: &mut HttpSession<S>,
    config: &ServerConfig,
    length: usize,
    mut buf: Vec<u8>,
) -> Result<(Bytes, Vec<u8>)> {
    if length > config.max_request_size {
        return Err(Error::PayloadTooLarge(length));
    }

    let deadline = Instant::now() + config.post_timeout();
    let mut chunk = [0u8; READ_CHUNK];
    while buf.len() < length {
        let left = deadline.saturating_duration_since(Instant::now());
        let limit = (length - buf.len()).min(READ_CHUNK);
        let n = session.read_within(&mut chunk[..limit], Some(left))?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let rest = buf.split_off(length);
    Ok((Bytes::from(buf), rest))
}

/// Declared body length of a request
fn content_length(request: &ParsedRequest) -> Result<usize> {
    let value = request.header(KnownHeader::ContentLength).unwrap_or("");
    value
        .trim()
        .parse()
        .map_err(|_| Error::MalformedRequestLine(format!("invalid Content-Length '{}'", value)))
}

/// Check a parsed request before any handler sees it
///
/// An HTTP/1.0 request without Host is assigned the configured server name.
pub fn validate_request(request: &mut ParsedRequest, config: &ServerConfig) -> Result<()> {
    let Some(uri) = request.uri_processed() else {
        return Err(Error::MalformedRequestLine(format!(
            "undecodable URI '{}'",
            request.uri()
        )));
    };

    let query = request.query_string().unwrap_or("");
    if let Some(denied) = config
        .deny
        .iter()
        .find(|d| !d.is_empty() && (uri.contains(d.as_str()) || query.contains(d.as_str())))
    {
        return Err(Error::Forbidden(denied.clone()));
    }

    if request.host.is_none() {
        if request.version.map(|v| v.requires_host()).unwrap_or(false) {
            return Err(Error::MissingRequiredHost);
        }
        request.host = Some(config.server_name.clone());
    }

    if !request.method.is_allowed() {
        return Err(Error::MethodNotAllowed(request.method.as_str().to_string()));
    }
    if request.version.is_none() {
        return Err(Error::UnsupportedProtocolVersion);
    }
    if request.method == Method::Post
        && request.header(KnownHeader::ContentLength).is_none()
    {
        return Err(Error::LengthRequired);
    }

    Ok(())
}

/// A response head and body produced outside the Duda layer
pub type Reply = (ResponseHead, Vec<u8>);

/// Handler for requests no web service claimed
///
/// Static files, CGI and user directories live behind this.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &ParsedRequest) -> Result<Reply>;
}

impl<F> RequestHandler for F
where
    F: Fn(&ParsedRequest) -> Result<Reply> + Send + Sync,
{
    fn handle(&self, request: &ParsedRequest) -> Result<Reply> {
        self(request)
    }
}

/// Fallback answering every request with 404
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFound;

impl RequestHandler for NotFound {
    fn handle(&self, request: &ParsedRequest) -> Result<Reply> {
        Err(Error::NotFound(request.uri().to_string()))
    }
}

/// Renders error statuses on the wire
pub trait ErrorResponder: Send + Sync {
    fn respond(&self, status: Status) -> Reply;
}

/// Status line only, then close
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainErrors;

impl ErrorResponder for PlainErrors {
    fn respond(&self, status: Status) -> Reply {
        let head = ResponseHead::new(status)
            .header("Content-Length", "0")
            .header("Connection", "close");
        (head, Vec::new())
    }
}

#[derive(Debug, Default)]
struct Completions(usize);

impl RequestEnd for Completions {
    fn request_end(&mut self, _socket: RawFd) {
        self.0 += 1;
    }
}

enum Outcome {
    Done { keep_alive: bool },
    Reject(Status),
    Abort,
}

/// Stage handlers shared by every connection of a server
#[derive(Clone)]
pub struct Handlers {
    pub duda: Arc<Duda>,
    pub fallback: Arc<dyn RequestHandler>,
    pub errors: Arc<dyn ErrorResponder>,
}

impl Handlers {
    pub fn new(duda: Duda) -> Self {
        Handlers {
            duda: Arc::new(duda),
            fallback: Arc::new(NotFound),
            errors: Arc::new(PlainErrors),
        }
    }
}

/// Request loop over one client connection
pub struct HttpServer<S: SessionOps> {
    session: HttpSession<S>,
    config: Arc<ServerConfig>,
    served: usize,
    completed: usize,
    pending: Vec<u8>,
}

impl<S: SessionOps> HttpServer<S> {
    pub fn new(session: S, config: Arc<ServerConfig>) -> Self {
        let mut session = HttpSession::new(session);
        session.set_timeout(Some(config.timeout()));
        HttpServer {
            session,
            config,
            served: 0,
            completed: 0,
            pending: Vec::new(),
        }
    }

    /// Read the next request head
    pub fn receive_request(&mut self) -> Result<Received> {
        let pending = std::mem::take(&mut self.pending);
        receive_request(&mut self.session, &self.config, self.served, pending)
    }

    /// Requests answered so far
    pub fn served(&self) -> usize {
        self.served
    }

    /// Web service requests that ran to completion
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Serve requests until the connection ends
    ///
    /// Continuations left in `events` for this socket are torn down before
    /// returning.
    pub fn serve(&mut self, handlers: &Handlers, events: &mut EventQueue) -> Result<()> {
        let socket = self.session.socket();

        loop {
            let raw = match self.receive_request() {
                Ok(Received::Request(raw)) => raw,
                Ok(Received::Closed) => break,
                Ok(Received::KeepAliveExpired) => {
                    trace!(socket, served = self.served, "Keep-alive expired");
                    break;
                }
                Err(e @ (Error::Io(_) | Error::ConnectionClosed)) => {
                    debug!(socket, error = %e, "Connection read failed");
                    break;
                }
                Err(e) => {
                    debug!(socket, status = e.status().code(), error = %e, "Request rejected");
                    self.reject(handlers, e.status());
                    break;
                }
            };

            match self.process(raw, handlers, events) {
                Outcome::Done { keep_alive } => {
                    self.served += 1;
                    if !keep_alive {
                        break;
                    }
                }
                Outcome::Reject(status) => {
                    self.reject(handlers, status);
                    break;
                }
                Outcome::Abort => break,
            }
        }

        let dropped = events.close_socket(socket);
        if dropped > 0 {
            debug!(socket, dropped, "Pending writes dropped on close");
        }
        self.session.close()
    }

    fn process(
        &mut self,
        mut raw: Vec<u8>,
        handlers: &Handlers,
        events: &mut EventQueue,
    ) -> Outcome {
        let head_end = find_header_end(&raw).unwrap_or(raw.len());
        let rest = raw.split_off(head_end);

        let mut request = match parse_request(&raw, self.config.port)
            .and_then(|mut r| validate_request(&mut r, &self.config).map(|_| r))
        {
            Ok(r) => r,
            Err(e) => {
                debug!(status = e.status().code(), error = %e, "Request rejected");
                return Outcome::Reject(e.status());
            }
        };

        if request.method() == Method::Post {
            let body = content_length(&request).and_then(|length| {
                receive_body(&mut self.session, &self.config, length, rest)
            });
            match body {
                Ok((body, next)) => {
                    request.body = body;
                    self.pending = next;
                }
                Err(e @ (Error::Io(_) | Error::ConnectionClosed)) => {
                    debug!(uri = %request.uri(), error = %e, "Request body read failed");
                    return Outcome::Abort;
                }
                Err(e) => {
                    debug!(
                        uri = %request.uri(),
                        status = e.status().code(),
                        error = %e,
                        "Request body rejected"
                    );
                    return Outcome::Reject(e.status());
                }
            }
        } else {
            self.pending = rest;
        }
        let request = Arc::new(request);

        let host = self.config.find_vhost(request.host());
        let mut ends = Completions::default();
        let stage = handlers
            .duda
            .stage(host, &request, &mut self.session, events, &mut ends);

        let outcome = match stage {
            Ok(Stage::Completed) => Outcome::Done {
                keep_alive: request.keep_alive(),
            },
            Ok(Stage::AwaitingWrite(id)) => match self.drive_writes(events, &mut ends) {
                Ok(()) => Outcome::Done {
                    keep_alive: request.keep_alive(),
                },
                Err(e) => {
                    debug!(request = %id, error = %e, "Write continuation aborted");
                    Outcome::Abort
                }
            },
            Ok(Stage::NotMine) => match handlers.fallback.handle(&request) {
                Ok((head, body)) => match self.send(&request, head, &body) {
                    Ok(()) => Outcome::Done {
                        keep_alive: request.keep_alive(),
                    },
                    Err(e) => {
                        debug!(uri = %request.uri(), error = %e, "Response write failed");
                        Outcome::Abort
                    }
                },
                Err(e) => {
                    debug!(
                        uri = %request.uri(),
                        status = e.status().code(),
                        error = %e,
                        "Request failed"
                    );
                    Outcome::Reject(e.status())
                }
            },
            Err(duda::Error::Write(e)) => {
                debug!(uri = %request.uri(), error = %e, "Web service write failed");
                Outcome::Abort
            }
            Err(e) => {
                debug!(
                    uri = %request.uri(),
                    status = e.status().code(),
                    error = %e,
                    "Web service failed"
                );
                Outcome::Reject(e.status())
            }
        };

        self.completed += ends.0;
        outcome
    }

    /// Flush continuations of this socket as it becomes writable
    fn drive_writes(&mut self, events: &mut EventQueue, ends: &mut Completions) -> Result<()> {
        let socket = self.session.socket();
        while events.has_socket(socket) {
            if !self
                .session
                .get_ref()
                .poll(PollEvents::Write, self.session.timeout())?
            {
                return Err(Error::Timeout);
            }
            events.on_write_ready(socket, self.session.get_mut(), ends);
        }
        Ok(())
    }

    fn send(&mut self, request: &ParsedRequest, mut head: ResponseHead, body: &[u8]) -> Result<()> {
        if !head.headers().contains("Content-Length") {
            head.headers_mut()
                .insert("Content-Length", body.len().to_string());
        }
        if !head.headers().contains("Connection") {
            let connection = if request.keep_alive() {
                "Keep-Alive"
            } else {
                "close"
            };
            head.headers_mut().insert("Connection", connection);
        }

        self.session.write_all(&head.to_wire())?;
        if request.method() != Method::Head {
            self.session.write_all(body)?;
        }
        Ok(())
    }

    fn reject(&mut self, handlers: &Handlers, status: Status) {
        let (head, body) = handlers.errors.respond(status);
        let result = self
            .session
            .write_all(&head.to_wire())
            .and_then(|_| self.session.write_all(&body));
        if let Err(e) = result {
            debug!(status = status.code(), error = %e, "Error response write failed");
        }
    }

    pub fn session(&self) -> &HttpSession<S> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut HttpSession<S> {
        &mut self.session
    }
}

/// Listening server with a pool of worker threads
pub struct Server {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    handlers: Handlers,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind `listen:port` from the configuration
    pub fn bind(config: ServerConfig, duda: Duda) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.listen, config.port)
            .parse()
            .map_err(|e| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("listen address {}:{}: {}", config.listen, config.port, e),
                ))
            })?;

        let socket = Socket::new(
            if addr.is_ipv4() {
                Domain::IPV4
            } else {
                Domain::IPV6
            },
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        let listener: TcpListener = socket.into();

        info!(addr = %listener.local_addr()?, workers = config.workers, "Listening");

        Ok(Server {
            listener,
            config: Arc::new(config),
            handlers: Handlers::new(duda),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the handler for requests no web service claims
    pub fn with_fallback(mut self, fallback: impl RequestHandler + 'static) -> Self {
        self.handlers.fallback = Arc::new(fallback);
        self
    }

    /// Replace the error renderer
    pub fn with_errors(mut self, errors: impl ErrorResponder + 'static) -> Self {
        self.handlers.errors = Arc::new(errors);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Flag that stops the workers once set
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run the workers until shutdown
    pub fn run(self) -> Result<()> {
        let mut workers = Vec::with_capacity(self.config.workers);

        for id in 0..self.config.workers {
            let listener = self.listener.try_clone()?;
            let config = Arc::clone(&self.config);
            let handlers = self.handlers.clone();
            let shutdown = Arc::clone(&self.shutdown);

            let handle = thread::Builder::new()
                .name(format!("monkey-worker-{}", id))
                .spawn(move || worker_loop(id, listener, config, handlers, shutdown))?;
            workers.push(handle);
        }

        for handle in workers {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
        info!("Server stopped");
        Ok(())
    }
}

fn worker_loop(
    id: usize,
    listener: TcpListener,
    config: Arc<ServerConfig>,
    handlers: Handlers,
    shutdown: Arc<AtomicBool>,
) {
    let mut events = EventQueue::new();
    debug!(worker = id, "Worker started");

    while !shutdown.load(Ordering::Acquire) {
        match poll_fd(listener.as_raw_fd(), PollEvents::Read, Some(ACCEPT_POLL)) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(worker = id, error = %e, "Listener poll failed");
                break;
            }
        }

        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                debug!(worker = id, error = %e, "Accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nonblocking(false) {
            debug!(worker = id, error = %e, "Could not configure connection");
            continue;
        }

        let mut conn = HttpServer::new(FdSessionOps::new(stream), Arc::clone(&config));
        if let Err(e) = conn.serve(&handlers, &mut events) {
            debug!(worker = id, error = %e, "Connection close failed");
        }
        trace!(worker = id, served = conn.served(), "Connection finished");
    }

    debug!(worker = id, "Worker stopped");
}

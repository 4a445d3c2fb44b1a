//! HTTP request parsing
//!
//! The parser works on the whole header block accumulated by the server:
//! the request line is split on its two spaces and the known header values
//! are located textually afterwards.

use super::{Error, KnownHeader, KnownHeaders, Method, ParsedRequest, Result, Version};
use bytes::Bytes;

/// Find the header block terminator, returning the offset just past it
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2);

    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Split off the request line
///
/// Returns the line without its terminator and the remaining header block.
/// A buffer without any line terminator is all request line.
fn split_request_line(text: &str) -> (&str, &str) {
    match text.find('\n') {
        Some(nl) => {
            let line = &text[..nl];
            (line.strip_suffix('\r').unwrap_or(line), &text[nl + 1..])
        }
        None => (text, ""),
    }
}

/// Parse the request line
///
/// Format: METHOD SP URI[?QUERY] SP VERSION
///
/// Returns the method, the path, the query string and the protocol version,
/// which is `None` when the token is not one of the supported versions.
pub fn parse_request_line(line: &str) -> Result<(Method, &str, Option<&str>, Option<Version>)> {
    let method_end = match line.find(' ') {
        Some(0) | None => {
            return Err(Error::MalformedRequestLine("missing method".to_string()));
        }
        Some(pos) => pos,
    };
    let token = &line[..method_end];

    let rest = &line[method_end + 1..];
    let uri_end = match rest.find(' ') {
        Some(0) | None => {
            return Err(Error::MalformedRequestLine("missing request URI".to_string()));
        }
        Some(pos) => pos,
    };
    let target = &rest[..uri_end];

    let (uri, query) = match target.find('?') {
        Some(q) => (&target[..q], Some(&target[q + 1..])),
        None => (target, None),
    };
    if uri.is_empty() {
        return Err(Error::MalformedRequestLine(format!("empty path in '{}'", target)));
    }

    let version = Version::from_token(&rest[uri_end + 1..]);
    let method =
        Method::from_token(token).ok_or_else(|| Error::MethodNotAllowed(token.to_string()))?;

    Ok((method, uri, query, version))
}

/// Split a Host value into name and port
///
/// A value without `:port` gets `default_port`.
pub fn split_host(value: &str, default_port: u16) -> Result<(&str, u16)> {
    match value.split_once(':') {
        Some((host, port)) => {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| Error::MalformedRequestLine(format!("invalid Host port: {}", port)))?;
            Ok((host, port))
        }
        None => Ok((value, default_port)),
    }
}

/// Parse an accumulated request buffer
///
/// `default_port` is used when the Host header carries no port.
pub fn parse_request(buf: &[u8], default_port: u16) -> Result<ParsedRequest> {
    let text = String::from_utf8_lossy(buf);
    let (line, block) = split_request_line(&text);

    let (method, uri, query, version) = parse_request_line(line)?;
    let headers = KnownHeaders::extract(block);

    let (host, port) = match headers.get(KnownHeader::Host).map(str::trim) {
        Some(value) if !value.is_empty() => {
            let (host, port) = split_host(value, default_port)?;
            (Some(host.to_string()), port)
        }
        _ => (None, default_port),
    };

    let keep_alive = version == Some(Version::Http11)
        && headers
            .get(KnownHeader::Connection)
            .map(|c| c.to_ascii_lowercase().contains("keep-alive"))
            .unwrap_or(false);

    let uri_processed = urlencoding::decode(uri).ok().map(|s| s.into_owned());

    Ok(ParsedRequest {
        method,
        uri: uri.to_string(),
        query_string: query.map(str::to_string),
        uri_processed,
        version,
        host,
        port,
        keep_alive,
        headers,
        body: Bytes::new(),
    })
}

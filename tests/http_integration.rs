//! Integration tests for the request pipeline
//!
//! These tests run a real server on a loopback port and talk raw HTTP to
//! it, covering web service dispatch, write continuation and fallback.

use monkey::config::{ServerConfig, VhostConfig};
use monkey::duda::{Duda, DudaRequest, Events, StaticLoader, StaticModule};
use monkey::http::{ParsedRequest, Reply, ResponseHead, Result, Server, Status};
use std::fs::File;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::TempDir;

const LARGE_BODY: usize = 4 * 1024 * 1024;

fn blog() -> StaticModule {
    StaticModule::new()
        .method("posts", "list", "blog_posts_list")
        .method("posts", "dump", "blog_posts_dump")
        .method("posts", "create", "blog_posts_create")
        .symbol("blog_posts_list", |dr: &mut DudaRequest| {
            let body = format!("post {}", dr.param(0).unwrap_or("none"));
            dr.add_header("Content-Type", "text/plain");
            dr.body_write(body.as_bytes());
        })
        .symbol("blog_posts_dump", |dr: &mut DudaRequest| {
            dr.body_write(&vec![b'x'; LARGE_BODY]);
            dr.event_register_write(Events::BODY_FLUSH);
        })
        .symbol("blog_posts_create", |dr: &mut DudaRequest| {
            let body = format!("created {}", String::from_utf8_lossy(dr.request().body()));
            dr.body_write(body.as_bytes());
        })
}

struct TestServer {
    _root: TempDir,
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(services: &[&str], on_disk: &[&str], fallback: bool) -> Self {
        let root = tempfile::tempdir().unwrap();
        for app in on_disk {
            File::create(root.path().join(format!("{}.duda", app))).unwrap();
        }

        let config = config(root.path(), services);
        let mut loader = StaticLoader::new();
        for app in services {
            loader.register(*app, blog);
        }
        let duda = Duda::load(&config, &loader);

        let mut server = Server::bind(config, duda).unwrap();
        if fallback {
            server = server.with_fallback(|req: &ParsedRequest| -> Result<Reply> {
                let mut body = format!("static {}", req.uri()).into_bytes();
                if !req.body().is_empty() {
                    body.push(b' ');
                    body.extend_from_slice(req.body());
                }
                Ok((ResponseHead::new(Status::OK), body))
            });
        }
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run().unwrap());

        TestServer {
            _root: root,
            addr,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream
    }

    /// Send one request and read until the server closes
    fn exchange(&self, request: &str) -> String {
        let mut stream = self.connect();
        stream.write_all(request.as_bytes()).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn config(root: &Path, services: &[&str]) -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1".to_string(),
        port: 0,
        workers: 2,
        services_root: root.to_path_buf(),
        vhosts: vec![VhostConfig {
            name: "localhost".to_string(),
            aliases: vec!["127.0.0.1".to_string()],
            services: services.iter().map(|s| s.to_string()).collect(),
        }],
        ..ServerConfig::default()
    }
}

/// Read one response framed by Content-Length
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut data = Vec::new();
    let mut byte = [0u8; 1];
    while !data.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert_eq!(n, 1, "connection closed inside response head");
        data.push(byte[0]);
    }
    let head = String::from_utf8(data).unwrap();

    let length: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

#[test]
fn test_service_request_cycle() {
    let server = TestServer::start(&["blog"], &["blog"], false);

    let response = server.exchange("GET /blog/posts/list/5 HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Type: text/plain\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.ends_with("\r\n\r\npost 5"));
}

#[test]
fn test_large_body_flushed_by_events() {
    let server = TestServer::start(&["blog"], &["blog"], false);
    let mut stream = server.connect();
    stream
        .write_all(b"GET /blog/posts/dump HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    // Let the server fill the socket buffers before reading
    thread::sleep(Duration::from_millis(100));

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains(&format!("Content-Length: {}\r\n", LARGE_BODY)));
    assert_eq!(body.len(), LARGE_BODY);
    assert!(body.iter().all(|&b| b == b'x'));
}

#[test]
fn test_undeclared_method_is_404() {
    let server = TestServer::start(&["blog"], &["blog"], true);

    let response = server.exchange("GET /blog/posts/delete HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.contains("Content-Length: 0\r\n"));
}

#[test]
fn test_missing_module_falls_through() {
    let server = TestServer::start(&["shop", "blog"], &["blog"], true);

    let response = server.exchange("GET /shop/cart/list HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("static /shop/cart/list"));

    let response = server.exchange("GET /blog/posts/list/7 HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(response.ends_with("post 7"));
}

#[test]
fn test_default_fallback_is_404() {
    let server = TestServer::start(&["blog"], &["blog"], false);

    let response = server.exchange("GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[test]
fn test_keep_alive_connection() {
    let server = TestServer::start(&["blog"], &["blog"], true);
    let mut stream = server.connect();

    for id in 1..=3 {
        let request = format!(
            "GET /blog/posts/list/{} HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n",
            id
        );
        stream.write_all(request.as_bytes()).unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.contains("Connection: Keep-Alive\r\n"));
        assert_eq!(body, format!("post {}", id).as_bytes());
    }

    stream
        .write_all(b"GET /about HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body, b"static /about");
}

#[test]
fn test_post_bodies_on_keep_alive_connection() {
    let server = TestServer::start(&["blog"], &["blog"], true);
    let mut stream = server.connect();

    stream
        .write_all(
            b"POST /blog/posts/create HTTP/1.1\r\nHost: localhost\r\n\
              Connection: keep-alive\r\nContent-Length: 9\r\n\r\ntitle=one",
        )
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"created title=one");

    // Body and the following request arrive in one segment
    stream
        .write_all(
            b"POST /form HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\
              Content-Length: 7\r\n\r\na=1&b=2GET /about HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Connection: Keep-Alive\r\n"));
    assert_eq!(body, b"static /form a=1&b=2");

    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body, b"static /about");
}

#[test]
fn test_request_validation() {
    let server = TestServer::start(&["blog"], &["blog"], true);

    let response = server.exchange("GET /blog/posts/list HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400 "));

    let response = server.exchange("DELETE /blog/posts/list HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 405 "));

    let response = server.exchange("GET /blog/posts/list HTTP/2.0\r\nHost: localhost\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 505 "));

    let response = server.exchange("POST /blog/posts/list HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 411 "));

    let overflow = "GET /blog/posts/list/1/2/3/4/5/6/7/8/9 HTTP/1.1\r\nHost: localhost\r\n\r\n";
    let response = server.exchange(overflow);
    assert!(response.starts_with("HTTP/1.1 400 "));
}

#[test]
fn test_http10_without_host() {
    let server = TestServer::start(&["blog"], &["blog"], false);

    let response = server.exchange("GET /blog/posts/list/3 HTTP/1.0\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("post 3"));
}

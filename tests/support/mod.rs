//! In-process scripted HTTP test server.
//!
//! Each accepted connection is handled on its own thread; scripted
//! responses are popped from a shared queue in request arrival order.
//! Requests are captured (head and body) for assertions.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// One scripted response.
#[derive(Clone)]
pub struct Script {
    pub reply: Vec<u8>,
    pub then: Then,
    /// Answer `Expect: 100-continue` with an interim 100 before reading
    /// the body.
    pub expect_100: bool,
    /// Sleep before replying (after the request is fully read).
    pub delay: Option<Duration>,
    /// Read the request body before replying. Disable to simulate a
    /// server rejecting an upload early.
    pub read_body: bool,
}

#[derive(Clone, Copy, PartialEq)]
pub enum Then {
    KeepAlive,
    Close,
    /// Write the reply, then go silent for a while before closing.
    Stall,
}

impl Script {
    pub fn raw(reply: impl Into<Vec<u8>>) -> Script {
        Script {
            reply: reply.into(),
            then: Then::KeepAlive,
            expect_100: false,
            delay: None,
            read_body: true,
        }
    }

    pub fn status(code: u16, reason: &str, body: &str) -> Script {
        Script::raw(format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\r\n{}",
            code,
            reason,
            body.len(),
            body
        ))
    }

    pub fn ok(body: &str) -> Script {
        Script::status(200, "OK", body)
    }

    pub fn redirect(code: u16, location: &str) -> Script {
        Script::raw(format!(
            "HTTP/1.1 {} Redirect\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n",
            code, location
        ))
    }

    pub fn with_close(mut self) -> Script {
        self.then = Then::Close;
        self
    }

    pub fn with_stall(mut self) -> Script {
        self.then = Then::Stall;
        self
    }

    pub fn with_expect_100(mut self) -> Script {
        self.expect_100 = true;
        self
    }

    pub fn with_delay(mut self, d: Duration) -> Script {
        self.delay = Some(d);
        self
    }

    pub fn with_skip_body(mut self) -> Script {
        self.read_body = false;
        self
    }
}

/// A captured request.
#[derive(Debug, Clone)]
pub struct Captured {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Captured {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

struct State {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<Captured>>,
    connections: AtomicUsize,
    shutdown: AtomicBool,
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<State>,
    accept: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(scripts: Vec<Script>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(State {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let accept_state = Arc::clone(&state);
        let accept = std::thread::spawn(move || {
            while !accept_state.shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        accept_state.connections.fetch_add(1, Ordering::SeqCst);
                        let state = Arc::clone(&accept_state);
                        std::thread::spawn(move || handle_connection(stream, state));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        TestServer {
            addr,
            state,
            accept: Some(accept),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), path)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn requests(&self) -> Vec<Captured> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.accept.take() {
            let _ = h.join();
        }
    }
}

fn handle_connection(mut stream: TcpStream, state: Arc<State>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_nodelay(true);
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let Some((head_text, body_start)) = read_until_head(&mut stream, &mut pending) else {
            return;
        };
        pending = body_start;

        let Some(mut captured) = parse_head(&head_text) else {
            return;
        };

        let script = state.scripts.lock().unwrap().pop_front();
        let Some(script) = script else {
            let _ = stream.write_all(b"HTTP/1.1 500 No Script\r\nContent-Length: 0\r\n\r\n");
            return;
        };

        if script.expect_100 && captured.header("expect").is_some() {
            let _ = stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n");
        }

        let chunked = captured
            .header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
        let len: usize = captured
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if script.read_body {
            let mut body = Vec::new();
            if !read_body(&mut stream, &mut pending, chunked, len, &mut body) {
                return;
            }
            captured.body = body;
        }

        state.requests.lock().unwrap().push(captured);

        if let Some(d) = script.delay {
            std::thread::sleep(d);
        }

        if stream.write_all(&script.reply).is_err() {
            return;
        }

        match script.then {
            Then::KeepAlive => continue,
            Then::Close => return,
            Then::Stall => {
                for _ in 0..20 {
                    if state.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                return;
            }
        }
    }
}

/// Accumulate bytes until a full header block; returns (head text, rest).
fn read_until_head(stream: &mut TcpStream, pending: &mut Vec<u8>) -> Option<(String, Vec<u8>)> {
    loop {
        if let Some(pos) = find(pending, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&pending[..pos]).to_string();
            let rest = pending[pos + 4..].to_vec();
            return Some((head, rest));
        }

        let mut buf = [0u8; 4096];
        match stream.read(&mut buf) {
            Ok(0) => return None,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
            Err(_) => return None,
        }
    }
}

fn parse_head(head: &str) -> Option<Captured> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    Some(Captured {
        method,
        path,
        headers,
        body: Vec::new(),
    })
}

/// Read the request body per its framing into `body`.
fn read_body(
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
    chunked: bool,
    len: usize,
    body: &mut Vec<u8>,
) -> bool {
    if chunked {
        return read_chunked_body(stream, pending, body);
    }

    while pending.len() < len {
        let mut buf = [0u8; 4096];
        match stream.read(&mut buf) {
            Ok(0) => return false,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
            Err(_) => return false,
        }
    }

    body.extend_from_slice(&pending[..len]);
    pending.drain(..len);
    true
}

fn read_chunked_body(stream: &mut TcpStream, pending: &mut Vec<u8>, body: &mut Vec<u8>) -> bool {
    loop {
        // Need a full size line.
        let line_end = loop {
            if let Some(pos) = find(pending, b"\r\n") {
                break pos;
            }
            if !fill(stream, pending) {
                return false;
            }
        };

        let size_line = String::from_utf8_lossy(&pending[..line_end]).to_string();
        let size = match usize::from_str_radix(size_line.split(';').next().unwrap().trim(), 16) {
            Ok(s) => s,
            Err(_) => return false,
        };
        pending.drain(..line_end + 2);

        if size == 0 {
            // Trailer-less end: expect the final CRLF.
            while pending.len() < 2 {
                if !fill(stream, pending) {
                    return false;
                }
            }
            pending.drain(..2);
            return true;
        }

        while pending.len() < size + 2 {
            if !fill(stream, pending) {
                return false;
            }
        }
        body.extend_from_slice(&pending[..size]);
        pending.drain(..size + 2);
    }
}

fn fill(stream: &mut TcpStream, pending: &mut Vec<u8>) -> bool {
    let mut buf = [0u8; 4096];
    match stream.read(&mut buf) {
        Ok(0) => false,
        Ok(n) => {
            pending.extend_from_slice(&buf[..n]);
            true
        }
        Err(_) => false,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

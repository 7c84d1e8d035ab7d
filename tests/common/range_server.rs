//! Minimal threaded HTTP server for the integration tests. Answers HEAD
//! probes and (optionally) byte-range GETs over a fixed in-memory body,
//! with knobs for fault injection, pacing and response shaping.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Advertise `Accept-Ranges: bytes` and honor `Range` on GET.
    pub ranges: bool,
    /// Include `Content-Length` on HEAD and unranged GET responses.
    pub send_length: bool,
    /// `Content-Disposition` header value for the HEAD response.
    pub content_disposition: Option<String>,
    /// The first N ranged GETs answer 500 before the server recovers.
    pub range_failures: usize,
    /// Every ranged GET answers 500.
    pub always_fail_ranges: bool,
    /// Pause between 1 KiB body writes, to keep transfers in flight.
    pub chunk_delay: Option<Duration>,
    /// Delay each ranged response by a per-offset amount, so segments
    /// complete in an order unrelated to their index.
    pub stagger: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ranges: true,
            send_length: true,
            content_disposition: None,
            range_failures: 0,
            always_fail_ranges: false,
            chunk_delay: None,
            stagger: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub range_requests: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ServerStats {
    pub fn range_requests(&self) -> usize {
        self.range_requests.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ServerState {
    body: Vec<u8>,
    options: ServerOptions,
    stats: Arc<ServerStats>,
    failures_left: AtomicUsize,
}

pub struct TestServer {
    pub url: String,
    pub stats: Arc<ServerStats>,
}

impl TestServer {
    /// URL whose last path segment is `name`, so downloads pick that
    /// file name.
    pub fn file_url(&self, name: &str) -> String {
        format!("{}{name}", self.url)
    }
}

pub fn start(body: Vec<u8>) -> TestServer {
    start_with(body, ServerOptions::default())
}

pub fn start_with(body: Vec<u8>, options: ServerOptions) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    let stats = Arc::new(ServerStats::default());
    let state = Arc::new(ServerState {
        failures_left: AtomicUsize::new(options.range_failures),
        body,
        options,
        stats: Arc::clone(&stats),
    });

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let state = Arc::clone(&state);
            thread::spawn(move || handle(stream, &state));
        }
    });

    TestServer {
        url: format!("http://{addr}/"),
        stats,
    }
}

fn handle(mut stream: TcpStream, state: &ServerState) {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 1024];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") && raw.len() < 16 * 1024 {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => raw.extend_from_slice(&chunk[..n]),
        }
    }
    let request = String::from_utf8_lossy(&raw);
    let method = request.split_whitespace().next().unwrap_or("").to_string();
    let range = request
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if !name.eq_ignore_ascii_case("Range") {
                return None;
            }
            value.trim().strip_prefix("bytes=")
        })
        .and_then(parse_range);

    match (method.as_str(), range) {
        ("HEAD", _) => respond_head(&mut stream, state),
        ("GET", Some((start, end))) if state.options.ranges => {
            respond_range(&mut stream, state, start, end)
        }
        ("GET", _) => respond_full(&mut stream, state),
        _ => {
            let _ = stream.write_all(
                b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.trim().split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn respond_head(stream: &mut TcpStream, state: &ServerState) {
    let mut response = String::from("HTTP/1.1 200 OK\r\n");
    if state.options.send_length {
        response.push_str(&format!("Content-Length: {}\r\n", state.body.len()));
    }
    if state.options.ranges {
        response.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(disposition) = &state.options.content_disposition {
        response.push_str(&format!("Content-Disposition: {disposition}\r\n"));
    }
    response.push_str("Connection: close\r\n\r\n");
    let _ = stream.write_all(response.as_bytes());
}

fn respond_range(stream: &mut TcpStream, state: &ServerState, start: u64, end: u64) {
    state.stats.range_requests.fetch_add(1, Ordering::SeqCst);
    // Injected failures count towards concurrency too: they occupy a
    // client slot just like a served range does.
    state.stats.enter();
    serve_range(stream, state, start, end);
    state.stats.leave();
}

fn serve_range(stream: &mut TcpStream, state: &ServerState, start: u64, end: u64) {
    let inject_failure = state.options.always_fail_ranges
        || state
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
    if inject_failure {
        let _ = stream.write_all(
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    }

    let total = state.body.len() as u64;
    if start >= total || end < start {
        let _ = stream.write_all(
            b"HTTP/1.1 416 Range Not Satisfiable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    }
    let end = end.min(total - 1);
    let slice = &state.body[start as usize..=end as usize];

    if state.options.stagger {
        thread::sleep(Duration::from_millis((start / 1024) % 7 * 11));
    }

    let header = format!(
        "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {start}-{end}/{total}\r\nConnection: close\r\n\r\n",
        slice.len()
    );
    let _ = stream.write_all(header.as_bytes());
    write_body(stream, slice, state.options.chunk_delay);
}

fn respond_full(stream: &mut TcpStream, state: &ServerState) {
    let mut header = String::from("HTTP/1.1 200 OK\r\n");
    if state.options.send_length {
        header.push_str(&format!("Content-Length: {}\r\n", state.body.len()));
    }
    header.push_str("Connection: close\r\n\r\n");
    let _ = stream.write_all(header.as_bytes());
    write_body(stream, &state.body, state.options.chunk_delay);
}

fn write_body(stream: &mut TcpStream, body: &[u8], delay: Option<Duration>) {
    for (i, piece) in body.chunks(1024).enumerate() {
        if i > 0 {
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
        }
        if stream.write_all(piece).is_err() {
            return;
        }
        let _ = stream.flush();
    }
}

//! Shared plumbing for the integration tests: a server running on its own
//! thread, and a small raw HTTP/1.1 client speaking over std sockets.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use hearth::rt::EventLoop;
use hearth::server::Builder;
use hearth::web::App;
use hearth::Server;

pub struct Served {
    pub addr: SocketAddr,
}

/// Boots an [`App`] on a fresh event loop in a background thread and
/// returns the bound address. The app is built inside the server thread
/// because it is not `Send`.
pub fn serve<F>(build_app: F) -> Served
where
    F: FnOnce() -> App + Send + 'static,
{
    serve_tuned(build_app, |builder| builder)
}

pub fn serve_tuned<F>(build_app: F, tune: fn(Builder) -> Builder) -> Served
where
    F: FnOnce() -> App + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let el = EventLoop::new().expect("event loop");
        let app = build_app();
        let server = tune(Server::builder(el.clone()).listen_on(["127.0.0.1:0"]))
            .serve(app.sgi());
        server.start().expect("server start");
        tx.send(server.local_addrs()[0]).expect("report addr");
        el.block_on(server.run_forever());
    });
    let addr = rx.recv_timeout(Duration::from_secs(5)).expect("server boot");
    Served { addr }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

/// Writes one raw request and reads everything until the server closes.
pub fn send_raw(addr: SocketAddr, raw: &[u8]) -> Vec<u8> {
    let mut stream = connect(addr);
    stream.write_all(raw).expect("write request");
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("read response");
    buf
}

/// A parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct RawResponse {
    pub status_line: String,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn status(&self) -> u16 {
        self.status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("status code")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).expect("utf-8 body")
    }
}

/// Reads exactly one framed response off the stream (content-length or
/// chunked), leaving any following bytes unread for keep-alive tests.
pub fn read_response(stream: &mut TcpStream) -> RawResponse {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("read head");
        assert!(n > 0, "eof inside response head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    let head_text = String::from_utf8(head).expect("ascii head");
    let mut lines = head_text.split("\r\n");
    let status_line = lines.next().expect("status line").to_owned();
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(": ").expect("header line");
        headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.to_owned());
    }

    let body = if let Some(lengths) = headers.get("content-length") {
        let len: usize = lengths[0].parse().expect("content-length");
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).expect("read sized body");
        body
    } else if headers
        .get("transfer-encoding")
        .map(|values| values.iter().any(|v| v.contains("chunked")))
        .unwrap_or(false)
    {
        read_chunked_body(stream)
    } else {
        let mut body = Vec::new();
        stream.read_to_end(&mut body).expect("read close-delimited body");
        body
    };

    RawResponse {
        status_line,
        headers,
        body,
    }
}

fn read_chunked_body(stream: &mut TcpStream) -> Vec<u8> {
    let mut body = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let mut size_line = Vec::new();
        while !size_line.ends_with(b"\r\n") {
            stream.read_exact(&mut byte).expect("read chunk size");
            size_line.push(byte[0]);
        }
        let size_text = std::str::from_utf8(&size_line[..size_line.len() - 2]).expect("ascii");
        let size = usize::from_str_radix(size_text.split(';').next().unwrap(), 16)
            .expect("chunk size");
        if size == 0 {
            // Trailers (if any) end with a blank line.
            let mut tail = Vec::new();
            loop {
                stream.read_exact(&mut byte).expect("read trailer");
                tail.push(byte[0]);
                if tail == b"\r\n" || tail.ends_with(b"\r\n\r\n") {
                    return body;
                }
            }
        }
        let mut chunk = vec![0u8; size];
        stream.read_exact(&mut chunk).expect("read chunk");
        body.extend_from_slice(&chunk);
        let mut crlf = [0u8; 2];
        stream.read_exact(&mut crlf).expect("chunk crlf");
        assert_eq!(&crlf, b"\r\n");
    }
}

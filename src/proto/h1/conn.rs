use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use http::{StatusCode, Version};
use tracing::{debug, trace};

use crate::error::User;
use crate::proto::{BodyLength, RequestHead};
use crate::rt::Executor;
use crate::sgi::{App, ReceiveHandle, Scope, SendHandle, SgiPoll};

use super::{encode_head, parse_head, Decoded, Decoder, Encoder, ParseStatus};

const READ_CHUNK: usize = 16 * 1024;

/// This handles one accepted socket, which will likely carry multiple
/// requests over its lifetime.
///
/// The connection owns its buffers, parser and encoder state, and decides
/// when a message begins and ends, whether the connection can be kept alive
/// after a response, and when it must close. All I/O is non-blocking; the
/// executor's readiness callbacks drive it.
#[derive(Clone)]
pub(crate) struct Connection {
    inner: Rc<RefCell<Conn>>,
}

struct Conn {
    io: TcpStream,
    fd: RawFd,
    local_addr: SocketAddr,
    peer_addr: Option<SocketAddr>,
    exec: Rc<dyn Executor>,
    app: App,
    on_close: Option<Rc<dyn Fn(RawFd)>>,

    read_buf: BytesMut,
    write_buf: BytesMut,
    max_head_size: usize,
    max_write_buf: usize,

    reading: Reading,
    writing: Writing,
    /// Version of the request currently in flight; responses mirror it.
    version: Version,
    /// Whether the request in flight asked to keep the connection alive.
    keep_alive: bool,
    /// Close once the response is done and the write buffer has drained.
    close_pending: bool,
    in_flight: bool,
    read_eof: bool,
    closed: bool,
    writer_registered: bool,
    last_activity: Instant,

    read_subscriber: Option<Box<dyn FnOnce()>>,
    write_subscriber: Option<Box<dyn FnOnce()>>,
}

enum Reading {
    /// Waiting for (or mid-way through) the next request head.
    Init,
    /// Streaming the request body to the application.
    Body(Decoder),
    /// The response finished before the body was fully read; the rest is
    /// decoded and thrown away so the next head can be parsed.
    Discard(Decoder),
    /// Body complete; nothing to read until the response finishes.
    KeepAlive,
    Closed,
}

enum Writing {
    /// `send_start` has not happened yet.
    Init,
    /// Head queued; body bytes flow through the encoder.
    Body(Encoder),
    /// Final body chunk queued.
    Done,
    Closed,
}

/// Side effects collected while the connection state is borrowed, performed
/// after the borrow is released.
#[derive(Default)]
struct Actions {
    dispatch: Option<Scope>,
    fire_read: Option<Box<dyn FnOnce()>>,
    fire_write: Option<Box<dyn FnOnce()>>,
    register_writer: bool,
    deregister_writer: bool,
    close: bool,
}

impl Connection {
    pub(crate) fn new(
        io: TcpStream,
        exec: Rc<dyn Executor>,
        app: App,
        on_close: Rc<dyn Fn(RawFd)>,
        max_head_size: usize,
        max_write_buf: usize,
    ) -> io::Result<Connection> {
        let fd = io.as_raw_fd();
        let local_addr = io.local_addr()?;
        let peer_addr = io.peer_addr().ok();
        Ok(Connection {
            inner: Rc::new(RefCell::new(Conn {
                io,
                fd,
                local_addr,
                peer_addr,
                exec,
                app,
                on_close: Some(on_close),
                read_buf: BytesMut::with_capacity(0),
                write_buf: BytesMut::with_capacity(0),
                max_head_size,
                max_write_buf,
                reading: Reading::Init,
                writing: Writing::Init,
                version: Version::HTTP_11,
                keep_alive: true,
                close_pending: false,
                in_flight: false,
                read_eof: false,
                closed: false,
                writer_registered: false,
                last_activity: Instant::now(),
                read_subscriber: None,
                write_subscriber: None,
            })),
        })
    }

    /// Starts readiness-driven processing.
    pub(crate) fn register(&self) {
        let fd = self.fd();
        let conn = self.clone();
        let exec = self.inner.borrow().exec.clone();
        exec.add_reader(fd, Rc::new(move || conn.on_readable()));
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    /// Idle means between requests: no request in flight, nothing left to
    /// flush, and not even a partial head buffered. A connection stalled
    /// mid-head is not idle; only the idle-max sweep may take it down.
    pub(crate) fn is_idle(&self) -> bool {
        let conn = self.inner.borrow();
        !conn.closed && !conn.in_flight && conn.write_buf.is_empty() && conn.read_buf.is_empty()
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.inner.borrow().last_activity
    }

    fn on_readable(&self) {
        let mut actions = Actions::default();
        {
            let mut conn = self.inner.borrow_mut();
            conn.fill_read_buf(&mut actions);
            conn.pump(&mut actions);
        }
        self.finish(actions);
    }

    fn on_writable(&self) {
        let mut actions = Actions::default();
        {
            let mut conn = self.inner.borrow_mut();
            let _ = conn.try_flush(&mut actions);
        }
        self.finish(actions);
    }

    pub(crate) fn send_start(
        &self,
        status: u16,
        headers: &[(Bytes, Bytes)],
    ) -> crate::Result<SgiPoll<()>> {
        let mut actions = Actions::default();
        let result = self.inner.borrow_mut().do_send_start(status, headers, &mut actions);
        self.finish(actions);
        result
    }

    pub(crate) fn send_body(&self, more_body: bool, data: Bytes) -> crate::Result<SgiPoll<()>> {
        let mut actions = Actions::default();
        let result = self.inner.borrow_mut().do_send_body(more_body, &data, &mut actions);
        self.finish(actions);
        result
    }

    pub(crate) fn receive(&self) -> crate::Result<SgiPoll<(bool, Bytes)>> {
        let mut actions = Actions::default();
        let result = self.inner.borrow_mut().do_receive(&mut actions);
        self.finish(actions);
        result
    }

    pub(crate) fn subscribe_read(&self, cb: Box<dyn FnOnce()>) {
        {
            let mut conn = self.inner.borrow_mut();
            if !conn.closed {
                conn.read_subscriber = Some(cb);
            } else {
                drop(conn);
                // Closed is "ready": the retry will observe the error.
                cb();
                return;
            }
        }
        // Fire immediately if a read can already make progress, so a wake
        // is never lost to subscribe-after-ready.
        let mut actions = Actions::default();
        self.inner.borrow_mut().notify_read(&mut actions);
        self.finish(actions);
    }

    pub(crate) fn subscribe_write(&self, cb: Box<dyn FnOnce()>) {
        {
            let mut conn = self.inner.borrow_mut();
            if !conn.closed {
                conn.write_subscriber = Some(cb);
            } else {
                drop(conn);
                cb();
                return;
            }
        }
        let fire = {
            let mut conn = self.inner.borrow_mut();
            if conn.write_buf.len() < conn.max_write_buf {
                conn.write_subscriber.take()
            } else {
                None
            }
        };
        if let Some(cb) = fire {
            cb();
        }
    }

    /// Tears the connection down: deregisters, wakes any pending
    /// subscribers (they will observe a closed error), and reports to the
    /// owner.
    pub(crate) fn close(&self) {
        let (exec, fd, writer_registered, read_cb, write_cb, on_close) = {
            let mut conn = self.inner.borrow_mut();
            if conn.closed {
                return;
            }
            conn.closed = true;
            conn.reading = Reading::Closed;
            conn.writing = Writing::Closed;
            let _ = conn.io.shutdown(Shutdown::Both);
            (
                conn.exec.clone(),
                conn.fd,
                conn.writer_registered,
                conn.read_subscriber.take(),
                conn.write_subscriber.take(),
                conn.on_close.take(),
            )
        };
        debug!("connection {} closed", fd);
        exec.remove_reader(fd);
        if writer_registered {
            exec.remove_writer(fd);
        }
        if let Some(cb) = read_cb {
            cb();
        }
        if let Some(cb) = write_cb {
            cb();
        }
        if let Some(hook) = on_close {
            hook(fd);
        }
    }

    fn finish(&self, actions: Actions) {
        if actions.register_writer {
            let fd = self.fd();
            let conn = self.clone();
            let exec = self.inner.borrow().exec.clone();
            exec.add_writer(fd, Rc::new(move || conn.on_writable()));
        } else if actions.deregister_writer {
            let fd = self.fd();
            let exec = self.inner.borrow().exec.clone();
            exec.remove_writer(fd);
        }
        if let Some(cb) = actions.fire_read {
            cb();
        }
        if let Some(cb) = actions.fire_write {
            cb();
        }
        if let Some(scope) = actions.dispatch {
            let (app, exec) = {
                let conn = self.inner.borrow();
                (conn.app.clone(), conn.exec.clone())
            };
            let receive = ReceiveHandle::new(self.clone());
            let send = SendHandle::new(self.clone());
            exec.spawn((app)(scope, receive, send));
        }
        if actions.close {
            self.close();
        }
    }
}

impl Conn {
    fn fill_read_buf(&mut self, actions: &mut Actions) {
        if self.closed || self.read_eof {
            return;
        }
        let mut progressed = false;
        let mut tmp = [0u8; READ_CHUNK];
        loop {
            match self.io.read(&mut tmp) {
                Ok(0) => {
                    trace!("read eof");
                    self.read_eof = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&tmp[..n]);
                    progressed = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read error: {}", e);
                    actions.close = true;
                    return;
                }
            }
        }
        if progressed {
            self.last_activity = Instant::now();
        }
    }

    /// Central progress pump: discards abandoned bodies, parses the next
    /// head when allowed, and wakes a pending receive subscription.
    fn pump(&mut self, actions: &mut Actions) {
        loop {
            match self.reading {
                Reading::Discard(ref mut decoder) => match decoder.decode(&mut self.read_buf) {
                    Ok(Decoded::Data(_)) => continue,
                    Ok(Decoded::Eof) => {
                        self.reading = Reading::Init;
                        continue;
                    }
                    Ok(Decoded::Pending) => {
                        if self.read_eof {
                            actions.close = true;
                        }
                        break;
                    }
                    Err(_) => {
                        actions.close = true;
                        break;
                    }
                },
                Reading::Init if !self.in_flight && !self.close_pending && !self.closed => {
                    if self.read_buf.is_empty() {
                        if self.read_eof {
                            // Graceful close between requests.
                            actions.close = true;
                        }
                        break;
                    }
                    match parse_head(&mut self.read_buf, self.max_head_size) {
                        Ok(ParseStatus::Complete(head)) => {
                            self.begin_request(head, actions);
                            break;
                        }
                        Ok(ParseStatus::Partial) => {
                            if self.read_eof {
                                debug!("connection closed mid-head");
                                actions.close = true;
                            }
                            break;
                        }
                        Err(ref e) if e.is_parse_too_large() => {
                            self.respond_error(StatusCode::PAYLOAD_TOO_LARGE, actions);
                            break;
                        }
                        Err(e) => {
                            debug!("parse error: {}", e);
                            self.respond_error(StatusCode::BAD_REQUEST, actions);
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
        self.notify_read(actions);
    }

    fn notify_read(&mut self, actions: &mut Actions) {
        if self.read_subscriber.is_none() {
            return;
        }
        let ready = match self.reading {
            // A receive can progress once body bytes (or EOF) arrived.
            Reading::Body(_) => !self.read_buf.is_empty() || self.read_eof,
            // Every other state answers a receive without blocking.
            _ => true,
        };
        if ready {
            actions.fire_read = self.read_subscriber.take();
        }
    }

    fn begin_request(&mut self, head: RequestHead, actions: &mut Actions) {
        trace!("request head complete: {} {}", head.method, head.path);
        self.version = head.version;
        self.keep_alive = head.keep_alive;
        self.in_flight = true;
        self.writing = Writing::Init;
        self.reading = match head.body {
            BodyLength::Known(0) => Reading::KeepAlive,
            BodyLength::Known(len) => Reading::Body(Decoder::length(len)),
            BodyLength::Chunked => Reading::Body(Decoder::chunked()),
        };
        if head.expect_continue {
            self.write_buf
                .extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
            let _ = self.try_flush(actions);
        }
        actions.dispatch = Some(Scope {
            ty: "http",
            http_version: head.version,
            method: head.method,
            scheme: "http",
            path: head.path,
            query: head.query,
            root_path: String::new(),
            headers: head.headers,
            client: self.peer_addr,
            server: self.local_addr,
        });
    }

    /// Best-effort error response; only possible while nothing of a
    /// response has been queued. Always ends in a close.
    fn respond_error(&mut self, status: StatusCode, actions: &mut Actions) {
        if self.closed || !matches!(self.writing, Writing::Init) {
            actions.close = true;
            return;
        }
        debug!("answering {} and closing", status.as_u16());
        self.write_buf.extend_from_slice(b"HTTP/1.1 ");
        self.write_buf
            .extend_from_slice(status.as_str().as_bytes());
        self.write_buf.extend_from_slice(b" ");
        self.write_buf
            .extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        self.write_buf
            .extend_from_slice(b"\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        self.reading = Reading::Closed;
        self.writing = Writing::Done;
        self.close_pending = true;
        let _ = self.try_flush(actions);
    }

    fn do_send_start(
        &mut self,
        status: u16,
        headers: &[(Bytes, Bytes)],
        actions: &mut Actions,
    ) -> crate::Result<SgiPoll<()>> {
        if self.closed {
            return Err(crate::Error::new_closed());
        }
        match self.writing {
            Writing::Init => {}
            Writing::Closed => return Err(crate::Error::new_closed()),
            _ => return Err(crate::Error::new_user(User::DoubleStart)),
        }
        if self.write_buf.len() >= self.max_write_buf {
            return Ok(SgiPoll::Pending);
        }
        let (encoder, wants_close) = encode_head(status, headers, self.version, &mut self.write_buf);
        self.writing = Writing::Body(encoder);
        if wants_close || !self.keep_alive {
            self.close_pending = true;
        }
        self.try_flush(actions)?;
        Ok(SgiPoll::Ready(()))
    }

    fn do_send_body(
        &mut self,
        more_body: bool,
        data: &[u8],
        actions: &mut Actions,
    ) -> crate::Result<SgiPoll<()>> {
        if self.closed {
            return Err(crate::Error::new_closed());
        }
        let mut encoder = match std::mem::replace(&mut self.writing, Writing::Init) {
            Writing::Body(encoder) => encoder,
            Writing::Init => return Err(crate::Error::new_user(User::UnstartedSend)),
            Writing::Done => {
                self.writing = Writing::Done;
                return Err(crate::Error::new_user(User::SendAfterEnd));
            }
            Writing::Closed => {
                self.writing = Writing::Closed;
                return Err(crate::Error::new_closed());
            }
        };
        if self.write_buf.len() >= self.max_write_buf {
            self.writing = Writing::Body(encoder);
            return Ok(SgiPoll::Pending);
        }
        if let Err(e) = encoder.encode(data, &mut self.write_buf) {
            // Protocol misuse is fatal to the connection.
            actions.close = true;
            return Err(e);
        }
        if more_body {
            self.writing = Writing::Body(encoder);
        } else {
            match encoder.end(&mut self.write_buf) {
                Ok(must_close) => {
                    if must_close {
                        self.close_pending = true;
                    }
                }
                Err(e) => {
                    actions.close = true;
                    return Err(e);
                }
            }
            self.writing = Writing::Done;
        }
        self.try_flush(actions)?;
        if matches!(self.writing, Writing::Done) {
            self.finish_request(actions);
        }
        Ok(SgiPoll::Ready(()))
    }

    fn do_receive(&mut self, actions: &mut Actions) -> crate::Result<SgiPoll<(bool, Bytes)>> {
        if self.closed {
            return Err(crate::Error::new_closed());
        }
        match self.reading {
            Reading::Body(ref mut decoder) => match decoder.decode(&mut self.read_buf) {
                Ok(Decoded::Data(data)) => {
                    let more = !decoder.is_eof();
                    if !more {
                        trace!("incoming body completed");
                        self.reading = Reading::KeepAlive;
                    }
                    Ok(SgiPoll::Ready((more, data)))
                }
                Ok(Decoded::Eof) => {
                    self.reading = Reading::KeepAlive;
                    Ok(SgiPoll::Ready((false, Bytes::new())))
                }
                Ok(Decoded::Pending) => {
                    if self.read_eof {
                        actions.close = true;
                        Err(crate::Error::new_incomplete())
                    } else {
                        Ok(SgiPoll::Pending)
                    }
                }
                Err(e) => {
                    actions.close = true;
                    Err(e)
                }
            },
            Reading::Closed => Err(crate::Error::new_closed()),
            // No body, body already finished, or between requests: reads
            // after the end stay valid and report the end of the stream.
            _ => Ok(SgiPoll::Ready((false, Bytes::new()))),
        }
    }

    /// The response's final bytes are queued; the connection either recycles
    /// for the next request or arranges to close once drained.
    fn finish_request(&mut self, actions: &mut Actions) {
        if !self.in_flight {
            return;
        }
        self.in_flight = false;
        self.last_activity = Instant::now();
        if self.close_pending {
            if self.write_buf.is_empty() {
                actions.close = true;
            }
            return;
        }
        self.reading = match std::mem::replace(&mut self.reading, Reading::Init) {
            Reading::Body(decoder) => Reading::Discard(decoder),
            Reading::Closed => Reading::Closed,
            _ => Reading::Init,
        };
        self.writing = Writing::Init;
        // A pipelined request may already be buffered.
        self.pump(actions);
    }

    fn try_flush(&mut self, actions: &mut Actions) -> crate::Result<()> {
        while !self.write_buf.is_empty() {
            match self.io.write(&self.write_buf) {
                Ok(0) => {
                    actions.close = true;
                    return Err(crate::Error::new_io(io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    trace!("flushed {}B", n);
                    self.write_buf.advance(n);
                    self.last_activity = Instant::now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("write error: {}", e);
                    actions.close = true;
                    return Err(crate::Error::new_io(e));
                }
            }
        }
        if self.write_buf.is_empty() {
            if self.writer_registered {
                self.writer_registered = false;
                actions.deregister_writer = true;
                actions.register_writer = false;
            }
            if self.close_pending && matches!(self.writing, Writing::Done) {
                actions.close = true;
            }
        } else if !self.writer_registered {
            self.writer_registered = true;
            actions.register_writer = true;
        }
        if self.write_subscriber.is_some() && self.write_buf.len() < self.max_write_buf {
            actions.fire_write = self.write_subscriber.take();
        }
        Ok(())
    }
}

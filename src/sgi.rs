//! The server gateway interface.
//!
//! Every request is handed to the application as three values: a [`Scope`]
//! describing the request head, a [`ReceiveHandle`] streaming the request
//! body in, and a [`SendHandle`] streaming the response out.
//!
//! `send_start`, `send_body` and `receive` are synchronous and never block:
//! when the underlying connection cannot make progress they return
//! [`SgiPoll::Pending`], and `subscribe` registers a one-shot callback fired
//! when the resource becomes ready again. That pair is enough to bridge the
//! engine to any cooperative runtime; the async adapters on the handles
//! (`start`, `body`, `recv`) do exactly that bridging for Rust futures.

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use futures_core::future::LocalBoxFuture;
use http::{Method, Version};

use crate::proto::h1::Connection;
use crate::rt::Waiter;

/// The application entry point: one call per request.
pub type App = Rc<dyn Fn(Scope, ReceiveHandle, SendHandle) -> LocalBoxFuture<'static, ()>>;

/// Outcome of a non-blocking gateway call.
///
/// `Pending` is a cooperative signal, not an error: register a callback with
/// `subscribe` and retry once it fires.
#[derive(Debug, PartialEq)]
pub enum SgiPoll<T> {
    Ready(T),
    Pending,
}

/// The request head as handed to the application. Immutable.
#[derive(Debug, Clone)]
pub struct Scope {
    /// Always "http".
    pub ty: &'static str,
    pub http_version: Version,
    pub method: Method,
    /// "http", or "https" when a TLS layer wraps the transport.
    pub scheme: &'static str,
    /// Percent-decoded path.
    pub path: String,
    /// Raw query bytes; no decoding applied.
    pub query: Bytes,
    pub root_path: String,
    /// Ordered header pairs; names lower-cased, duplicates preserved.
    pub headers: Vec<(Bytes, Bytes)>,
    pub client: Option<SocketAddr>,
    pub server: SocketAddr,
}

impl Scope {
    /// The HTTP version as its wire token.
    pub fn http_version_str(&self) -> &'static str {
        match self.http_version {
            Version::HTTP_10 => "1.0",
            _ => "1.1",
        }
    }
}

/// The response side of a request.
///
/// `send_start` must be called exactly once, before any `send_body`; the
/// `send_body` call with `more_body = false` is terminal.
pub struct SendHandle {
    conn: Connection,
    started: Cell<bool>,
    finished: Cell<bool>,
}

impl SendHandle {
    pub(crate) fn new(conn: Connection) -> SendHandle {
        SendHandle {
            conn,
            started: Cell::new(false),
            finished: Cell::new(false),
        }
    }

    /// Queues the status line and headers.
    pub fn send_start(&self, status: u16, headers: &[(Bytes, Bytes)]) -> crate::Result<SgiPoll<()>> {
        if self.started.get() {
            return Err(crate::Error::new_user(crate::error::User::DoubleStart));
        }
        let out = self.conn.send_start(status, headers)?;
        if let SgiPoll::Ready(()) = out {
            self.started.set(true);
        }
        Ok(out)
    }

    /// Queues one run of body bytes; `more_body = false` finishes the
    /// response.
    pub fn send_body(&self, more_body: bool, data: Bytes) -> crate::Result<SgiPoll<()>> {
        if !self.started.get() {
            return Err(crate::Error::new_user(crate::error::User::UnstartedSend));
        }
        if self.finished.get() {
            return Err(crate::Error::new_user(crate::error::User::SendAfterEnd));
        }
        let out = self.conn.send_body(more_body, data)?;
        if let SgiPoll::Ready(()) = out {
            if !more_body {
                self.finished.set(true);
            }
        }
        Ok(out)
    }

    /// Registers a one-shot callback fired when the connection can accept
    /// more response bytes. Replaces any prior registration.
    pub fn subscribe(&self, cb: Box<dyn FnOnce()>) {
        self.conn.subscribe_write(cb);
    }

    /// Async adapter over [`send_start`](SendHandle::send_start).
    pub async fn start(&self, status: u16, headers: &[(Bytes, Bytes)]) -> crate::Result<()> {
        loop {
            match self.send_start(status, headers)? {
                SgiPoll::Ready(()) => return Ok(()),
                SgiPoll::Pending => self.ready().await,
            }
        }
    }

    /// Async adapter over [`send_body`](SendHandle::send_body).
    pub async fn body(&self, more_body: bool, data: Bytes) -> crate::Result<()> {
        loop {
            match self.send_body(more_body, data.clone())? {
                SgiPoll::Ready(()) => return Ok(()),
                SgiPoll::Pending => self.ready().await,
            }
        }
    }

    async fn ready(&self) {
        let waiter = Waiter::new();
        let signal = waiter.clone();
        self.subscribe(Box::new(move || signal.stop()));
        waiter.wait().await;
    }
}

impl std::fmt::Debug for SendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendHandle").finish()
    }
}

/// The request-body side of a request.
///
/// Produces a monotone stream of `(more_body, data)`; after a read with
/// `more_body = false`, every further read yields `(false, empty)`.
pub struct ReceiveHandle {
    conn: Connection,
    eof: Cell<bool>,
}

impl ReceiveHandle {
    pub(crate) fn new(conn: Connection) -> ReceiveHandle {
        ReceiveHandle {
            conn,
            eof: Cell::new(false),
        }
    }

    /// Takes the next run of body bytes, if any are decoded.
    pub fn receive(&self) -> crate::Result<SgiPoll<(bool, Bytes)>> {
        if self.eof.get() {
            return Ok(SgiPoll::Ready((false, Bytes::new())));
        }
        let out = self.conn.receive()?;
        if let SgiPoll::Ready((false, _)) = out {
            self.eof.set(true);
        }
        Ok(out)
    }

    /// Registers a one-shot callback fired when body bytes (or the end of
    /// the body) become available. Replaces any prior registration.
    pub fn subscribe(&self, cb: Box<dyn FnOnce()>) {
        self.conn.subscribe_read(cb);
    }

    /// Async adapter over [`receive`](ReceiveHandle::receive).
    pub async fn recv(&self) -> crate::Result<(bool, Bytes)> {
        loop {
            match self.receive()? {
                SgiPoll::Ready(out) => return Ok(out),
                SgiPoll::Pending => {
                    let waiter = Waiter::new();
                    let signal = waiter.clone();
                    self.subscribe(Box::new(move || signal.stop()));
                    waiter.wait().await;
                }
            }
        }
    }
}

impl std::fmt::Debug for ReceiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveHandle").finish()
    }
}

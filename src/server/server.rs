use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::proto::h1::Connection;
use crate::rt::{Executor, Wait, Waiter};
use crate::sgi::{App, ReceiveHandle, Scope, SendHandle};

use super::listener::Listener;

// Matches the largest head the parser will accept before answering 413.
const DEFAULT_MAX_HEAD_SIZE: usize = 8192 + 4096 * 100;
const DEFAULT_MAX_WRITE_BUF: usize = 8192 + 4096 * 100;

/// A builder for a [`Server`].
pub struct Builder {
    exec: Rc<dyn Executor>,
    listen_on: Vec<String>,
    backlog: u32,
    keep_alive: Duration,
    keep_alive_interval: Duration,
    idle_max: Option<Duration>,
    debug: bool,
    max_head_size: usize,
    max_write_buf: usize,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("listen_on", &self.listen_on)
            .field("backlog", &self.backlog)
            .field("keep_alive", &self.keep_alive)
            .field("idle_max", &self.idle_max)
            .finish()
    }
}

/// An HTTP/1.1 server bound to a cooperative executor.
///
/// Built with [`Server::builder`]; `start` binds the listeners and arms the
/// sweeps, `shutdown` tears everything down, and `run_forever` awaits the
/// shutdown signal.
#[derive(Clone)]
pub struct Server {
    inner: Rc<Inner>,
}

struct Inner {
    exec: Rc<dyn Executor>,
    app: App,
    listen_on: Vec<String>,
    backlog: u32,
    keep_alive: Duration,
    keep_alive_interval: Duration,
    idle_max: Option<Duration>,
    debug: bool,
    max_head_size: usize,
    max_write_buf: usize,
    listeners: RefCell<Vec<Listener>>,
    conns: RefCell<HashMap<RawFd, Connection>>,
    waiter: Waiter,
    running: Cell<bool>,
}

impl Server {
    /// Starts a [`Builder`] on the provided executor.
    pub fn builder(exec: impl Executor + 'static) -> Builder {
        Builder::new(Rc::new(exec))
    }
}

impl Builder {
    fn new(exec: Rc<dyn Executor>) -> Builder {
        Builder {
            listen_on: vec!["127.0.0.1:8080".to_owned()],
            backlog: 1024,
            keep_alive: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(1),
            idle_max: None,
            debug: false,
            max_head_size: DEFAULT_MAX_HEAD_SIZE,
            max_write_buf: DEFAULT_MAX_WRITE_BUF,
            exec,
        }
    }

    /// Replaces the listen endpoints ("host:port" strings, one or many).
    pub fn listen_on<I, S>(mut self, addrs: I) -> Builder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.listen_on = addrs.into_iter().map(Into::into).collect();
        self
    }

    /// Caps the accept queue depth, and how many sockets one readiness tick
    /// may accept. Default 1024.
    pub fn backlog(mut self, backlog: u32) -> Builder {
        self.backlog = backlog;
        self
    }

    /// Inactivity budget for idle keep-alive connections. Default 5 s.
    pub fn keep_alive(mut self, dur: Duration) -> Builder {
        self.keep_alive = dur;
        self
    }

    /// Period of the keep-alive sweep. Default 1 s.
    pub fn keep_alive_interval(mut self, dur: Duration) -> Builder {
        self.keep_alive_interval = dur;
        self
    }

    /// Total inactivity budget applied to connections in any state; zero
    /// disables the sweep. Disabled by default.
    pub fn idle_max(mut self, dur: Duration) -> Builder {
        self.idle_max = if dur == Duration::from_secs(0) {
            None
        } else {
            Some(dur)
        };
        self
    }

    /// Enables the periodic client-count log.
    pub fn debug(mut self, enabled: bool) -> Builder {
        self.debug = enabled;
        self
    }

    /// Caps how large a request head may grow before the connection is
    /// answered with 413 and closed.
    pub fn max_head_size(mut self, max: usize) -> Builder {
        self.max_head_size = max;
        self
    }

    /// Caps the outstanding response bytes buffered per connection before
    /// sends report `Pending`.
    pub fn max_write_buf(mut self, max: usize) -> Builder {
        self.max_write_buf = max;
        self
    }

    /// Consumes the builder, wiring `app` as the gateway entry point.
    pub fn serve<F, Fut>(self, app: F) -> Server
    where
        F: Fn(Scope, ReceiveHandle, SendHandle) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let app: App = Rc::new(move |scope, receive, send| Box::pin(app(scope, receive, send)));
        Server {
            inner: Rc::new(Inner {
                exec: self.exec,
                app,
                listen_on: self.listen_on,
                backlog: self.backlog,
                keep_alive: self.keep_alive,
                keep_alive_interval: self.keep_alive_interval,
                idle_max: self.idle_max,
                debug: self.debug,
                max_head_size: self.max_head_size,
                max_write_buf: self.max_write_buf,
                listeners: RefCell::new(Vec::new()),
                conns: RefCell::new(HashMap::new()),
                waiter: Waiter::new(),
                running: Cell::new(false),
            }),
        }
    }
}

impl Server {
    /// Binds every listen endpoint, registers them for accept readiness and
    /// arms the periodic sweeps.
    pub fn start(&self) -> crate::Result<()> {
        if self.inner.running.get() {
            return Ok(());
        }
        for addr in &self.inner.listen_on {
            let listener = Listener::bind(addr, self.inner.backlog)?;
            let fd = listener.fd();
            let index = self.inner.listeners.borrow().len();
            self.inner.listeners.borrow_mut().push(listener);
            let weak = Rc::downgrade(&self.inner);
            self.inner.exec.add_reader(
                fd,
                Rc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        Server { inner }.poll_accept(index);
                    }
                }),
            );
        }
        self.inner.running.set(true);
        self.spawn_keep_alive_sweep();
        if self.inner.idle_max.is_some() {
            self.spawn_idle_max_sweep();
        }
        Ok(())
    }

    /// The addresses actually bound (useful with OS-assigned ports).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .listeners
            .borrow()
            .iter()
            .map(|listener| listener.local_addr())
            .collect()
    }

    /// Live connection count.
    pub fn client_count(&self) -> usize {
        self.inner.conns.borrow().len()
    }

    /// Stops accepting, closes the listeners and every idle connection, and
    /// releases `run_forever`. In-flight requests are left to finish; their
    /// sends fail with a closed error if their connection went away.
    pub fn shutdown(&self) {
        if !self.inner.running.replace(false) {
            return;
        }
        debug!("server shutting down");
        for listener in self.inner.listeners.borrow_mut().drain(..) {
            self.inner.exec.remove_reader(listener.fd());
        }
        let idle: Vec<Connection> = self
            .inner
            .conns
            .borrow()
            .values()
            .filter(|conn| conn.is_idle())
            .cloned()
            .collect();
        for conn in idle {
            conn.close();
        }
        self.inner.waiter.stop();
    }

    /// Resolves when [`shutdown`](Server::shutdown) is called.
    pub fn run_forever(&self) -> Wait {
        self.inner.waiter.wait()
    }

    fn poll_accept(&self, index: usize) {
        let accepted = {
            let listeners = self.inner.listeners.borrow();
            match listeners.get(index) {
                Some(listener) => listener.poll_accept(self.inner.backlog as usize),
                None => return,
            }
        };
        for (stream, peer) in accepted {
            let weak = Rc::downgrade(&self.inner);
            let on_close = Rc::new(move |fd: RawFd| {
                if let Some(inner) = weak.upgrade() {
                    inner.conns.borrow_mut().remove(&fd);
                }
            });
            let conn = match Connection::new(
                stream,
                self.inner.exec.clone(),
                self.inner.app.clone(),
                on_close,
                self.inner.max_head_size,
                self.inner.max_write_buf,
            ) {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("connection from {} failed to set up: {}", peer, e);
                    continue;
                }
            };
            self.inner.conns.borrow_mut().insert(conn.fd(), conn.clone());
            conn.register();
        }
    }

    fn spawn_keep_alive_sweep(&self) {
        let weak = Rc::downgrade(&self.inner);
        let exec = self.inner.exec.clone();
        let interval = self.inner.keep_alive_interval;
        self.inner.exec.spawn(Box::pin(async move {
            loop {
                exec.sleep(interval).await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                if !inner.running.get() {
                    return;
                }
                Server { inner }.sweep_keep_alive();
            }
        }));
    }

    fn spawn_idle_max_sweep(&self) {
        let idle_max = match self.inner.idle_max {
            Some(idle_max) => idle_max,
            None => return,
        };
        let weak = Rc::downgrade(&self.inner);
        let exec = self.inner.exec.clone();
        let interval = self.inner.keep_alive_interval;
        self.inner.exec.spawn(Box::pin(async move {
            loop {
                exec.sleep(interval).await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                if !inner.running.get() {
                    return;
                }
                Server { inner }.sweep_idle_max(idle_max);
            }
        }));
    }

    /// Closes idle connections whose inactivity exceeded the keep-alive
    /// budget.
    fn sweep_keep_alive(&self) {
        let now = Instant::now();
        let expired: Vec<Connection> = self
            .inner
            .conns
            .borrow()
            .values()
            .filter(|conn| {
                conn.is_idle()
                    && now.duration_since(conn.last_activity()) > self.inner.keep_alive
            })
            .cloned()
            .collect();
        for conn in expired {
            trace!("keep-alive expired for connection {}", conn.fd());
            conn.close();
        }
        if self.inner.debug {
            debug!("active clients: {}", self.inner.conns.borrow().len());
        }
    }

    /// Closes connections in any state whose total inactivity exceeded
    /// `idle_max`. This is the slowloris defense.
    fn sweep_idle_max(&self, idle_max: Duration) {
        let now = Instant::now();
        let expired: Vec<Connection> = self
            .inner
            .conns
            .borrow()
            .values()
            .filter(|conn| now.duration_since(conn.last_activity()) > idle_max)
            .cloned()
            .collect();
        for conn in expired {
            debug!("idle-max expired for connection {}", conn.fd());
            conn.close();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen_on", &self.inner.listen_on)
            .field("running", &self.inner.running.get())
            .field("clients", &self.client_count())
            .finish()
    }
}

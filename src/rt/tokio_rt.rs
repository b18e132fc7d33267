use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use futures_core::future::LocalBoxFuture;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use super::{Executor, ReadyFn};

/// Binding for tokio current-thread runtimes.
///
/// Tokio has no raw file-descriptor callback API, so readiness callbacks are
/// emulated with one watcher task per file descriptor that loops awaiting
/// [`AsyncFd`] readiness and invokes the registered callbacks. Adding or
/// removing a direction respawns the watcher with the new interest set;
/// removing the last one stops it. All tasks go onto the ambient
/// [`LocalSet`], which the caller is expected to be running inside.
///
/// [`LocalSet`]: tokio::task::LocalSet
#[derive(Clone, Default)]
pub struct TokioExecutor {
    fds: Rc<RefCell<HashMap<RawFd, FdState>>>,
}

impl std::fmt::Debug for TokioExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioExecutor")
            .field("watched_fds", &self.fds.borrow().len())
            .finish()
    }
}

struct FdState {
    cbs: Rc<RefCell<Callbacks>>,
    watcher: JoinHandle<()>,
}

#[derive(Default)]
struct Callbacks {
    read: Option<ReadyFn>,
    write: Option<ReadyFn>,
}

impl Callbacks {
    fn interest(&self) -> Option<Interest> {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// `AsyncFd` needs an owner type; the fd itself stays owned by the caller.
struct Watched(RawFd);

impl AsRawFd for Watched {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl TokioExecutor {
    pub fn new() -> TokioExecutor {
        TokioExecutor::default()
    }

    fn update(&self, fd: RawFd, f: impl FnOnce(&mut Callbacks)) {
        let mut fds = self.fds.borrow_mut();
        let cbs = match fds.remove(&fd) {
            Some(state) => {
                state.watcher.abort();
                state.cbs
            }
            None => Rc::new(RefCell::new(Callbacks::default())),
        };
        f(&mut cbs.borrow_mut());
        let interest = match cbs.borrow().interest() {
            Some(interest) => interest,
            None => return,
        };
        let watcher = tokio::task::spawn_local(watch(fd, interest, cbs.clone()));
        fds.insert(fd, FdState { cbs, watcher });
    }
}

async fn watch(fd: RawFd, interest: Interest, cbs: Rc<RefCell<Callbacks>>) {
    let afd = match AsyncFd::with_interest(Watched(fd), interest) {
        Ok(afd) => afd,
        Err(e) => {
            warn!("fd {} could not be watched: {}", fd, e);
            return;
        }
    };
    loop {
        match afd.ready(interest).await {
            Ok(mut guard) => {
                let ready = guard.ready();
                // The callback drains the fd itself; clear before invoking
                // so a new readiness edge is not lost.
                guard.clear_ready();
                if ready.is_readable() {
                    let cb = cbs.borrow().read.clone();
                    if let Some(cb) = cb {
                        cb();
                    }
                }
                if ready.is_writable() {
                    let cb = cbs.borrow().write.clone();
                    if let Some(cb) = cb {
                        cb();
                    }
                }
            }
            Err(e) => {
                trace!("fd {} watcher stopping: {}", fd, e);
                return;
            }
        }
    }
}

impl Executor for TokioExecutor {
    fn spawn(&self, fut: LocalBoxFuture<'static, ()>) {
        tokio::task::spawn_local(fut);
    }

    fn add_reader(&self, fd: RawFd, cb: ReadyFn) {
        self.update(fd, move |cbs| cbs.read = Some(cb));
    }

    fn remove_reader(&self, fd: RawFd) {
        self.update(fd, |cbs| cbs.read = None);
    }

    fn add_writer(&self, fd: RawFd, cb: ReadyFn) {
        self.update(fd, move |cbs| cbs.write = Some(cb));
    }

    fn remove_writer(&self, fd: RawFd) {
        self.update(fd, |cbs| cbs.write = None);
    }

    fn sleep(&self, dur: Duration) -> LocalBoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(dur))
    }
}

//! Runtime abstraction.
//!
//! The connection engine never talks to an event loop directly. Everything it
//! needs is behind the [`Executor`] trait: spawning cooperative tasks,
//! registering file-descriptor readiness callbacks, sleeping, and creating
//! [`Waiter`]s. Two bindings ship with the crate:
//!
//! - [`EventLoop`], a mio-driven single-threaded loop with native readiness
//!   callbacks;
//! - [`TokioExecutor`], for tokio current-thread runtimes, where readiness
//!   callbacks are emulated by one watcher task per file descriptor.
//!
//! The engine assumes a single-threaded cooperative scheduler: callbacks run
//! to completion between suspension points, so connection-local state needs
//! no locking.

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use futures_core::future::LocalBoxFuture;

mod event_loop;
mod tokio_rt;
mod waiter;

pub use self::event_loop::EventLoop;
pub use self::tokio_rt::TokioExecutor;
pub use self::waiter::{Wait, Waiter};

/// A readiness callback. It is invoked on every readiness tick of its file
/// descriptor until the registration is removed.
pub type ReadyFn = Rc<dyn Fn()>;

/// A cooperative, single-threaded event loop the engine can be driven by.
pub trait Executor {
    /// Schedules a new cooperative task.
    fn spawn(&self, fut: LocalBoxFuture<'static, ()>);

    /// Invokes `cb` whenever `fd` is read-ready, until [`remove_reader`].
    ///
    /// Replaces any previous reader registration for the same descriptor.
    ///
    /// [`remove_reader`]: Executor::remove_reader
    fn add_reader(&self, fd: RawFd, cb: ReadyFn);

    /// Stops read-readiness callbacks for `fd`.
    fn remove_reader(&self, fd: RawFd);

    /// Invokes `cb` whenever `fd` is write-ready, until [`remove_writer`].
    ///
    /// [`remove_writer`]: Executor::remove_writer
    fn add_writer(&self, fd: RawFd, cb: ReadyFn);

    /// Stops write-readiness callbacks for `fd`.
    fn remove_writer(&self, fd: RawFd);

    /// Produces a one-shot completion signal usable with this executor.
    fn create_waiter(&self) -> Waiter {
        Waiter::new()
    }

    /// Suspends only the calling task for `dur`.
    fn sleep(&self, dur: Duration) -> LocalBoxFuture<'static, ()>;
}

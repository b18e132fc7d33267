use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// A one-shot completion signal.
///
/// Any number of tasks may `wait().await` on the same waiter; all of them
/// release once `stop()` is called. Stopping is idempotent and `is_done()`
/// observes the state without suspending.
#[derive(Clone, Default)]
pub struct Waiter {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Default)]
struct Inner {
    done: bool,
    wakers: Vec<Waker>,
}

impl Waiter {
    pub fn new() -> Waiter {
        Waiter::default()
    }

    /// Suspends until `stop()` is called. Resolves immediately if it already was.
    pub fn wait(&self) -> Wait {
        Wait {
            inner: self.inner.clone(),
        }
    }

    /// Releases every pending and future `wait()`.
    pub fn stop(&self) {
        let wakers = {
            let mut inner = self.inner.borrow_mut();
            if inner.done {
                return;
            }
            inner.done = true;
            std::mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.borrow().done
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Future returned by [`Waiter::wait`].
pub struct Wait {
    inner: Rc<RefCell<Inner>>,
}

impl std::fmt::Debug for Wait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wait")
            .field("done", &self.inner.borrow().done)
            .finish()
    }
}

impl Future for Wait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.done {
            return Poll::Ready(());
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::Waiter;
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn noop_context(f: impl FnOnce(&mut Context<'_>)) {
        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        f(&mut cx);
    }

    #[test]
    fn stop_releases_wait() {
        let waiter = Waiter::new();
        let mut wait = waiter.wait();
        noop_context(|cx| {
            assert_eq!(Pin::new(&mut wait).poll(cx), Poll::Pending);
            waiter.stop();
            assert_eq!(Pin::new(&mut wait).poll(cx), Poll::Ready(()));
        });
    }

    #[test]
    fn stop_is_idempotent() {
        let waiter = Waiter::new();
        waiter.stop();
        waiter.stop();
        assert!(waiter.is_done());
    }

    #[test]
    fn multiple_waits_release_together() {
        let waiter = Waiter::new();
        let mut a = waiter.wait();
        let mut b = waiter.wait();
        noop_context(|cx| {
            assert_eq!(Pin::new(&mut a).poll(cx), Poll::Pending);
            assert_eq!(Pin::new(&mut b).poll(cx), Poll::Pending);
            waiter.stop();
            assert_eq!(Pin::new(&mut a).poll(cx), Poll::Ready(()));
            assert_eq!(Pin::new(&mut b).poll(cx), Poll::Ready(()));
        });
    }

    #[test]
    fn wait_after_stop_is_immediate() {
        let waiter = Waiter::new();
        waiter.stop();
        let mut wait = waiter.wait();
        noop_context(|cx| {
            assert_eq!(Pin::new(&mut wait).poll(cx), Poll::Ready(()));
        });
    }
}

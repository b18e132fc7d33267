use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use futures_core::future::LocalBoxFuture;
use mio::unix::SourceFd;
use mio::{Events, Interest, Token};
use tracing::{trace, warn};

use super::{Executor, ReadyFn};

const WAKE_TOKEN: Token = Token(usize::MAX);
const ROOT_TASK: usize = usize::MAX - 1;

/// A single-threaded, mio-driven event loop.
///
/// This is the general readiness-registration binding of the [`Executor`]
/// contract: file descriptors are registered with the OS poller directly and
/// their callbacks run inside the loop's dispatch tick. The loop also hosts
/// an arena of local tasks so that `spawn` and `sleep` work without any
/// outside runtime.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("tasks", &self.inner.tasks.borrow().len())
            .field("readers", &self.inner.readers.borrow().len())
            .field("writers", &self.inner.writers.borrow().len())
            .finish()
    }
}

struct Inner {
    poll: RefCell<mio::Poll>,
    registered: RefCell<HashSet<RawFd>>,
    readers: RefCell<HashMap<RawFd, ReadyFn>>,
    writers: RefCell<HashMap<RawFd, ReadyFn>>,
    tasks: RefCell<HashMap<usize, LocalBoxFuture<'static, ()>>>,
    next_task: Cell<usize>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    shared: Arc<Shared>,
}

/// The cross-thread part of the loop: wakers may fire from any context.
struct Shared {
    ready: Mutex<VecDeque<usize>>,
    waker: mio::Waker,
}

struct TaskWaker {
    id: usize,
    shared: Arc<Shared>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.shared.ready.lock().unwrap().push_back(self.id);
        // A failed wake only delays the loop until its next poll timeout.
        let _ = self.shared.waker.wake();
    }
}

struct TimerEntry {
    deadline: Instant,
    waker: Waker,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the nearest deadline pops first.
        other.deadline.cmp(&self.deadline)
    }
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(EventLoop {
            inner: Rc::new(Inner {
                poll: RefCell::new(poll),
                registered: RefCell::new(HashSet::new()),
                readers: RefCell::new(HashMap::new()),
                writers: RefCell::new(HashMap::new()),
                tasks: RefCell::new(HashMap::new()),
                next_task: Cell::new(0),
                timers: RefCell::new(BinaryHeap::new()),
                shared: Arc::new(Shared {
                    ready: Mutex::new(VecDeque::new()),
                    waker,
                }),
            }),
        })
    }

    /// Runs the loop until `fut` completes, returning its output.
    ///
    /// Spawned tasks, readiness callbacks and timers are all driven while the
    /// root future is pending.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        let mut root = Box::pin(fut);
        let root_waker = Waker::from(Arc::new(TaskWaker {
            id: ROOT_TASK,
            shared: self.inner.shared.clone(),
        }));
        self.inner.shared.ready.lock().unwrap().push_back(ROOT_TASK);

        let mut events = Events::with_capacity(256);
        loop {
            // 1. Run every task that was woken since the last tick.
            loop {
                let id = match self.inner.shared.ready.lock().unwrap().pop_front() {
                    Some(id) => id,
                    None => break,
                };
                if id == ROOT_TASK {
                    let mut cx = Context::from_waker(&root_waker);
                    if let Poll::Ready(out) = root.as_mut().poll(&mut cx) {
                        return out;
                    }
                } else {
                    self.poll_task(id);
                }
            }

            // 2. Fire expired timers.
            let now = Instant::now();
            loop {
                let due = {
                    let mut timers = self.inner.timers.borrow_mut();
                    match timers.peek() {
                        Some(entry) if entry.deadline <= now => timers.pop(),
                        _ => None,
                    }
                };
                match due {
                    Some(entry) => entry.waker.wake(),
                    None => break,
                }
            }

            // 3. Wait for IO, the next timer, or a wake.
            let timeout = if self.inner.shared.ready.lock().unwrap().is_empty() {
                self.inner
                    .timers
                    .borrow()
                    .peek()
                    .map(|entry| entry.deadline.saturating_duration_since(now))
            } else {
                Some(Duration::from_millis(0))
            };
            let poll_result = self.inner.poll.borrow_mut().poll(&mut events, timeout);
            if let Err(e) = poll_result {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("event loop poll error: {}", e);
            }

            // 4. Dispatch readiness callbacks, without holding any borrow.
            let mut pending = Vec::new();
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let fd = event.token().0 as RawFd;
                pending.push((fd, event.is_readable(), event.is_writable()));
            }
            for (fd, readable, writable) in pending {
                if readable {
                    let cb = self.inner.readers.borrow().get(&fd).cloned();
                    if let Some(cb) = cb {
                        cb();
                    }
                }
                if writable {
                    let cb = self.inner.writers.borrow().get(&fd).cloned();
                    if let Some(cb) = cb {
                        cb();
                    }
                }
            }
        }
    }

    fn poll_task(&self, id: usize) {
        // Take the future out of the arena while polling it, so the poll can
        // spawn, register and remove without re-entrant borrows.
        let fut = self.inner.tasks.borrow_mut().remove(&id);
        if let Some(mut fut) = fut {
            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                shared: self.inner.shared.clone(),
            }));
            let mut cx = Context::from_waker(&waker);
            if fut.as_mut().poll(&mut cx).is_pending() {
                self.inner.tasks.borrow_mut().insert(id, fut);
            } else {
                trace!("task {} finished", id);
            }
        }
    }

    fn update_registration(&self, fd: RawFd) {
        let interest = {
            let r = self.inner.readers.borrow().contains_key(&fd);
            let w = self.inner.writers.borrow().contains_key(&fd);
            match (r, w) {
                (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                (true, false) => Some(Interest::READABLE),
                (false, true) => Some(Interest::WRITABLE),
                (false, false) => None,
            }
        };
        let poll = self.inner.poll.borrow();
        let registry = poll.registry();
        let mut registered = self.inner.registered.borrow_mut();
        let result = match interest {
            Some(interest) => {
                if registered.contains(&fd) {
                    registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
                } else {
                    registered.insert(fd);
                    registry.register(&mut SourceFd(&fd), Token(fd as usize), interest)
                }
            }
            None => {
                if registered.remove(&fd) {
                    registry.deregister(&mut SourceFd(&fd))
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = result {
            warn!("fd {} registration update failed: {}", fd, e);
        }
    }
}

impl Executor for EventLoop {
    fn spawn(&self, fut: LocalBoxFuture<'static, ()>) {
        let id = self.inner.next_task.get();
        self.inner.next_task.set(id + 1);
        self.inner.tasks.borrow_mut().insert(id, fut);
        self.inner.shared.ready.lock().unwrap().push_back(id);
        let _ = self.inner.shared.waker.wake();
    }

    fn add_reader(&self, fd: RawFd, cb: ReadyFn) {
        self.inner.readers.borrow_mut().insert(fd, cb);
        self.update_registration(fd);
    }

    fn remove_reader(&self, fd: RawFd) {
        if self.inner.readers.borrow_mut().remove(&fd).is_some() {
            self.update_registration(fd);
        }
    }

    fn add_writer(&self, fd: RawFd, cb: ReadyFn) {
        self.inner.writers.borrow_mut().insert(fd, cb);
        self.update_registration(fd);
    }

    fn remove_writer(&self, fd: RawFd) {
        if self.inner.writers.borrow_mut().remove(&fd).is_some() {
            self.update_registration(fd);
        }
    }

    fn sleep(&self, dur: Duration) -> LocalBoxFuture<'static, ()> {
        let timers = SleepHandle {
            inner: self.inner.clone(),
        };
        let deadline = Instant::now() + dur;
        Box::pin(Sleep { deadline, timers })
    }
}

struct SleepHandle {
    inner: Rc<Inner>,
}

struct Sleep {
    deadline: Instant,
    timers: SleepHandle,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.deadline {
            return Poll::Ready(());
        }
        self.timers.inner.timers.borrow_mut().push(TimerEntry {
            deadline: self.deadline,
            waker: cx.waker().clone(),
        });
        Poll::Pending
    }
}

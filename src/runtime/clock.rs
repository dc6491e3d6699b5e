//! Monotonic clock capability.
//!
//! Production wires in [`SystemClock`]; tests use [`VirtualClock`], which
//! only moves when told to and wakes due sleepers deterministically. All
//! timers in the engine (rotation, idle, backoff, deadlines) go through
//! this trait, so a test can fast-forward a ten-minute circuit lifetime in
//! one call.

use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::rc::Rc;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

/// Millisecond clock with async sleep.
pub trait Clock {
    /// Milliseconds since the Unix epoch. Document validity windows and
    /// certificate expirations compare against this directly; virtual
    /// clocks can seed any origin they like.
    fn now_ms(&self) -> u64;

    /// Resolve once `now_ms() >= deadline_ms`.
    fn sleep_until(&self, deadline_ms: u64) -> LocalBoxFuture<'static, ()>;

    /// Resolve after `ms` milliseconds.
    fn sleep_ms(&self, ms: u64) -> LocalBoxFuture<'static, ()> {
        self.sleep_until(self.now_ms().saturating_add(ms))
    }
}

pub type SharedClock = Rc<dyn Clock>;

/// Wall clock anchored to the Unix epoch, kept monotonic by pinning the
/// epoch offset at construction and measuring elapsed time with
/// `std::time::Instant`.
///
/// Each sleep parks a helper thread; the engine itself stays on its one
/// scheduler thread.
pub struct SystemClock {
    origin: Instant,
    epoch_offset_ms: u64,
}

impl SystemClock {
    pub fn new() -> Self {
        let epoch_offset_ms = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            origin: Instant::now(),
            epoch_offset_ms,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch_offset_ms + self.origin.elapsed().as_millis() as u64
    }

    fn sleep_until(&self, deadline_ms: u64) -> LocalBoxFuture<'static, ()> {
        let remaining = deadline_ms.saturating_sub(self.now_ms());
        Box::pin(ThreadSleep::new(Duration::from_millis(remaining)))
    }
}

/// Sleep future that fires a waker from a detached timer thread.
struct ThreadSleep {
    duration: Duration,
    state: std::sync::Arc<std::sync::Mutex<ThreadSleepState>>,
    started: bool,
}

#[derive(Default)]
struct ThreadSleepState {
    done: bool,
    waker: Option<Waker>,
}

impl ThreadSleep {
    fn new(duration: Duration) -> Self {
        Self {
            duration,
            state: Default::default(),
            started: false,
        }
    }
}

impl std::future::Future for ThreadSleep {
    type Output = ();

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<()> {
        if self.duration.is_zero() {
            return Poll::Ready(());
        }
        let mut state = self.state.lock().expect("timer state poisoned");
        if state.done {
            return Poll::Ready(());
        }
        state.waker = Some(cx.waker().clone());
        drop(state);

        if !self.started {
            self.started = true;
            let duration = self.duration;
            let shared = std::sync::Arc::clone(&self.state);
            std::thread::spawn(move || {
                std::thread::sleep(duration);
                let mut state = shared.lock().expect("timer state poisoned");
                state.done = true;
                if let Some(waker) = state.waker.take() {
                    waker.wake();
                }
            });
        }
        Poll::Pending
    }
}

/// Deterministic clock for tests: time moves only via [`VirtualClock::advance`].
#[derive(Clone)]
pub struct VirtualClock {
    inner: Rc<RefCell<VirtualInner>>,
}

struct VirtualInner {
    now_ms: u64,
    sleepers: Vec<Rc<RefCell<SleepEntry>>>,
}

struct SleepEntry {
    deadline_ms: u64,
    done: bool,
    waker: Option<Waker>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::at(0)
    }

    /// Start the clock at a given millisecond value, e.g. a realistic
    /// wall-time for consensus validity tests.
    pub fn at(now_ms: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(VirtualInner {
                now_ms,
                sleepers: Vec::new(),
            })),
        }
    }

    /// Move time forward and wake every sleeper whose deadline has passed.
    pub fn advance(&self, ms: u64) {
        let woken: Vec<Rc<RefCell<SleepEntry>>> = {
            let mut inner = self.inner.borrow_mut();
            inner.now_ms += ms;
            let now = inner.now_ms;
            let (due, rest): (Vec<_>, Vec<_>) = inner
                .sleepers
                .drain(..)
                .partition(|entry| entry.borrow().deadline_ms <= now);
            inner.sleepers = rest;
            due
        };
        for entry in woken {
            let mut entry = entry.borrow_mut();
            entry.done = true;
            if let Some(waker) = entry.waker.take() {
                waker.wake();
            }
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.inner.borrow().now_ms
    }

    fn sleep_until(&self, deadline_ms: u64) -> LocalBoxFuture<'static, ()> {
        let entry = Rc::new(RefCell::new(SleepEntry {
            deadline_ms,
            done: self.inner.borrow().now_ms >= deadline_ms,
            waker: None,
        }));
        if !entry.borrow().done {
            self.inner.borrow_mut().sleepers.push(Rc::clone(&entry));
        }
        Box::pin(VirtualSleep { entry })
    }
}

struct VirtualSleep {
    entry: Rc<RefCell<SleepEntry>>,
}

impl std::future::Future for VirtualSleep {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<()> {
        let mut entry = self.entry.borrow_mut();
        if entry.done {
            Poll::Ready(())
        } else {
            entry.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

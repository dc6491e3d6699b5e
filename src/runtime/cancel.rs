//! Cooperative cancellation tokens.
//!
//! Every long-running operation accepts a token; cancelling it fails the
//! awaiting operation with `Cancelled` and lets scoped cleanup run. Child
//! tokens cancel with their parent but can also be cancelled alone, which
//! is how per-attempt timeouts nest inside a per-request token.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::task::{Poll, Waker};

#[derive(Clone)]
pub struct CancelToken {
    inner: Rc<RefCell<CancelInner>>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: bool,
    wakers: Vec<Waker>,
    children: Vec<Weak<RefCell<CancelInner>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(CancelInner::default())),
        }
    }

    /// A token that cancels when `self` cancels, without the reverse.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let mut inner = self.inner.borrow_mut();
        if inner.cancelled {
            child.cancel();
        } else {
            inner.children.push(Rc::downgrade(&child.inner));
        }
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.borrow().cancelled
    }

    pub fn cancel(&self) {
        let (wakers, children) = {
            let mut inner = self.inner.borrow_mut();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            (
                std::mem::take(&mut inner.wakers),
                std::mem::take(&mut inner.children),
            )
        };
        for waker in wakers {
            waker.wake();
        }
        for child in children {
            if let Some(child) = child.upgrade() {
                CancelToken { inner: child }.cancel();
            }
        }
    }

    /// Future resolving when the token is cancelled.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Cancelled {
    inner: Rc<RefCell<CancelInner>>,
}

impl std::future::Future for Cancelled {
    type Output = ();

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.cancelled {
            Poll::Ready(())
        } else {
            inner.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

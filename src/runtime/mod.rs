//! Injected runtime capabilities.
//!
//! The engine is single-threaded cooperative: all state mutation happens on
//! one logical task scheduler, and I/O plus the clock are the only
//! suspension points. Time, task spawning, and cancellation are
//! capabilities handed in at construction so tests can drive everything
//! deterministically.

mod cancel;
mod clock;
mod spawn;

pub use cancel::CancelToken;
pub use clock::{Clock, SharedClock, SystemClock, VirtualClock};
pub use spawn::{SharedSpawner, Spawner};

use crate::error::{Result, TorError};
use futures::future::FutureExt;

/// Race `fut` against cancellation and a deadline on `clock`.
///
/// Timeouts are expressed as cancellation after a deadline: the loser is
/// dropped, which closes whatever resources it held.
pub async fn with_deadline<T>(
    clock: &SharedClock,
    cancel: &CancelToken,
    deadline_ms: u64,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    let mut fut = std::pin::pin!(fut.fuse());
    let mut cancelled = std::pin::pin!(cancel.cancelled().fuse());
    let mut sleep = std::pin::pin!(clock.sleep_until(deadline_ms).fuse());
    futures::select_biased! {
        _ = cancelled => Err(TorError::Cancelled),
        _ = sleep => Err(TorError::Timeout),
        out = fut => out,
    }
}

/// Race `fut` against cancellation only.
pub async fn with_cancel<T>(
    cancel: &CancelToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    let mut fut = std::pin::pin!(fut.fuse());
    let mut cancelled = std::pin::pin!(cancel.cancelled().fuse());
    futures::select_biased! {
        _ = cancelled => Err(TorError::Cancelled),
        out = fut => out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::LocalPool;
    use std::rc::Rc;

    #[test]
    fn deadline_fires_on_virtual_clock() {
        use futures::task::LocalSpawnExt;
        use std::cell::RefCell;

        let clock = VirtualClock::new();
        let shared: SharedClock = Rc::new(clock.clone());
        let cancel = CancelToken::new();

        let mut pool = LocalPool::new();
        let out: Rc<RefCell<Option<Result<()>>>> = Rc::new(RefCell::new(None));
        let out2 = Rc::clone(&out);
        pool.spawner()
            .spawn_local(async move {
                let res =
                    with_deadline(&shared, &cancel, 1_000, futures::future::pending()).await;
                *out2.borrow_mut() = Some(res);
            })
            .unwrap();

        pool.run_until_stalled();
        assert!(out.borrow().is_none());

        clock.advance(1_000);
        pool.run_until_stalled();
        assert!(matches!(*out.borrow(), Some(Err(TorError::Timeout))));
    }

    #[test]
    fn cancel_beats_deadline() {
        let clock = VirtualClock::new();
        let shared: SharedClock = Rc::new(clock.clone());
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut pool = LocalPool::new();
        let out = pool.run_until(with_deadline(
            &shared,
            &cancel,
            1_000,
            futures::future::pending::<Result<()>>(),
        ));
        assert!(matches!(out, Err(TorError::Cancelled)));
    }
}

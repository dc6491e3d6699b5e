//! Background task spawning capability.
//!
//! The channel cell reader, circuit pumps, warm builds, and lifecycle
//! timers all run as background tasks on whatever local executor the
//! embedder provides.

use futures::future::LocalBoxFuture;
use std::rc::Rc;

/// Spawns non-Send futures onto the embedder's single-threaded executor.
pub trait Spawner {
    fn spawn(&self, fut: LocalBoxFuture<'static, ()>);
}

pub type SharedSpawner = Rc<dyn Spawner>;

impl Spawner for futures::executor::LocalSpawner {
    fn spawn(&self, fut: LocalBoxFuture<'static, ()>) {
        use futures::task::LocalSpawnExt;
        if let Err(e) = self.spawn_local(fut) {
            log::warn!("spawn on shut-down executor dropped: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn local_pool_spawner_runs_tasks() {
        let mut pool = futures::executor::LocalPool::new();
        let spawner: SharedSpawner = Rc::new(pool.spawner());
        let ran = Rc::new(Cell::new(false));
        let ran2 = Rc::clone(&ran);
        spawner.spawn(Box::pin(async move {
            ran2.set(true);
        }));
        pool.run_until_stalled();
        assert!(ran.get());
    }
}

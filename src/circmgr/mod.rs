//! Circuit lifecycle management.
//!
//! The manager owns every circuit: a FIFO buffer of warm spares, a
//! host→circuit binding map, per-circuit rotation and idle timers, and
//! the exponential backoff that paces rebuilding after failures. All of
//! its state lives behind one `RefCell` mutated only between awaits, so
//! concurrent requests interleave without ever observing a half-updated
//! pool; callers get circuits out, never references in.
//!
//! Rebinding happens only at request boundaries: a rotation disposes a
//! bound circuit exactly at end-of-life and moves the binding to a warm
//! replacement, while requests already running on the old circuit finish
//! there.

pub mod backoff;
pub mod build;
pub mod path;

pub use build::CircuitBuilder;

use async_trait::async_trait;
use futures::channel::oneshot;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::error::{Result, TorError};
use crate::protocol::Circuit;
use crate::runtime::{with_cancel, CancelToken, SharedClock, SharedSpawner};

use backoff::Backoff;

/// Where the manager gets circuits from; production uses
/// [`CircuitBuilder`], tests script it.
#[async_trait(?Send)]
pub trait CircuitSource {
    async fn build_circuit(&self, cancel: &CancelToken) -> Result<Circuit>;
}

#[async_trait(?Send)]
impl CircuitSource for CircuitBuilder {
    async fn build_circuit(&self, cancel: &CancelToken) -> Result<Circuit> {
        self.build(cancel).await
    }
}

/// Manager tuning knobs, lifted from the client config.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub circuit_buffer: usize,
    pub max_circuit_lifetime_ms: u64,
    pub rotation_grace_ms: u64,
    pub idle_timeout_ms: u64,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
}

impl From<&crate::config::TorClientConfig> for ManagerConfig {
    fn from(config: &crate::config::TorClientConfig) -> Self {
        Self {
            circuit_buffer: config.circuit_buffer,
            max_circuit_lifetime_ms: config.max_circuit_lifetime_ms,
            rotation_grace_ms: config.rotation_grace_ms,
            idle_timeout_ms: config.idle_timeout_ms,
            backoff_min_ms: config.backoff_min_ms,
            backoff_max_ms: config.backoff_max_ms,
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

/// Lifecycle state of one managed circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Ready,
    Allocated,
    Disposed,
}

struct CircuitRecord {
    status: CircuitStatus,
    allocated_host: Option<String>,
    allocated_at_ms: u64,
    is_updating: bool,
    last_used_ms: u64,
    created_at_ms: u64,
}

#[derive(Clone)]
struct Managed {
    circuit: Circuit,
    record: Rc<RefCell<CircuitRecord>>,
}

impl Managed {
    fn is_disposed(&self) -> bool {
        self.record.borrow().status == CircuitStatus::Disposed || self.circuit.is_closed()
    }
}

struct ManagerState {
    buffer: VecDeque<Managed>,
    host_map: HashMap<String, Managed>,
    builds_inflight: usize,
    build_waiters: Vec<oneshot::Sender<Result<()>>>,
    backoff: Backoff,
    closed: bool,
}

/// Snapshot for `circuit_state()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagerStatus {
    pub buffered: usize,
    pub bound_hosts: Vec<String>,
    pub builds_inflight: usize,
    pub backoff_delay_ms: u64,
    /// Circuits inside their rotation grace window.
    pub rotating: usize,
}

#[derive(Clone)]
pub struct CircuitManager {
    shared: Rc<ManagerShared>,
}

struct ManagerShared {
    config: ManagerConfig,
    clock: SharedClock,
    spawner: SharedSpawner,
    source: Rc<dyn CircuitSource>,
    cancel: CancelToken,
    state: RefCell<ManagerState>,
}

impl CircuitManager {
    pub fn new(
        config: ManagerConfig,
        clock: SharedClock,
        spawner: SharedSpawner,
        source: Rc<dyn CircuitSource>,
    ) -> Self {
        let backoff = Backoff::new(
            config.backoff_min_ms,
            config.backoff_max_ms,
            config.backoff_multiplier,
        );
        Self {
            shared: Rc::new(ManagerShared {
                config,
                clock,
                spawner,
                source,
                cancel: CancelToken::new(),
                state: RefCell::new(ManagerState {
                    buffer: VecDeque::new(),
                    host_map: HashMap::new(),
                    builds_inflight: 0,
                    build_waiters: Vec::new(),
                    backoff,
                    closed: false,
                }),
            }),
        }
    }

    /// Start warming the pool.
    pub fn start(&self) {
        self.spawn_builds();
    }

    /// Get the circuit bound to `host`, binding a warm spare (or waiting
    /// on a build) if there is none yet.
    pub async fn use_circuit(&self, host: &str, cancel: &CancelToken) -> Result<Circuit> {
        loop {
            let waiter = {
                let mut state = self.shared.state.borrow_mut();
                if state.closed {
                    return Err(TorError::Closed);
                }
                let now = self.shared.clock.now_ms();

                // 1. Existing binding, if its circuit still lives.
                if let Some(managed) = state.host_map.get(host).cloned() {
                    if managed.is_disposed() {
                        state.host_map.remove(host);
                    } else {
                        managed.record.borrow_mut().last_used_ms = now;
                        return Ok(managed.circuit);
                    }
                }

                // 2. Oldest warm spare.
                let mut bound = None;
                while let Some(managed) = state.buffer.pop_front() {
                    if managed.is_disposed() {
                        continue;
                    }
                    bind(&mut state, managed.clone(), host, now);
                    bound = Some(managed.circuit);
                    break;
                }
                if let Some(circuit) = bound {
                    drop(state);
                    // Replace what was just taken.
                    self.spawn_builds();
                    return Ok(circuit);
                }

                // 3. Wait on a build.
                if self.shared.config.circuit_buffer == 0 {
                    return Err(TorError::NoCreationConfigured);
                }
                drop(state);
                self.spawn_builds();
                let mut state = self.shared.state.borrow_mut();
                let (tx, rx) = oneshot::channel();
                state.build_waiters.push(tx);
                rx
            };

            let outcome = with_cancel(cancel, async {
                waiter.await.map_err(|_| TorError::Closed)
            })
            .await?;
            outcome?;
            // A build finished; loop to claim it (another caller may have
            // beaten us to it, in which case we wait again).
        }
    }

    /// Resolve once at least one circuit is buffered (or fail when no
    /// creation can ever happen).
    pub async fn wait_for_circuit_ready(&self, cancel: &CancelToken) -> Result<()> {
        loop {
            let waiter = {
                let mut state = self.shared.state.borrow_mut();
                if state.closed {
                    return Err(TorError::Closed);
                }
                state.buffer.retain(|m| !m.is_disposed());
                if !state.buffer.is_empty() {
                    return Ok(());
                }
                if self.shared.config.circuit_buffer == 0 && state.builds_inflight == 0 {
                    return Err(TorError::NoCreationConfigured);
                }
                drop(state);
                self.spawn_builds();
                let mut state = self.shared.state.borrow_mut();
                let (tx, rx) = oneshot::channel();
                state.build_waiters.push(tx);
                rx
            };
            let outcome = with_cancel(cancel, async {
                waiter.await.map_err(|_| TorError::Closed)
            })
            .await?;
            outcome?;
        }
    }

    /// Unbind `host` and dispose its circuit; other hosts are untouched.
    pub fn clear_circuit(&self, host: &str) {
        let managed = self.shared.state.borrow_mut().host_map.remove(host);
        if let Some(managed) = managed {
            let bound_for = self
                .shared
                .clock
                .now_ms()
                .saturating_sub(managed.record.borrow().allocated_at_ms);
            log::debug!("clearing circuit for {host} (bound for {bound_for}ms)");
            dispose(&managed);
        }
        self.spawn_builds();
    }

    pub fn status(&self) -> ManagerStatus {
        let state = self.shared.state.borrow();
        let rotating = state
            .buffer
            .iter()
            .chain(state.host_map.values())
            .filter(|m| m.record.borrow().is_updating && !m.is_disposed())
            .count();
        ManagerStatus {
            buffered: state.buffer.iter().filter(|m| !m.is_disposed()).count(),
            bound_hosts: state.host_map.keys().cloned().collect(),
            builds_inflight: state.builds_inflight,
            backoff_delay_ms: state
                .backoff
                .delay_remaining_ms(self.shared.clock.now_ms()),
            rotating,
        }
    }

    /// Dispose everything and refuse further work.
    pub fn close(&self) {
        let (buffered, bound) = {
            let mut state = self.shared.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            state.build_waiters.clear();
            (
                state.buffer.drain(..).collect::<Vec<_>>(),
                state.host_map.drain().map(|(_, m)| m).collect::<Vec<_>>(),
            )
        };
        self.shared.cancel.cancel();
        for managed in buffered.into_iter().chain(bound) {
            dispose(&managed);
        }
        log::info!("circuit manager closed");
    }

    /// Launch builds until buffered + in-flight covers the configured
    /// buffer. At most `circuit_buffer` builds run at once.
    fn spawn_builds(&self) {
        let mut state = self.shared.state.borrow_mut();
        if state.closed {
            return;
        }
        let target = self.shared.config.circuit_buffer;
        loop {
            let live = state.buffer.iter().filter(|m| !m.is_disposed()).count();
            if live + state.builds_inflight >= target || state.builds_inflight >= target {
                break;
            }
            state.builds_inflight += 1;
            let manager = self.clone();
            self.shared
                .spawner
                .spawn(Box::pin(async move { manager.run_build(false).await }));
        }
    }

    /// Launch one replacement build outside the buffer target (rotation
    /// keeps continuity by building before disposing).
    fn spawn_replacement(&self) {
        let mut state = self.shared.state.borrow_mut();
        if state.closed {
            return;
        }
        state.builds_inflight += 1;
        let manager = self.clone();
        self.shared
            .spawner
            .spawn(Box::pin(async move { manager.run_build(true).await }));
    }

    async fn run_build(&self, replacement: bool) {
        // Respect the backoff gate before attempting.
        loop {
            let wait = {
                let state = self.shared.state.borrow();
                if state.closed {
                    drop(state);
                    self.finish_build(Err(TorError::Closed));
                    return;
                }
                state.backoff.delay_remaining_ms(self.shared.clock.now_ms())
            };
            if wait == 0 {
                break;
            }
            log::debug!("build gated by backoff for {wait}ms");
            self.shared.clock.sleep_ms(wait).await;
        }

        let cancel = self.shared.cancel.child();
        let result = self.shared.source.build_circuit(&cancel).await;
        match result {
            Ok(circuit) => {
                log::debug!(
                    "build finished: circuit {} ({})",
                    circuit.id(),
                    if replacement { "replacement" } else { "pool" }
                );
                self.adopt(circuit);
                self.finish_build(Ok(()));
            }
            Err(e) => {
                let now = self.shared.clock.now_ms();
                self.shared.state.borrow_mut().backoff.note_failure(now);
                log::warn!("circuit build failed: {e}");
                self.finish_build(Err(e));
                // Keep the pool self-healing; the next attempt waits out
                // the backoff gate.
                self.spawn_builds();
            }
        }
    }

    /// Put a fresh circuit into the buffer and arm its timers.
    fn adopt(&self, circuit: Circuit) {
        let now = self.shared.clock.now_ms();
        let managed = Managed {
            circuit,
            record: Rc::new(RefCell::new(CircuitRecord {
                status: CircuitStatus::Ready,
                allocated_host: None,
                allocated_at_ms: 0,
                is_updating: false,
                last_used_ms: now,
                created_at_ms: now,
            })),
        };
        {
            let mut state = self.shared.state.borrow_mut();
            if state.closed {
                drop(state);
                dispose(&managed);
                return;
            }
            state.backoff.note_success();
            state.buffer.push_back(managed.clone());
        }

        // Exactly one rotation timer and one idle timer per circuit.
        let rotation = self.clone();
        let rotation_managed = managed.clone();
        self.shared
            .spawner
            .spawn(Box::pin(async move { rotation.rotation_timer(rotation_managed).await }));
        let idle = self.clone();
        self.shared
            .spawner
            .spawn(Box::pin(async move { idle.idle_timer(managed).await }));
    }

    fn finish_build(&self, outcome: Result<()>) {
        let waiters = {
            let mut state = self.shared.state.borrow_mut();
            state.builds_inflight = state.builds_inflight.saturating_sub(1);
            std::mem::take(&mut state.build_waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Age-based rotation: at `created + lifetime - grace` mark the
    /// circuit updating and warm a replacement; at `created + lifetime`
    /// dispose it, handing any binding to a warm spare.
    async fn rotation_timer(&self, managed: Managed) {
        let created = managed.record.borrow().created_at_ms;
        let lifetime = self.shared.config.max_circuit_lifetime_ms;
        let grace = self.shared.config.rotation_grace_ms.min(lifetime);

        self.shared.clock.sleep_until(created + lifetime - grace).await;
        if managed.is_disposed() || self.shared.state.borrow().closed {
            return;
        }
        managed.record.borrow_mut().is_updating = true;
        log::debug!(
            "circuit {} entering rotation, warming replacement",
            managed.circuit.id()
        );
        self.spawn_replacement();

        self.shared.clock.sleep_until(created + lifetime).await;
        if managed.is_disposed() {
            return;
        }
        log::debug!("circuit {} reached end of life", managed.circuit.id());
        self.retire(&managed);
    }

    /// Idle-based disposal: an unbound circuit whose `last_used` has not
    /// advanced for `idle_timeout_ms` is dropped.
    async fn idle_timer(&self, managed: Managed) {
        let idle_ms = self.shared.config.idle_timeout_ms;
        loop {
            let last_used = managed.record.borrow().last_used_ms;
            // A bound circuit leaves its stale deadline in the past;
            // re-check a full period from now instead of spinning.
            let target = last_used + idle_ms;
            let now = self.shared.clock.now_ms();
            let deadline = if target > now { target } else { now + idle_ms };
            self.shared.clock.sleep_until(deadline).await;
            if managed.is_disposed() || self.shared.state.borrow().closed {
                return;
            }
            let record = managed.record.borrow();
            let bound = record.allocated_host.is_some();
            let advanced = record.last_used_ms > last_used;
            drop(record);
            if bound || advanced {
                continue;
            }
            log::debug!("circuit {} idle-expired", managed.circuit.id());
            self.retire(&managed);
            return;
        }
    }

    /// Dispose a circuit, moving any host binding to a warm spare.
    fn retire(&self, managed: &Managed) {
        let rebind = {
            let mut state = self.shared.state.borrow_mut();
            state.buffer.retain(|m| !Rc::ptr_eq(&m.record, &managed.record));
            let host = managed.record.borrow_mut().allocated_host.take();
            if let Some(host) = host.clone() {
                state.host_map.remove(&host);
            }
            host
        };
        dispose(managed);

        if let Some(host) = rebind {
            let now = self.shared.clock.now_ms();
            let mut state = self.shared.state.borrow_mut();
            while let Some(next) = state.buffer.pop_front() {
                if next.is_disposed() {
                    continue;
                }
                log::debug!("binding replacement circuit {} to {host}", next.circuit.id());
                bind(&mut state, next, &host, now);
                break;
            }
        }
        self.spawn_builds();
    }
}

fn bind(state: &mut ManagerState, managed: Managed, host: &str, now_ms: u64) {
    {
        let mut record = managed.record.borrow_mut();
        record.status = CircuitStatus::Allocated;
        record.allocated_host = Some(host.to_string());
        record.allocated_at_ms = now_ms;
        record.last_used_ms = now_ms;
    }
    state.host_map.insert(host.to_string(), managed);
}

fn dispose(managed: &Managed) {
    managed.record.borrow_mut().status = CircuitStatus::Disposed;
    managed.circuit.close();
}

#[cfg(test)]
mod tests;

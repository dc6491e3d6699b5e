//! Manager behavior under a virtual clock and a scripted circuit source.

use super::*;
use crate::directory::microdesc::PortPolicy;
use crate::protocol::link::test_support::detached_channel;
use crate::protocol::HopTarget;
use crate::runtime::VirtualClock;
use futures::channel::mpsc;
use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use std::cell::Cell as StdCell;

/// Builds detached circuits on demand, optionally failing first.
struct ScriptedSource {
    clock: SharedClock,
    spawner: SharedSpawner,
    /// Number of initial build attempts that fail.
    fail_first: StdCell<usize>,
    attempts: StdCell<usize>,
    /// Exit port policies handed to successive circuits, oldest first.
    exit_policies: RefCell<VecDeque<PortPolicy>>,
    /// Keeps channel receivers alive so test circuits stay open.
    wires: RefCell<Vec<mpsc::UnboundedReceiver<crate::protocol::Cell>>>,
}

impl ScriptedSource {
    fn new(clock: SharedClock, spawner: SharedSpawner) -> Rc<Self> {
        Rc::new(Self {
            clock,
            spawner,
            fail_first: StdCell::new(0),
            attempts: StdCell::new(0),
            exit_policies: RefCell::new(VecDeque::new()),
            wires: RefCell::new(Vec::new()),
        })
    }
}

#[async_trait(?Send)]
impl CircuitSource for ScriptedSource {
    async fn build_circuit(&self, _cancel: &CancelToken) -> Result<Circuit> {
        self.attempts.set(self.attempts.get() + 1);
        if self.fail_first.get() > 0 {
            self.fail_first.set(self.fail_first.get() - 1);
            return Err(TorError::ExtendFailed("scripted failure".into()));
        }
        let (channel, wire) = detached_channel();
        self.wires.borrow_mut().push(wire);
        let circuit = Circuit::new(channel, self.clock.now_ms(), &self.spawner);
        if let Some(policy) = self.exit_policies.borrow_mut().pop_front() {
            circuit.push_hop_unchecked(HopTarget {
                nickname: "scripted-exit".into(),
                rsa_id: [0xE0; 20],
                ntor_onion_key: [0; 32],
                ed25519_id: None,
                ipv4: "198.51.100.1".parse().unwrap(),
                or_port: 9001,
                port_policy: Some(policy),
            });
        }
        Ok(circuit)
    }
}

struct Fixture {
    pool: LocalPool,
    clock: Rc<VirtualClock>,
    manager: CircuitManager,
    source: Rc<ScriptedSource>,
}

fn fixture(config: ManagerConfig) -> Fixture {
    let pool = LocalPool::new();
    let clock = Rc::new(VirtualClock::at(1_000_000));
    let spawner: SharedSpawner = Rc::new(pool.spawner());
    let source = ScriptedSource::new(Rc::clone(&clock) as SharedClock, Rc::clone(&spawner));
    let manager = CircuitManager::new(
        config,
        Rc::clone(&clock) as SharedClock,
        spawner,
        Rc::clone(&source) as Rc<dyn CircuitSource>,
    );
    Fixture {
        pool,
        clock,
        manager,
        source,
    }
}

fn config(buffer: usize) -> ManagerConfig {
    ManagerConfig {
        circuit_buffer: buffer,
        max_circuit_lifetime_ms: 600_000,
        rotation_grace_ms: 60_000,
        idle_timeout_ms: 300_000,
        backoff_min_ms: 5_000,
        backoff_max_ms: 60_000,
        backoff_multiplier: 1.1,
    }
}

/// Run `use_circuit` to completion on the pool.
fn use_circuit(fx: &mut Fixture, host: &str) -> Result<Circuit> {
    let slot: Rc<RefCell<Option<Result<Circuit>>>> = Rc::new(RefCell::new(None));
    let slot2 = Rc::clone(&slot);
    let manager = fx.manager.clone();
    let host = host.to_string();
    fx.pool
        .spawner()
        .spawn_local(async move {
            *slot2.borrow_mut() = Some(manager.use_circuit(&host, &CancelToken::new()).await);
        })
        .unwrap();
    fx.pool.run_until_stalled();
    let result = slot.borrow_mut().take().expect("use_circuit should have completed");
    result
}

#[test]
fn pool_warms_to_buffer_size() {
    let mut fx = fixture(config(2));
    fx.manager.start();
    fx.pool.run_until_stalled();
    let status = fx.manager.status();
    assert_eq!(status.buffered, 2);
    assert_eq!(status.builds_inflight, 0);
    assert_eq!(fx.source.attempts.get(), 2);
}

#[test]
fn hosts_get_distinct_circuits_and_clear_is_isolated() {
    let mut fx = fixture(config(2));
    fx.manager.start();
    fx.pool.run_until_stalled();

    let a = use_circuit(&mut fx, "a.example").unwrap();
    let b = use_circuit(&mut fx, "b.example").unwrap();
    assert_ne!(a.id(), b.id());

    // Rebinding is stable.
    let a_again = use_circuit(&mut fx, "a.example").unwrap();
    assert_eq!(a.id(), a_again.id());

    // Clearing one host leaves the other's circuit alone.
    fx.manager.clear_circuit("a.example");
    fx.pool.run_until_stalled();
    assert!(a.is_closed());
    assert!(!b.is_closed());
    let b_again = use_circuit(&mut fx, "b.example").unwrap();
    assert_eq!(b.id(), b_again.id());
}

#[test]
fn concurrent_requests_share_one_binding() {
    let mut fx = fixture(config(1));
    fx.manager.start();
    fx.pool.run_until_stalled();

    let slots: Vec<Rc<RefCell<Option<Result<Circuit>>>>> =
        (0..4).map(|_| Rc::new(RefCell::new(None))).collect();
    for slot in &slots {
        let slot = Rc::clone(slot);
        let manager = fx.manager.clone();
        fx.pool
            .spawner()
            .spawn_local(async move {
                *slot.borrow_mut() =
                    Some(manager.use_circuit("same.example", &CancelToken::new()).await);
            })
            .unwrap();
    }
    fx.pool.run_until_stalled();

    let ids: Vec<u32> = slots
        .iter()
        .map(|s| s.borrow_mut().take().unwrap().unwrap().id())
        .collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]), "one circuit per host");
    assert_eq!(fx.manager.status().bound_hosts, vec!["same.example"]);
}

#[test]
fn rotation_replaces_before_disposal() {
    let mut fx = fixture(ManagerConfig {
        circuit_buffer: 1,
        max_circuit_lifetime_ms: 1_000,
        rotation_grace_ms: 100,
        idle_timeout_ms: 10_000,
        ..config(1)
    });
    fx.manager.start();
    fx.pool.run_until_stalled();

    let old = use_circuit(&mut fx, "site.example").unwrap();
    // Taking the buffered circuit triggers a refill; let it land.
    fx.pool.run_until_stalled();

    // t = 900ms after build: replacement warms, old circuit still bound.
    fx.clock.advance(900);
    fx.pool.run_until_stalled();
    assert!(!old.is_closed(), "old circuit survives the grace window");
    let mid_flight = use_circuit(&mut fx, "site.example").unwrap();
    assert_eq!(mid_flight.id(), old.id(), "in-flight requests stay on the old circuit");

    // t = 1000ms: old disposed, binding moves to the replacement.
    fx.clock.advance(100);
    fx.pool.run_until_stalled();
    assert!(old.is_closed(), "old circuit disposed at end of life");
    let fresh = use_circuit(&mut fx, "site.example").unwrap();
    assert_ne!(fresh.id(), old.id());
    assert!(!fresh.is_closed());
}

#[test]
fn idle_unbound_circuits_are_disposed() {
    let mut fx = fixture(ManagerConfig {
        idle_timeout_ms: 1_000,
        max_circuit_lifetime_ms: 600_000,
        ..config(1)
    });
    fx.manager.start();
    fx.pool.run_until_stalled();
    assert_eq!(fx.manager.status().buffered, 1);

    fx.clock.advance(1_000);
    fx.pool.run_until_stalled();
    // The idle spare was dropped and the pool refilled with a new one.
    let status = fx.manager.status();
    assert!(fx.source.attempts.get() >= 2);
    assert_eq!(status.buffered, 1);
}

#[test]
fn backoff_gates_retries_and_resets_on_success() {
    let mut fx = fixture(config(1));
    fx.source.fail_first.set(2);
    fx.manager.start();
    fx.pool.run_until_stalled();
    assert_eq!(fx.source.attempts.get(), 1, "first failure recorded");
    assert_eq!(fx.manager.status().buffered, 0);

    // Second attempt only after the 5s floor.
    fx.clock.advance(4_999);
    fx.pool.run_until_stalled();
    assert_eq!(fx.source.attempts.get(), 1);
    fx.clock.advance(1);
    fx.pool.run_until_stalled();
    assert_eq!(fx.source.attempts.get(), 2);

    // Third attempt is gated by the grown delay, then succeeds and the
    // backoff resets.
    fx.clock.advance(5_500);
    fx.pool.run_until_stalled();
    assert_eq!(fx.source.attempts.get(), 3);
    assert_eq!(fx.manager.status().buffered, 1);
    assert_eq!(fx.manager.status().backoff_delay_ms, 0);
}

#[test]
fn zero_buffer_refuses_creation() {
    let mut fx = fixture(config(0));
    fx.manager.start();
    fx.pool.run_until_stalled();
    assert_eq!(fx.source.attempts.get(), 0);

    let result = use_circuit(&mut fx, "nowhere.example");
    assert!(matches!(result, Err(TorError::NoCreationConfigured)));

    let slot: Rc<RefCell<Option<Result<()>>>> = Rc::new(RefCell::new(None));
    let slot2 = Rc::clone(&slot);
    let manager = fx.manager.clone();
    fx.pool
        .spawner()
        .spawn_local(async move {
            *slot2.borrow_mut() =
                Some(manager.wait_for_circuit_ready(&CancelToken::new()).await);
        })
        .unwrap();
    fx.pool.run_until_stalled();
    assert!(matches!(
        slot.borrow_mut().take(),
        Some(Err(TorError::NoCreationConfigured))
    ));
}

#[test]
fn wait_for_ready_resolves_when_pool_fills() {
    let mut fx = fixture(config(1));
    let slot: Rc<RefCell<Option<Result<()>>>> = Rc::new(RefCell::new(None));
    let slot2 = Rc::clone(&slot);
    let manager = fx.manager.clone();
    fx.pool
        .spawner()
        .spawn_local(async move {
            *slot2.borrow_mut() =
                Some(manager.wait_for_circuit_ready(&CancelToken::new()).await);
        })
        .unwrap();
    fx.pool.run_until_stalled();
    assert!(matches!(slot.borrow_mut().take(), Some(Ok(()))));
    assert_eq!(fx.manager.status().buffered, 1);
}

#[test]
fn close_disposes_everything() {
    let mut fx = fixture(config(2));
    fx.manager.start();
    fx.pool.run_until_stalled();
    let bound = use_circuit(&mut fx, "h.example").unwrap();

    fx.manager.close();
    fx.pool.run_until_stalled();
    assert!(bound.is_closed());
    assert_eq!(fx.manager.status().buffered, 0);

    let result = use_circuit(&mut fx, "h.example");
    assert!(matches!(result, Err(TorError::Closed)));
}

#[test]
fn rejecting_exit_is_repicked_at_fetch_time() {
    let mut fx = fixture(config(1));
    // First circuit's exit serves only web ports; the replacement allows
    // SMTP.
    fx.source.exit_policies.borrow_mut().extend([
        PortPolicy::parse("accept 80,443").unwrap(),
        PortPolicy::parse("accept 25").unwrap(),
    ]);
    fx.manager.start();
    fx.pool.run_until_stalled();
    assert_eq!(fx.source.attempts.get(), 1);

    // The policy-aware acquisition binds the web-only exit first,
    // rejects it for port 25, and moves the binding to the
    // SMTP-friendly replacement build.
    let slot: Rc<RefCell<Option<Result<Circuit>>>> = Rc::new(RefCell::new(None));
    let slot2 = Rc::clone(&slot);
    let manager = fx.manager.clone();
    fx.pool
        .spawner()
        .spawn_local(async move {
            *slot2.borrow_mut() = Some(
                crate::fetch::circuit_allowing_port(
                    &manager,
                    "mail.example",
                    25,
                    &CancelToken::new(),
                )
                .await,
            );
        })
        .unwrap();
    fx.pool.run_until_stalled();

    let chosen = slot.borrow_mut().take().unwrap().unwrap();
    assert!(chosen
        .exit_port_policy()
        .expect("scripted exit carries a policy")
        .allows_port(25));
    assert!(fx.source.attempts.get() >= 2, "a replacement was built");
    assert_eq!(fx.manager.status().bound_hosts, vec!["mail.example"]);
}

#[test]
fn all_rejecting_exits_fail_the_fetch() {
    let mut fx = fixture(config(1));
    fx.source
        .exit_policies
        .borrow_mut()
        .extend(std::iter::repeat(PortPolicy::parse("reject 25").unwrap()).take(8));
    fx.manager.start();
    fx.pool.run_until_stalled();

    let slot: Rc<RefCell<Option<Result<Circuit>>>> = Rc::new(RefCell::new(None));
    let slot2 = Rc::clone(&slot);
    let manager = fx.manager.clone();
    fx.pool
        .spawner()
        .spawn_local(async move {
            *slot2.borrow_mut() = Some(
                crate::fetch::circuit_allowing_port(
                    &manager,
                    "mail.example",
                    25,
                    &CancelToken::new(),
                )
                .await,
            );
        })
        .unwrap();
    fx.pool.run_until_stalled();

    assert!(matches!(
        slot.borrow_mut().take().unwrap(),
        Err(TorError::OpenFailed(_))
    ));
    // Web ports remain served by the same pool.
    let web = use_circuit(&mut fx, "web.example").unwrap();
    assert!(web.exit_port_policy().unwrap().allows_port(443));
}

#[test]
fn cancelled_use_circuit_returns_cancelled() {
    let mut fx = fixture(config(1));
    fx.source.fail_first.set(100);
    fx.manager.start();
    fx.pool.run_until_stalled();

    let cancel = CancelToken::new();
    let slot: Rc<RefCell<Option<Result<Circuit>>>> = Rc::new(RefCell::new(None));
    let slot2 = Rc::clone(&slot);
    let manager = fx.manager.clone();
    let token = cancel.clone();
    fx.pool
        .spawner()
        .spawn_local(async move {
            *slot2.borrow_mut() = Some(manager.use_circuit("slow.example", &token).await);
        })
        .unwrap();
    fx.pool.run_until_stalled();
    assert!(slot.borrow().is_none(), "request parked on build");

    cancel.cancel();
    fx.pool.run_until_stalled();
    assert!(matches!(
        slot.borrow_mut().take(),
        Some(Err(TorError::Cancelled))
    ));
}

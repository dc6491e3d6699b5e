//! Circuit objects: ordered hop chains multiplexing streams.
//!
//! A circuit owns its per-hop crypto, its stream table, and the pending
//! single-consumer waits ("next EXTENDED2", "CONNECTED for stream 7").
//! One pump task per circuit drains the cell queue its channel routes to
//! it; everything else talks to the circuit through the shared handle.
//!
//! Streams are arena-style: the circuit owns the table, stream handles
//! carry the circuit handle plus their id. Stream ids count up from 1 and
//! are never reused within a circuit.

use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::Rc;

use crate::directory::microdesc::PortPolicy;
use crate::error::{Result, TorError};
use crate::runtime::SharedSpawner;

use super::cell::{Cell, CellCommand, PAYLOAD_LEN};
use super::flow::StreamWindows;
use super::hop::{CircuitCrypto, HopCrypto};
use super::link::Channel;
use super::ntor::NtorClient;
use super::relay::{
    decode_created2, encode_create2, encode_extend2, LinkSpecifier, RelayCell, RelayCommand,
    END_REASON_DONE, MAX_RELAY_DATA_LEN,
};

/// Everything the builder knows about a relay it wants in the path.
#[derive(Debug, Clone)]
pub struct HopTarget {
    pub nickname: String,
    pub rsa_id: [u8; 20],
    pub ntor_onion_key: [u8; 32],
    pub ed25519_id: Option<[u8; 32]>,
    pub ipv4: Ipv4Addr,
    pub or_port: u16,
    /// Exit port summary from the relay's microdesc, when it has one.
    pub port_policy: Option<PortPolicy>,
}

/// Events a stream receives from the circuit pump.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Vec<u8>),
    End(u8),
}

struct StreamEntry {
    events: mpsc::UnboundedSender<StreamEvent>,
    windows: StreamWindows,
    window_waiter: Option<oneshot::Sender<()>>,
}

type ControlKey = (u8, u16);

struct CircuitShared {
    id: u32,
    channel: Channel,
    crypto: CircuitCrypto,
    hops: Vec<HopTarget>,
    streams: HashMap<u16, StreamEntry>,
    next_stream_id: u32,
    control: HashMap<ControlKey, oneshot::Sender<RelayCell>>,
    pending_created2: Option<oneshot::Sender<Vec<u8>>>,
    circuit_window_waiters: Vec<oneshot::Sender<()>>,
    closed: Option<u8>,
    created_at_ms: u64,
}

/// Shared handle to one circuit.
#[derive(Clone)]
pub struct Circuit {
    shared: Rc<RefCell<CircuitShared>>,
}

impl Circuit {
    /// Register a fresh circuit id on the channel and start its pump.
    pub fn new(channel: Channel, created_at_ms: u64, spawner: &SharedSpawner) -> Self {
        let id = channel.new_circ_id();
        let queue = channel.register_circuit(id);
        let shared = Rc::new(RefCell::new(CircuitShared {
            id,
            channel,
            crypto: CircuitCrypto::new(),
            hops: Vec::new(),
            streams: HashMap::new(),
            next_stream_id: 1,
            control: HashMap::new(),
            pending_created2: None,
            circuit_window_waiters: Vec::new(),
            closed: None,
            created_at_ms,
        }));
        let circuit = Self {
            shared: Rc::clone(&shared),
        };
        spawner.spawn(Box::pin(run_pump(shared, queue)));
        circuit
    }

    pub fn id(&self) -> u32 {
        self.shared.borrow().id
    }

    pub fn created_at_ms(&self) -> u64 {
        self.shared.borrow().created_at_ms
    }

    pub fn hop_count(&self) -> usize {
        self.shared.borrow().hops.len()
    }

    pub fn hops(&self) -> Vec<HopTarget> {
        self.shared.borrow().hops.clone()
    }

    /// The exit hop's port summary, if its microdesc declared one.
    pub fn exit_port_policy(&self) -> Option<PortPolicy> {
        self.shared
            .borrow()
            .hops
            .last()
            .and_then(|hop| hop.port_policy.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed.is_some()
    }

    fn closed_error(&self) -> TorError {
        closed_error_from(self.shared.borrow().closed)
    }

    /// CREATE2 to the first hop and complete the ntor handshake.
    pub async fn create_first_hop(&self, target: &HopTarget) -> Result<()> {
        let ntor = NtorClient::new(target.rsa_id, target.ntor_onion_key);
        let rx = {
            let mut shared = self.shared.borrow_mut();
            if shared.closed.is_some() {
                return Err(closed_error_from(shared.closed));
            }
            if !shared.hops.is_empty() {
                return Err(TorError::Internal("circuit already has a first hop".into()));
            }
            let (tx, rx) = oneshot::channel();
            shared.pending_created2 = Some(tx);
            let cell = Cell::new(
                shared.id,
                CellCommand::Create2,
                encode_create2(&ntor.onion_skin()),
            );
            shared.channel.send_cell(cell)?;
            rx
        };

        let payload = rx.await.map_err(|_| self.closed_error())?;
        let reply = decode_created2(&payload)?;
        let keys = ntor.finish(reply)?;

        let mut shared = self.shared.borrow_mut();
        shared.crypto.add_hop(HopCrypto::new(target.rsa_id, &keys));
        shared.hops.push(target.clone());
        log::debug!("circuit {}: created at {}", shared.id, target.nickname);
        Ok(())
    }

    /// CREATE_FAST to the link peer: the bootstrap path for directory
    /// circuits when the peer's ntor onion key is not yet known (its
    /// descriptor has not been fetched). Keys come from the legacy
    /// KDF-TOR expansion, authenticated by the returned KH.
    pub async fn create_fast_first_hop(&self) -> Result<()> {
        let x: [u8; 20] = rand::random();
        let (peer_id, rx) = {
            let mut shared = self.shared.borrow_mut();
            if shared.closed.is_some() {
                return Err(closed_error_from(shared.closed));
            }
            if !shared.hops.is_empty() {
                return Err(TorError::Internal("circuit already has a first hop".into()));
            }
            let (tx, rx) = oneshot::channel();
            shared.pending_created2 = Some(tx);
            let cell = Cell::new(shared.id, CellCommand::CreateFast, x.to_vec());
            shared.channel.send_cell(cell)?;
            (shared.channel.peer_identity().rsa_fingerprint, rx)
        };

        let payload = rx.await.map_err(|_| self.closed_error())?;
        if payload.len() < 40 {
            return Err(TorError::ProtocolViolation("CREATED_FAST too short".into()));
        }
        let y: [u8; 20] = payload[..20].try_into().expect("length checked");
        let their_kh: [u8; 20] = payload[20..40].try_into().expect("length checked");

        let (kh, keys) = super::ntor::kdf_tor(&x, &y)?;
        if !bool::from(subtle::ConstantTimeEq::ct_eq(&kh[..], &their_kh[..])) {
            return Err(TorError::InvalidNtorAuth);
        }

        let mut shared = self.shared.borrow_mut();
        shared.crypto.add_hop(HopCrypto::new(peer_id, &keys));
        shared.hops.push(HopTarget {
            nickname: "link-peer".into(),
            rsa_id: peer_id,
            ntor_onion_key: [0; 32],
            ed25519_id: None,
            ipv4: std::net::Ipv4Addr::UNSPECIFIED,
            or_port: 0,
            port_policy: None,
        });
        log::debug!("circuit {}: fast-created at link peer", shared.id);
        Ok(())
    }

    /// RELAY_EXTEND2 through the current last hop; on EXTENDED2, the new
    /// hop's keys are layered in.
    pub async fn extend(&self, target: &HopTarget) -> Result<()> {
        let ntor = NtorClient::new(target.rsa_id, target.ntor_onion_key);
        let mut specs = vec![
            LinkSpecifier::Ipv4(target.ipv4, target.or_port),
            LinkSpecifier::RsaId(target.rsa_id),
        ];
        if let Some(ed) = target.ed25519_id {
            specs.push(LinkSpecifier::Ed25519Id(ed));
        }
        let body = encode_extend2(&specs, &ntor.onion_skin());

        let rx = self.register_control(RelayCommand::Extended2, 0)?;
        // Extensions ride RELAY_EARLY.
        self.send_relay_cell(RelayCell::new(RelayCommand::Extend2, 0, body), true)?;

        let reply = rx
            .await
            .map_err(|_| TorError::ExtendFailed("circuit closed while extending".into()))?;
        let keys = ntor.finish(decode_created2(&reply.data)?)?;

        let mut shared = self.shared.borrow_mut();
        shared.crypto.add_hop(HopCrypto::new(target.rsa_id, &keys));
        shared.hops.push(target.clone());
        log::debug!(
            "circuit {}: extended to {} ({} hops)",
            shared.id,
            target.nickname,
            shared.hops.len()
        );
        Ok(())
    }

    /// RELAY_TRUNCATE, keeping the first `keep` hops.
    pub async fn truncate(&self, keep: usize) -> Result<()> {
        {
            let shared = self.shared.borrow();
            if keep == 0 || keep >= shared.hops.len() {
                return Err(TorError::TruncateFailed(format!(
                    "cannot truncate {}-hop circuit to {keep}",
                    shared.hops.len()
                )));
            }
        }
        let rx = self.register_control(RelayCommand::Truncated, 0)?;
        self.send_relay_cell_to(keep - 1, RelayCell::truncate(), false)?;
        rx.await
            .map_err(|_| TorError::TruncateFailed("circuit closed while truncating".into()))?;

        let mut shared = self.shared.borrow_mut();
        shared.crypto.truncate(keep);
        shared.hops.truncate(keep);
        Ok(())
    }

    /// Open a stream to `host:port` through the exit.
    pub async fn open_stream(&self, host: &str, port: u16, begin_flags: u32) -> Result<TorStream> {
        let (stream_id, events) = self.allocate_stream()?;
        let rx = self.register_control(RelayCommand::Connected, stream_id)?;
        self.send_relay_cell(RelayCell::begin(stream_id, host, port, begin_flags), false)?;

        match rx.await {
            Ok(reply) if reply.command == RelayCommand::Connected => {
                log::debug!("stream {stream_id} connected to {host}:{port}");
                Ok(TorStream::new(self.clone(), stream_id, events))
            }
            Ok(reply) => {
                self.drop_stream(stream_id);
                let reason = reply.data.first().copied().unwrap_or(0);
                Err(TorError::OpenFailed(format!(
                    "{host}:{port} refused (reason {reason})"
                )))
            }
            Err(_) => {
                self.drop_stream(stream_id);
                Err(TorError::OpenFailed(format!("{host}:{port}: circuit closed")))
            }
        }
    }

    /// Open a directory stream to the last hop (BEGIN_DIR).
    pub async fn open_dir_stream(&self) -> Result<TorStream> {
        let (stream_id, events) = self.allocate_stream()?;
        let rx = self.register_control(RelayCommand::Connected, stream_id)?;
        self.send_relay_cell(RelayCell::begin_dir(stream_id), false)?;

        match rx.await {
            Ok(reply) if reply.command == RelayCommand::Connected => {
                Ok(TorStream::new(self.clone(), stream_id, events))
            }
            Ok(_) | Err(_) => {
                self.drop_stream(stream_id);
                Err(TorError::OpenFailed("directory stream refused".into()))
            }
        }
    }

    /// Tear the circuit down, sending DESTROY if the link is still up.
    pub fn close(&self) {
        close_internal(&self.shared, 0, true);
    }

    /// Record a hop without any handshake; scripted-circuit tests use
    /// this to give a detached circuit an exit with a port policy.
    #[cfg(test)]
    pub(crate) fn push_hop_unchecked(&self, target: HopTarget) {
        self.shared.borrow_mut().hops.push(target);
    }

    fn allocate_stream(&self) -> Result<(u16, mpsc::UnboundedReceiver<StreamEvent>)> {
        let mut shared = self.shared.borrow_mut();
        if shared.closed.is_some() {
            return Err(closed_error_from(shared.closed));
        }
        if shared.next_stream_id > u16::MAX as u32 {
            return Err(TorError::StreamIdExhausted);
        }
        let id = shared.next_stream_id as u16;
        shared.next_stream_id += 1;
        let (tx, rx) = mpsc::unbounded();
        shared.streams.insert(
            id,
            StreamEntry {
                events: tx,
                windows: StreamWindows::new(),
                window_waiter: None,
            },
        );
        Ok((id, rx))
    }

    fn drop_stream(&self, stream_id: u16) {
        self.shared.borrow_mut().streams.remove(&stream_id);
    }

    fn register_control(
        &self,
        command: RelayCommand,
        stream_id: u16,
    ) -> Result<oneshot::Receiver<RelayCell>> {
        let mut shared = self.shared.borrow_mut();
        if shared.closed.is_some() {
            return Err(closed_error_from(shared.closed));
        }
        let key = (command as u8, stream_id);
        if shared.control.contains_key(&key) {
            return Err(TorError::Internal(format!(
                "duplicate waiter for {command:?}/{stream_id}"
            )));
        }
        let (tx, rx) = oneshot::channel();
        shared.control.insert(key, tx);
        Ok(rx)
    }

    /// Wrap a relay cell for the last hop and queue it on the link.
    fn send_relay_cell(&self, cell: RelayCell, early: bool) -> Result<()> {
        let target = {
            let shared = self.shared.borrow();
            shared
                .crypto
                .last_hop_index()
                .ok_or_else(|| TorError::Internal("relay cell on 0-hop circuit".into()))?
        };
        self.send_relay_cell_to(target, cell, early)
    }

    fn send_relay_cell_to(&self, hop: usize, cell: RelayCell, early: bool) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        if shared.closed.is_some() {
            return Err(closed_error_from(shared.closed));
        }
        let mut payload = cell.to_payload()?;
        shared.crypto.wrap(hop, &mut payload)?;
        let command = if early {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        let id = shared.id;
        shared
            .channel
            .send_cell(Cell::new(id, command, payload.to_vec()))
    }

    /// Send one RELAY_DATA chunk on a stream, respecting both the stream
    /// and circuit package windows. Blocks until SENDMEs make room.
    pub(crate) async fn stream_send_data(&self, stream_id: u16, chunk: &[u8]) -> Result<()> {
        debug_assert!(chunk.len() <= MAX_RELAY_DATA_LEN);
        loop {
            let wait: oneshot::Receiver<()> = {
                let mut shared = self.shared.borrow_mut();
                if shared.closed.is_some() {
                    return Err(closed_error_from(shared.closed));
                }
                let last_hop = shared
                    .crypto
                    .last_hop_index()
                    .ok_or_else(|| TorError::Internal("stream on 0-hop circuit".into()))?;

                let stream_ok = shared
                    .streams
                    .get(&stream_id)
                    .ok_or_else(|| TorError::StreamClosed("stream gone".into()))?
                    .windows
                    .0
                    .can_package();
                let circuit_ok = shared
                    .crypto
                    .hop_mut(last_hop)
                    .expect("last hop exists")
                    .windows
                    .0
                    .can_package();

                if stream_ok && circuit_ok {
                    shared
                        .streams
                        .get_mut(&stream_id)
                        .expect("checked above")
                        .windows
                        .0
                        .note_packaged()?;
                    shared
                        .crypto
                        .hop_mut(last_hop)
                        .expect("last hop exists")
                        .windows
                        .0
                        .note_packaged()?;
                    drop(shared);
                    return self.send_relay_cell(
                        RelayCell::new(RelayCommand::Data, stream_id, chunk.to_vec()),
                        false,
                    );
                }

                // Park until a SENDME arrives on whichever window is shut.
                let (tx, rx) = oneshot::channel();
                if !stream_ok {
                    shared
                        .streams
                        .get_mut(&stream_id)
                        .expect("checked above")
                        .window_waiter = Some(tx);
                } else {
                    shared.circuit_window_waiters.push(tx);
                }
                rx
            };
            if wait.await.is_err() {
                return Err(self.closed_error());
            }
        }
    }

    /// Send RELAY_END for a stream. The entry stays until the peer's END
    /// arrives or the circuit closes; the id is never handed out again.
    pub(crate) fn stream_send_end(&self, stream_id: u16) {
        let _ = self.send_relay_cell(RelayCell::end(stream_id, END_REASON_DONE), false);
    }
}

/// Per-circuit pump: peel inbound cells and dispatch to streams/waiters.
async fn run_pump(shared: Rc<RefCell<CircuitShared>>, mut queue: mpsc::UnboundedReceiver<Cell>) {
    while let Some(cell) = queue.next().await {
        match cell.command {
            CellCommand::Created2 | CellCommand::CreatedFast => {
                let waiter = shared.borrow_mut().pending_created2.take();
                if let Some(tx) = waiter {
                    let _ = tx.send(cell.payload);
                }
            }
            CellCommand::Destroy => {
                let reason = cell.payload.first().copied().unwrap_or(0);
                log::debug!(
                    "circuit {}: DESTROY ({})",
                    shared.borrow().id,
                    crate::error::destroy_reason_name(reason)
                );
                close_internal(&shared, reason, false);
                return;
            }
            CellCommand::Relay | CellCommand::RelayEarly => {
                handle_relay(&shared, &cell.payload);
            }
            CellCommand::Padding | CellCommand::Vpadding => {}
            other => {
                log::debug!("circuit {}: ignoring {other:?}", shared.borrow().id);
            }
        }
    }
    // Channel dropped our queue: the link is gone.
    close_internal(&shared, 8, false);
}

fn handle_relay(shared: &Rc<RefCell<CircuitShared>>, payload: &[u8]) {
    let mut body: [u8; PAYLOAD_LEN] = match payload.try_into() {
        Ok(body) => body,
        Err(_) => {
            log::warn!("relay cell with bad payload length {}", payload.len());
            return;
        }
    };

    let mut guard = shared.borrow_mut();
    let hop = match guard.crypto.peel(&mut body) {
        Ok(hop) => hop,
        Err(TorError::ReplayDetected) => {
            // Replayed digest: drop the cell, leave the stream alone.
            log::warn!("circuit {}: replayed relay cell dropped", guard.id);
            return;
        }
        Err(e) => {
            log::warn!("circuit {}: undeliverable relay cell: {e}", guard.id);
            return;
        }
    };
    let cell = match RelayCell::from_payload(&body) {
        Ok(cell) => cell,
        Err(e) => {
            log::warn!("circuit {}: bad relay payload: {e}", guard.id);
            return;
        }
    };

    if cell.stream_id == 0 {
        match cell.command {
            RelayCommand::Extended2 | RelayCommand::Truncated => {
                let key = (cell.command as u8, 0u16);
                if let Some(tx) = guard.control.remove(&key) {
                    let _ = tx.send(cell);
                }
            }
            RelayCommand::Sendme => {
                if let Some(hop_state) = guard.crypto.hop_mut(hop) {
                    hop_state.windows.0.note_sendme_received();
                }
                for waiter in guard.circuit_window_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
            RelayCommand::Drop => {}
            other => {
                log::debug!("circuit {}: unexpected control cell {other:?}", guard.id);
            }
        }
        return;
    }

    let stream_id = cell.stream_id;
    match cell.command {
        RelayCommand::Connected => {
            let key = (RelayCommand::Connected as u8, stream_id);
            if let Some(tx) = guard.control.remove(&key) {
                let _ = tx.send(cell);
            }
        }
        RelayCommand::Data => {
            if !guard.streams.contains_key(&stream_id) {
                log::debug!("data for unknown stream {stream_id}");
                return;
            }
            // Circuit-level delivery accounting at the hop the data came
            // from, then stream-level; each may owe a SENDME.
            let circuit_sendme = match guard
                .crypto
                .hop_mut(hop)
                .map(|h| h.windows.0.note_delivered())
            {
                Some(Ok(owed)) => owed,
                _ => false,
            };
            let entry = guard.streams.get_mut(&stream_id).expect("checked above");
            let stream_sendme = entry.windows.0.note_delivered().unwrap_or(false);
            let _ = entry.events.unbounded_send(StreamEvent::Data(cell.data));
            drop(guard);
            let circuit = Circuit {
                shared: Rc::clone(shared),
            };
            if circuit_sendme {
                let _ = circuit.send_relay_cell_to(hop, RelayCell::sendme(0), false);
            }
            if stream_sendme {
                let _ = circuit.send_relay_cell_to(hop, RelayCell::sendme(stream_id), false);
            }
        }
        RelayCommand::End => {
            let reason = cell.data.first().copied().unwrap_or(0);
            if let Some(entry) = guard.streams.remove(&stream_id) {
                let _ = entry.events.unbounded_send(StreamEvent::End(reason));
            }
            // A refused BEGIN is answered with END instead of CONNECTED;
            // hand the END to whoever is waiting on the open.
            let key = (RelayCommand::Connected as u8, stream_id);
            if let Some(tx) = guard.control.remove(&key) {
                let _ = tx.send(cell);
            }
        }
        RelayCommand::Sendme => {
            if let Some(entry) = guard.streams.get_mut(&stream_id) {
                entry.windows.0.note_sendme_received();
                if let Some(waiter) = entry.window_waiter.take() {
                    let _ = waiter.send(());
                }
            }
        }
        other => {
            log::debug!("stream {stream_id}: unexpected {other:?}");
        }
    }
}

fn closed_error_from(closed: Option<u8>) -> TorError {
    match closed {
        Some(reason) => TorError::Destroyed { reason },
        None => TorError::Internal("circuit not closed".into()),
    }
}

fn close_internal(shared: &Rc<RefCell<CircuitShared>>, reason: u8, send_destroy: bool) {
    let mut guard = shared.borrow_mut();
    if guard.closed.is_some() {
        return;
    }
    guard.closed = Some(reason);

    for (_, entry) in guard.streams.drain() {
        let _ = entry.events.unbounded_send(StreamEvent::End(reason));
    }
    guard.control.clear();
    guard.pending_created2 = None;
    guard.circuit_window_waiters.clear();

    let id = guard.id;
    let channel = guard.channel.clone();
    drop(guard);
    if send_destroy {
        channel.send_destroy(id, 0);
    }
    channel.unregister_circuit(id);
    log::debug!("circuit {id} disposed");
}

/// One TCP-like stream over a circuit.
pub struct TorStream {
    circuit: Circuit,
    stream_id: u16,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    readbuf: std::collections::VecDeque<u8>,
    eof: bool,
    closed: bool,
}

impl TorStream {
    fn new(circuit: Circuit, stream_id: u16, events: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self {
            circuit,
            stream_id,
            events,
            readbuf: std::collections::VecDeque::new(),
            eof: false,
            closed: false,
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }
}

#[async_trait::async_trait(?Send)]
impl crate::transport::ByteStream for TorStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if !self.readbuf.is_empty() {
                let n = buf.len().min(self.readbuf.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = self.readbuf.pop_front().expect("len checked");
                }
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            match self.events.next().await {
                Some(StreamEvent::Data(data)) => self.readbuf.extend(data),
                Some(StreamEvent::End(_)) | None => self.eof = true,
            }
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TorError::StreamClosed("stream closed locally".into()));
        }
        for chunk in buf.chunks(MAX_RELAY_DATA_LEN) {
            self.circuit.stream_send_data(self.stream_id, chunk).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.circuit.stream_send_end(self.stream_id);
        }
        Ok(())
    }
}

impl Drop for TorStream {
    fn drop(&mut self) {
        if !self.closed && !self.circuit.is_closed() {
            self.circuit.stream_send_end(self.stream_id);
        }
    }
}

/// One-hop circuit with a scripted relay mirror on the far side, shared
/// by protocol and directory tests.
#[cfg(test)]
pub(crate) mod test_harness {
    use super::*;
    use crate::protocol::cell::PAYLOAD_LEN;
    use crate::protocol::hop::HopCrypto;
    use crate::protocol::link::test_support::detached_channel;
    use crate::protocol::ntor::kdf_tor;
    use crate::runtime::SharedSpawner;
    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;
    use std::cell::RefCell;

    pub(crate) struct Harness {
        pub(crate) pool: LocalPool,
        pub(crate) circuit: Circuit,
        pub(crate) channel: Channel,
        pub(crate) wire: mpsc::UnboundedReceiver<Cell>,
        pub(crate) relay: HopCrypto,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let mut pool = LocalPool::new();
            let spawner: SharedSpawner = Rc::new(pool.spawner());
            let (channel, mut wire) = detached_channel();
            let circuit = Circuit::new(channel.clone(), 0, &spawner);

            // Complete CREATE_FAST as the relay would.
            let done: Rc<RefCell<Option<Result<()>>>> = Rc::new(RefCell::new(None));
            let done2 = Rc::clone(&done);
            let circ2 = circuit.clone();
            pool.spawner()
                .spawn_local(async move {
                    *done2.borrow_mut() = Some(circ2.create_fast_first_hop().await);
                })
                .unwrap();
            pool.run_until_stalled();

            let cell = wire.try_next().unwrap().expect("CREATE_FAST on the wire");
            assert_eq!(cell.command, CellCommand::CreateFast);
            let x: [u8; 20] = cell.payload[..20].try_into().unwrap();
            let y = [0x5Eu8; 20];
            let (kh, keys) = kdf_tor(&x, &y).unwrap();
            let relay = HopCrypto::new([0xA7; 20], &keys);

            let mut reply = Vec::with_capacity(40);
            reply.extend_from_slice(&y);
            reply.extend_from_slice(&kh);
            channel.inject_cell(Cell::new(cell.circ_id, CellCommand::CreatedFast, reply));
            pool.run_until_stalled();
            assert!(matches!(*done.borrow(), Some(Ok(()))));

            Self {
                pool,
                circuit,
                channel,
                wire,
                relay,
            }
        }

        /// Pull the next outbound relay cell off the wire and peel it.
        pub(crate) fn next_relay_cell(&mut self) -> RelayCell {
            let cell = self.wire.try_next().unwrap().expect("relay cell on the wire");
            assert!(matches!(
                cell.command,
                CellCommand::Relay | CellCommand::RelayEarly
            ));
            let mut payload: [u8; PAYLOAD_LEN] = cell.payload.as_slice().try_into().unwrap();
            self.relay.relay_peel(&mut payload);
            RelayCell::from_payload(&payload).unwrap()
        }

        /// Send a relay cell back through the circuit as the relay.
        pub(crate) fn send_from_relay(&mut self, cell: RelayCell) {
            let mut payload = cell.to_payload().unwrap();
            self.relay.relay_originate(&mut payload);
            self.channel.inject_cell(Cell::new(
                self.circuit.id(),
                CellCommand::Relay,
                payload.to_vec(),
            ));
        }

        /// Drive an open_stream to completion, answering CONNECTED.
        pub(crate) fn open_stream(&mut self, host: &str, port: u16) -> TorStream {
            let slot: Rc<RefCell<Option<Result<TorStream>>>> = Rc::new(RefCell::new(None));
            let slot2 = Rc::clone(&slot);
            let circuit = self.circuit.clone();
            let host = host.to_string();
            self.pool
                .spawner()
                .spawn_local(async move {
                    *slot2.borrow_mut() = Some(circuit.open_stream(&host, port, 0).await);
                })
                .unwrap();
            self.pool.run_until_stalled();

            let begin = self.next_relay_cell();
            assert_eq!(begin.command, RelayCommand::Begin);
            self.send_from_relay(RelayCell::new(
                RelayCommand::Connected,
                begin.stream_id,
                Vec::new(),
            ));
            self.pool.run_until_stalled();

            let result = slot.borrow_mut().take().expect("open completed");
            result.expect("stream connected")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_harness::Harness;
    use super::*;
    use crate::protocol::cell::PAYLOAD_LEN;
    use crate::transport::ByteStream;
    use futures::task::LocalSpawnExt;

    #[test]
    fn stream_ids_count_up_and_are_never_reused() {
        let mut harness = Harness::new();

        let mut first = harness.open_stream("a.example", 80);
        assert_eq!(first.stream_id(), 1);
        let second = harness.open_stream("b.example", 80);
        assert_eq!(second.stream_id(), 2);

        // Closing the first stream must not free its id.
        let circuit = harness.circuit.clone();
        harness
            .pool
            .spawner()
            .spawn_local(async move {
                let _ = first.close().await;
            })
            .unwrap();
        harness.pool.run_until_stalled();
        let end = harness.next_relay_cell();
        assert_eq!(end.command, RelayCommand::End);
        assert_eq!(end.stream_id, 1);

        let third = harness.open_stream("c.example", 80);
        assert_eq!(third.stream_id, 3);
        drop(circuit);
    }

    #[test]
    fn begin_carries_target_and_flags() {
        let mut harness = Harness::new();
        let slot: Rc<RefCell<Option<Result<TorStream>>>> = Rc::new(RefCell::new(None));
        let slot2 = Rc::clone(&slot);
        let circuit = harness.circuit.clone();
        harness
            .pool
            .spawner()
            .spawn_local(async move {
                *slot2.borrow_mut() = Some(circuit.open_stream("example.com", 443, 0b101).await);
            })
            .unwrap();
        harness.pool.run_until_stalled();

        let begin = harness.next_relay_cell();
        let text_end = begin.data.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&begin.data[..text_end], b"example.com:443");
        harness.send_from_relay(RelayCell::new(RelayCommand::Connected, 1, Vec::new()));
        harness.pool.run_until_stalled();
        assert!(matches!(slot.borrow_mut().take(), Some(Ok(_))));
    }

    #[test]
    fn data_round_trip_and_end() {
        let mut harness = Harness::new();
        let stream = Rc::new(RefCell::new(harness.open_stream("x.example", 80)));

        // Outbound data.
        {
            let stream = Rc::clone(&stream);
            harness
                .pool
                .spawner()
                .spawn_local(async move {
                    stream.borrow_mut().write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
                })
                .unwrap();
        }
        harness.pool.run_until_stalled();
        let data = harness.next_relay_cell();
        assert_eq!(data.command, RelayCommand::Data);
        assert_eq!(data.data, b"GET / HTTP/1.0\r\n\r\n");

        // Inbound data, then END.
        harness.send_from_relay(RelayCell::new(RelayCommand::Data, 1, b"HTTP/1.0 200 OK".to_vec()));
        harness.send_from_relay(RelayCell::end(1, END_REASON_DONE));

        let collected: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let stream = Rc::clone(&stream);
            let collected = Rc::clone(&collected);
            harness
                .pool
                .spawner()
                .spawn_local(async move {
                    let mut buf = [0u8; 64];
                    loop {
                        let n = stream.borrow_mut().read(&mut buf).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        collected.borrow_mut().extend_from_slice(&buf[..n]);
                    }
                })
                .unwrap();
        }
        harness.pool.run_until_stalled();
        assert_eq!(&*collected.borrow(), b"HTTP/1.0 200 OK");
    }

    #[test]
    fn refused_begin_reports_open_failed() {
        let mut harness = Harness::new();
        let slot: Rc<RefCell<Option<Result<TorStream>>>> = Rc::new(RefCell::new(None));
        let slot2 = Rc::clone(&slot);
        let circuit = harness.circuit.clone();
        harness
            .pool
            .spawner()
            .spawn_local(async move {
                *slot2.borrow_mut() = Some(circuit.open_stream("blocked.example", 25, 0).await);
            })
            .unwrap();
        harness.pool.run_until_stalled();

        let begin = harness.next_relay_cell();
        harness.send_from_relay(RelayCell::end(begin.stream_id, 2));
        harness.pool.run_until_stalled();
        assert!(matches!(
            slot.borrow_mut().take(),
            Some(Err(TorError::OpenFailed(_)))
        ));
    }

    #[test]
    fn destroy_closes_circuit_and_streams() {
        let mut harness = Harness::new();
        let mut stream = harness.open_stream("y.example", 80);

        harness
            .channel
            .inject_cell(Cell::new(harness.circuit.id(), CellCommand::Destroy, vec![4]));
        harness.pool.run_until_stalled();

        assert!(harness.circuit.is_closed());
        let eof: Rc<RefCell<Option<usize>>> = Rc::new(RefCell::new(None));
        let eof2 = Rc::clone(&eof);
        harness
            .pool
            .spawner()
            .spawn_local(async move {
                let mut buf = [0u8; 8];
                *eof2.borrow_mut() = Some(stream.read(&mut buf).await.unwrap());
            })
            .unwrap();
        harness.pool.run_until_stalled();
        assert_eq!(*eof.borrow(), Some(0));

        // New operations fail with the destroy reason.
        let err: Rc<RefCell<Option<Result<TorStream>>>> = Rc::new(RefCell::new(None));
        let err2 = Rc::clone(&err);
        let circuit = harness.circuit.clone();
        harness
            .pool
            .spawner()
            .spawn_local(async move {
                *err2.borrow_mut() = Some(circuit.open_stream("z.example", 80, 0).await);
            })
            .unwrap();
        harness.pool.run_until_stalled();
        assert!(matches!(
            err.borrow_mut().take(),
            Some(Err(TorError::Destroyed { reason: 4 }))
        ));
    }

    #[test]
    fn sendme_refills_stream_window() {
        let mut harness = Harness::new();
        let stream = Rc::new(RefCell::new(harness.open_stream("w.example", 80)));

        // Drain the whole stream package window.
        {
            let stream = Rc::clone(&stream);
            harness
                .pool
                .spawner()
                .spawn_local(async move {
                    let chunk = vec![0u8; MAX_RELAY_DATA_LEN];
                    for _ in 0..crate::protocol::flow::STREAM_WINDOW_INITIAL {
                        stream.borrow_mut().write_all(&chunk).await.unwrap();
                    }
                    // One more: blocks until a SENDME arrives.
                    stream.borrow_mut().write_all(b"after").await.unwrap();
                })
                .unwrap();
        }
        harness.pool.run_until_stalled();

        let mut seen = 0;
        while let Ok(Some(cell)) = harness.wire.try_next() {
            let mut payload: [u8; PAYLOAD_LEN] = cell.payload.as_slice().try_into().unwrap();
            harness.relay.relay_peel(&mut payload);
            seen += 1;
            let _ = payload;
        }
        assert_eq!(seen as u16, crate::protocol::flow::STREAM_WINDOW_INITIAL);

        // Credit the stream; the parked write resumes.
        harness.send_from_relay(RelayCell::sendme(1));
        harness.pool.run_until_stalled();
        let after = harness.next_relay_cell();
        assert_eq!(after.data, b"after");
    }
}

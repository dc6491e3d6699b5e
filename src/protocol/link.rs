//! Link handshake and channel cell pump.
//!
//! The link is a TLS session over the Snowflake duplex. Establishing it
//! walks the client-side handshake:
//!
//! `IDLE → sent VERSIONS → received VERSIONS → received CERTS →
//!  received AUTH_CHALLENGE → received NETINFO → sent NETINFO →
//!  ESTABLISHED`
//!
//! with the CERTS chain verified against the TLS leaf certificate before
//! NETINFO is answered. After that a single pump task owns the duplex and
//! the rustls state machine: outbound cells flow in through a queue,
//! inbound plaintext is reassembled into cells and routed to the circuit
//! that owns each circuit id. The pump is the only writer the duplex ever
//! sees, which gives cells their in-enqueue-order delivery guarantee.

use futures::channel::mpsc;
use futures::future::FutureExt;
use futures::StreamExt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::rc::Rc;

use crate::error::{Result, TorError};
use crate::runtime::SharedSpawner;
use crate::transport::tls::{TlsParts, TlsStream, TlsVerify};
use crate::transport::{BoxStream, ByteStream};

use super::cell::{read_cell, write_cell, Cell, CellBuffer, CellCommand, LinkFraming};
use super::certs::{verify_link_certs, CertsCell, VerifiedLinkIdentity};

/// Link protocol versions this client speaks.
const OFFERED_VERSIONS: [u16; 3] = [3, 4, 5];

/// Handle to an established link. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct Channel {
    inner: Rc<RefCell<ChannelInner>>,
    outgoing: mpsc::UnboundedSender<Cell>,
}

struct ChannelInner {
    framing: LinkFraming,
    identity: VerifiedLinkIdentity,
    circuits: HashMap<u32, mpsc::UnboundedSender<Cell>>,
    closed: bool,
}

impl Channel {
    /// Negotiated link framing (for circuit-id width decisions).
    pub fn framing(&self) -> LinkFraming {
        self.inner.borrow().framing
    }

    /// Identity the CERTS chain proved for the peer.
    pub fn peer_identity(&self) -> VerifiedLinkIdentity {
        self.inner.borrow().identity.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Pick an unused circuit id with the initiator MSB set.
    pub fn new_circ_id(&self) -> u32 {
        let inner = self.inner.borrow();
        let mask = match inner.framing.circ_id_len() {
            2 => 0x8000u32,
            _ => 0x8000_0000u32,
        };
        loop {
            let id = (rand::random::<u32>() & (mask - 1)) | mask;
            if !inner.circuits.contains_key(&id) {
                return id;
            }
        }
    }

    /// Route cells for `circ_id` to the returned queue.
    pub fn register_circuit(&self, circ_id: u32) -> mpsc::UnboundedReceiver<Cell> {
        let (tx, rx) = mpsc::unbounded();
        self.inner.borrow_mut().circuits.insert(circ_id, tx);
        rx
    }

    pub fn unregister_circuit(&self, circ_id: u32) {
        self.inner.borrow_mut().circuits.remove(&circ_id);
    }

    /// Queue a cell for the wire. Cells are written in enqueue order.
    pub fn send_cell(&self, cell: Cell) -> Result<()> {
        if self.inner.borrow().closed {
            return Err(TorError::Closed);
        }
        self.outgoing
            .unbounded_send(cell)
            .map_err(|_| TorError::Closed)
    }

    /// Send DESTROY for a circuit, if the link is still up.
    pub fn send_destroy(&self, circ_id: u32, reason: u8) {
        let _ = self.send_cell(Cell::new(circ_id, CellCommand::Destroy, vec![reason]));
    }

    /// Tear the link down; circuit queues see EOF.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        inner.circuits.clear();
        self.outgoing.close_channel();
    }
}

/// Establish a link over a freshly connected bridge duplex.
///
/// `guard_addr` is the guard's advertised OR address (used for SNI and the
/// NETINFO echo); `expected_rsa_id`, when given, must match the identity
/// the CERTS chain proves.
pub async fn establish_link(
    stream: BoxStream,
    guard_addr: Ipv4Addr,
    expected_rsa_id: Option<[u8; 20]>,
    now_ms: u64,
    spawner: &SharedSpawner,
) -> Result<Channel> {
    let mut tls = TlsStream::connect(stream, &guard_addr.to_string(), TlsVerify::LinkCerts).await?;
    let tls_leaf = tls
        .peer_certificate()
        .ok_or_else(|| TorError::InvalidCert("peer sent no TLS certificate".into()))?;

    // VERSIONS out, VERSIONS in, pick the highest version both sides speak.
    write_cell(&mut tls, LinkFraming::Negotiating, &Cell::versions(&OFFERED_VERSIONS)).await?;
    let versions = read_cell(&mut tls, LinkFraming::Negotiating).await?;
    if versions.command != CellCommand::Versions {
        return Err(TorError::UnexpectedCell {
            expected: "VERSIONS".into(),
            got: format!("{:?}", versions.command),
        });
    }
    let version = negotiate_version(&versions.payload)?;
    let framing = LinkFraming::Version(version);
    log::debug!("link protocol v{version} negotiated");

    // CERTS → AUTH_CHALLENGE → NETINFO, in that order.
    let certs = expect_cell(&mut tls, framing, CellCommand::Certs).await?;
    let parsed = CertsCell::parse(&certs.payload)?;
    let identity = verify_link_certs(&parsed, &tls_leaf, now_ms)?;
    if let Some(expected) = expected_rsa_id {
        if identity.rsa_fingerprint != expected {
            return Err(TorError::InvalidCert(format!(
                "guard identity {} does not match consensus entry {}",
                hex::encode(identity.rsa_fingerprint),
                hex::encode(expected)
            )));
        }
    }

    let _auth_challenge = expect_cell(&mut tls, framing, CellCommand::AuthChallenge).await?;
    let _their_netinfo = expect_cell(&mut tls, framing, CellCommand::Netinfo).await?;

    // Answer NETINFO: zero timestamp (clients do not leak clocks), the
    // guard's address as the address we believe we are talking to, and no
    // addresses of our own.
    let netinfo = build_netinfo(guard_addr);
    write_cell(&mut tls, framing, &Cell::new(0, CellCommand::Netinfo, netinfo)).await?;

    log::info!(
        "link established to {} (rsa id {})",
        guard_addr,
        hex::encode(identity.rsa_fingerprint)
    );

    // ESTABLISHED: hand the TLS session to the pump.
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded();
    let inner = Rc::new(RefCell::new(ChannelInner {
        framing,
        identity,
        circuits: HashMap::new(),
        closed: false,
    }));
    let channel = Channel {
        inner: Rc::clone(&inner),
        outgoing: outgoing_tx,
    };
    spawner.spawn(Box::pin(run_pump(tls.into_parts(), inner, outgoing_rx)));
    Ok(channel)
}

/// Pick the highest version offered by both sides; anything below 3 is
/// not spoken here.
fn negotiate_version(payload: &[u8]) -> Result<u16> {
    let mut best = None;
    for chunk in payload.chunks_exact(2) {
        let theirs = u16::from_be_bytes([chunk[0], chunk[1]]);
        if OFFERED_VERSIONS.contains(&theirs) && theirs >= 3 {
            best = Some(best.map_or(theirs, |b: u16| b.max(theirs)));
        }
    }
    best.ok_or_else(|| TorError::ProtocolViolation("no common link version >= 3".into()))
}

async fn expect_cell<S: ByteStream>(
    stream: &mut S,
    framing: LinkFraming,
    expected: CellCommand,
) -> Result<Cell> {
    loop {
        let cell = read_cell(stream, framing).await?;
        // PADDING/VPADDING may arrive at any point.
        if matches!(cell.command, CellCommand::Padding | CellCommand::Vpadding) {
            continue;
        }
        if cell.command != expected {
            return Err(TorError::UnexpectedCell {
                expected: format!("{expected:?}"),
                got: format!("{:?}", cell.command),
            });
        }
        return Ok(cell);
    }
}

/// NETINFO payload (tor-spec §4.5): TIME, OTHERADDR, then our addresses.
fn build_netinfo(other_addr: Ipv4Addr) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 6 + 1);
    out.extend_from_slice(&0u32.to_be_bytes()); // timestamp: clients send 0
    out.push(0x04); // ATYPE IPv4
    out.push(4);
    out.extend_from_slice(&other_addr.octets());
    out.push(0); // no addresses of our own
    out
}

/// The channel pump: single owner of the duplex and the TLS machine.
///
/// Two inputs race: the outbound cell queue and the wire. Raw duplex reads
/// must be cancel-safe (poll-based reads are), because the loser of each
/// race is dropped.
async fn run_pump(
    parts: TlsParts<BoxStream>,
    inner: Rc<RefCell<ChannelInner>>,
    mut outgoing: mpsc::UnboundedReceiver<Cell>,
) {
    let TlsParts {
        mut io,
        mut conn,
        mut tls_in,
        plaintext,
        mut peer_eof,
    } = parts;
    let framing = inner.borrow().framing;
    let mut cells = CellBuffer::new();
    cells.push(&plaintext.into_iter().collect::<Vec<u8>>());

    let reason: TorError = 'pump: loop {
        // Dispatch every complete cell already buffered.
        loop {
            match cells.next_cell(framing) {
                Ok(Some(cell)) => dispatch_cell(&inner, cell),
                Ok(None) => break,
                Err(e) => break 'pump e,
            }
        }

        // Push rustls output to the wire.
        while conn.wants_write() {
            let mut out = Vec::new();
            if conn.write_tls(&mut out).is_err() {
                break 'pump TorError::Closed;
            }
            if out.is_empty() {
                break;
            }
            if let Err(e) = io.write_all(&out).await {
                break 'pump e;
            }
        }

        // Feed buffered ciphertext through rustls.
        while !tls_in.is_empty() {
            let (front, _) = tls_in.as_slices();
            let mut front = front;
            match conn.read_tls(&mut front) {
                Ok(0) => break,
                Ok(n) => {
                    tls_in.drain(..n);
                    match conn.process_new_packets() {
                        Ok(state) => {
                            let mut chunk = vec![0u8; state.plaintext_bytes_to_read().max(1)];
                            match conn.reader().read(&mut chunk) {
                                Ok(0) => peer_eof = true,
                                Ok(n) => cells.push(&chunk[..n]),
                                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                                Err(_) => break 'pump TorError::Closed,
                            }
                        }
                        Err(_) => break 'pump TorError::Closed,
                    }
                }
                Err(_) => break 'pump TorError::Closed,
            }
        }
        // Cells may have become complete; give them priority over I/O.
        {
            let mut any = false;
            loop {
                match cells.next_cell(framing) {
                    Ok(Some(cell)) => {
                        any = true;
                        dispatch_cell(&inner, cell);
                    }
                    Ok(None) => break,
                    Err(e) => break 'pump e,
                }
            }
            if any {
                continue 'pump;
            }
        }

        if peer_eof {
            break 'pump TorError::Closed;
        }

        // Race: next outbound cell vs. more wire bytes.
        let mut read_buf = [0u8; 16 * 1024];
        let mut read_fut = io.read(&mut read_buf).fuse();
        let mut next_out = outgoing.next().fuse();
        futures::select_biased! {
            cell = next_out => match cell {
                Some(cell) => {
                    let bytes = match super::cell::encode_cell(&cell, framing) {
                        Ok(b) => b,
                        Err(e) => break 'pump e,
                    };
                    if conn.writer().write_all(&bytes).is_err() {
                        break 'pump TorError::Closed;
                    }
                }
                None => break 'pump TorError::Closed,
            },
            read = read_fut => match read {
                Ok(0) => peer_eof = true,
                Ok(n) => {
                    drop(read_fut);
                    tls_in.extend(&read_buf[..n]);
                }
                Err(e) => break 'pump e,
            },
        }
    };

    log::debug!("link pump stopped: {reason}");
    let mut guard = inner.borrow_mut();
    guard.closed = true;
    // Dropping the senders closes every circuit's queue; circuits read
    // that as CHANNEL_CLOSED.
    guard.circuits.clear();
    drop(guard);
    let _ = io.close().await;
}

fn dispatch_cell(inner: &Rc<RefCell<ChannelInner>>, cell: Cell) {
    // Link-level padding never reaches a circuit.
    if matches!(cell.command, CellCommand::Padding | CellCommand::Vpadding) {
        return;
    }
    if cell.circ_id == 0 {
        log::debug!("ignoring {:?} on circuit 0", cell.command);
        return;
    }
    let mut guard = inner.borrow_mut();
    let is_destroy = cell.command == CellCommand::Destroy;
    let circ_id = cell.circ_id;
    match guard.circuits.get(&circ_id).cloned() {
        Some(tx) => {
            if is_destroy {
                guard.circuits.remove(&circ_id);
            }
            let _ = tx.unbounded_send(cell);
        }
        None => log::debug!("cell {:?} for unknown circuit {circ_id}", cell.command),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A channel with no link behind it: cells queued for the wire land
    /// in the returned receiver, and tests can inject inbound cells.
    pub(crate) fn detached_channel() -> (Channel, mpsc::UnboundedReceiver<Cell>) {
        let (outgoing, wire_rx) = mpsc::unbounded();
        let inner = Rc::new(RefCell::new(ChannelInner {
            framing: LinkFraming::Version(4),
            identity: VerifiedLinkIdentity {
                rsa_fingerprint: [0xA7; 20],
                ed25519_identity: [0; 32],
                ed25519_signing_key: [0; 32],
            },
            circuits: HashMap::new(),
            closed: false,
        }));
        (Channel { inner, outgoing }, wire_rx)
    }

    impl Channel {
        /// Route a cell as if it had arrived off the wire.
        pub(crate) fn inject_cell(&self, cell: Cell) {
            dispatch_cell(&self.inner, cell);
        }
    }
}

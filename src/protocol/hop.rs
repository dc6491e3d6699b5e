//! Per-hop relay-cell cryptography.
//!
//! Each hop of a circuit keeps four pieces of rolling state derived from
//! its ntor handshake: a forward and a backward AES-128-CTR keystream
//! (never rewound; the position equals the bytes XORed so far) and a
//! forward and backward running SHA-1 digest seeded with Df/Db. Producing
//! a digest must not disturb the hasher (the running digest continues
//! across cells), so digests are taken from clones.
//!
//! Outbound cells are digest-stamped at the target hop and then layered in
//! reverse hop order; inbound cells are peeled hop by hop until one
//! recognizes the cell (recognized field zero and digest prefix match).

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use sha1::{Digest, Sha1};
use std::collections::VecDeque;
use subtle::ConstantTimeEq;

use crate::error::{Result, TorError};
use crate::protocol::cell::PAYLOAD_LEN;
use crate::protocol::flow::CircuitWindows;
use crate::protocol::ntor::NtorKeyMaterial;

type Aes128Ctr = Ctr128BE<Aes128>;

/// Byte range of the digest field within a relay payload.
const DIGEST_RANGE: std::ops::Range<usize> = 5..9;
/// Byte range of the recognized field.
const RECOGNIZED_RANGE: std::ops::Range<usize> = 1..3;
/// How many inbound digests each hop remembers for replay rejection.
const REPLAY_WINDOW: usize = 32;

/// Cryptographic state shared with one relay in one circuit.
pub struct HopCrypto {
    /// RSA identity fingerprint of the relay this state belongs to.
    pub fingerprint: [u8; 20],
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
    forward_digest: Sha1,
    backward_digest: Sha1,
    recent_digests: VecDeque<[u8; 4]>,
    /// Circuit-level flow windows toward this hop.
    pub windows: CircuitWindows,
}

impl HopCrypto {
    pub fn new(fingerprint: [u8; 20], keys: &NtorKeyMaterial) -> Self {
        // CTR counters start at zero (tor-spec §0.3); digests are seeded
        // with Df/Db before any cell passes.
        let zero_iv = [0u8; 16];
        Self {
            fingerprint,
            forward_cipher: Aes128Ctr::new((&keys.forward_key).into(), (&zero_iv).into()),
            backward_cipher: Aes128Ctr::new((&keys.backward_key).into(), (&zero_iv).into()),
            forward_digest: Sha1::new().chain_update(keys.forward_digest_seed),
            backward_digest: Sha1::new().chain_update(keys.backward_digest_seed),
            recent_digests: VecDeque::with_capacity(REPLAY_WINDOW),
            windows: CircuitWindows::new(),
        }
    }

    /// Stamp an outbound payload: zero recognized+digest, roll the forward
    /// digest over the whole 509 bytes, and write its first 4 bytes into
    /// the digest field.
    fn set_digest(&mut self, payload: &mut [u8; PAYLOAD_LEN]) {
        payload[RECOGNIZED_RANGE].fill(0);
        payload[DIGEST_RANGE].fill(0);
        self.forward_digest.update(&payload[..]);
        let digest = self.forward_digest.clone().finalize();
        payload[DIGEST_RANGE].copy_from_slice(&digest[..4]);
    }

    fn encrypt_forward(&mut self, payload: &mut [u8; PAYLOAD_LEN]) {
        self.forward_cipher.apply_keystream(payload);
    }

    fn decrypt_backward(&mut self, payload: &mut [u8; PAYLOAD_LEN]) {
        self.backward_cipher.apply_keystream(payload);
    }

    /// After one peel, decide whether this hop originated the cell.
    ///
    /// A trial digest is computed on a clone of the backward hasher with
    /// the digest field zeroed; only on a match is the real hasher
    /// advanced (and the digest checked against the replay ring).
    fn recognize(&mut self, payload: &[u8; PAYLOAD_LEN]) -> Result<bool> {
        if payload[RECOGNIZED_RANGE] != [0, 0] {
            return Ok(false);
        }

        // A digest field we have already accepted at this hop can never be
        // legitimate again: the rolling state has moved past it.
        let cell_digest: [u8; 4] = payload[DIGEST_RANGE].try_into().expect("4-byte range");
        if self.recent_digests.contains(&cell_digest) {
            return Err(TorError::ReplayDetected);
        }

        let mut trial = self.backward_digest.clone();
        trial.update(&payload[..DIGEST_RANGE.start]);
        trial.update([0u8; 4]);
        trial.update(&payload[DIGEST_RANGE.end..]);
        let committed = trial.clone();
        let computed = trial.finalize();

        if !bool::from(computed[..4].ct_eq(&cell_digest)) {
            return Ok(false);
        }

        if self.recent_digests.len() == REPLAY_WINDOW {
            self.recent_digests.pop_front();
        }
        self.recent_digests.push_back(cell_digest);

        self.backward_digest = committed;
        Ok(true)
    }
}

#[cfg(test)]
impl HopCrypto {
    /// Act as the relay side: stamp with the backward digest and encrypt
    /// with the backward keystream (single-hop originate).
    pub(crate) fn relay_originate(&mut self, payload: &mut [u8; PAYLOAD_LEN]) {
        payload[RECOGNIZED_RANGE].fill(0);
        payload[DIGEST_RANGE].fill(0);
        self.backward_digest.update(&payload[..]);
        let digest = self.backward_digest.clone().finalize();
        payload[DIGEST_RANGE].copy_from_slice(&digest[..4]);
        self.backward_cipher.apply_keystream(payload);
    }

    /// Act as the relay side: remove one forward layer.
    pub(crate) fn relay_peel(&mut self, payload: &mut [u8; PAYLOAD_LEN]) {
        self.forward_cipher.apply_keystream(payload);
    }
}

/// Onion layering over an ordered list of hops (hop 0 = guard).
#[derive(Default)]
pub struct CircuitCrypto {
    hops: Vec<HopCrypto>,
}

impl CircuitCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hop(&mut self, hop: HopCrypto) {
        self.hops.push(hop);
    }

    /// Drop hops after `len` (TRUNCATED handling).
    pub fn truncate(&mut self, len: usize) {
        self.hops.truncate(len);
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn hop_mut(&mut self, index: usize) -> Option<&mut HopCrypto> {
        self.hops.get_mut(index)
    }

    pub fn last_hop_index(&self) -> Option<usize> {
        self.hops.len().checked_sub(1)
    }

    /// Prepare an outbound relay payload for hop `target`: digest at the
    /// target, then XOR with forward keystreams from the target inward to
    /// the guard.
    pub fn wrap(&mut self, target: usize, payload: &mut [u8; PAYLOAD_LEN]) -> Result<()> {
        if target >= self.hops.len() {
            return Err(TorError::Internal(format!(
                "wrap for hop {target} of {}",
                self.hops.len()
            )));
        }
        self.hops[target].set_digest(payload);
        for hop in self.hops[..=target].iter_mut().rev() {
            hop.encrypt_forward(payload);
        }
        Ok(())
    }

    /// Peel an inbound relay payload, returning the index of the hop that
    /// recognized it.
    ///
    /// Replays fail with `ReplayDetected`; a cell no hop recognizes fails
    /// with `UnrecognizedCell` after all layers are removed.
    pub fn peel(&mut self, payload: &mut [u8; PAYLOAD_LEN]) -> Result<usize> {
        for index in 0..self.hops.len() {
            self.hops[index].decrypt_backward(payload);
            if self.hops[index].recognize(payload)? {
                return Ok(index);
            }
        }
        Err(TorError::UnrecognizedCell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ntor::expand_key_seed;
    use crate::protocol::relay::{RelayCell, RelayCommand};

    fn hop_pair(seed: u8) -> (HopCrypto, HopCrypto) {
        // A client-side hop and the relay's mirror of it share keys but
        // swap directions; for tests we mirror by hand.
        let keys = expand_key_seed(&[seed; 32]).unwrap();
        (HopCrypto::new([seed; 20], &keys), HopCrypto::new([seed; 20], &keys))
    }

    /// Relay-side originate: stamp with the *backward* digest and encrypt
    /// with the backward keystream, as hop `index` of the mirror set.
    fn originate_inbound(mirror: &mut [HopCrypto], index: usize, payload: &mut [u8; PAYLOAD_LEN]) {
        let hop = &mut mirror[index];
        payload[1..3].fill(0);
        payload[5..9].fill(0);
        hop.backward_digest.update(&payload[..]);
        let digest = hop.backward_digest.clone().finalize();
        payload[5..9].copy_from_slice(&digest[..4]);
        for hop in mirror[..=index].iter_mut().rev() {
            hop.backward_cipher.apply_keystream(payload);
        }
    }

    #[test]
    fn onion_symmetry_over_hop_counts() {
        for hops in 1..=8usize {
            let mut client = CircuitCrypto::new();
            let mut mirror = Vec::new();
            for i in 0..hops {
                let (a, b) = hop_pair(i as u8 + 1);
                client.add_hop(a);
                mirror.push(b);
            }

            // Outbound: client wraps for the last hop; each mirror hop
            // peels one forward layer; the last hop must see the stamped
            // plaintext.
            let cell = RelayCell::new(RelayCommand::Data, 7, vec![0xAB; 498]);
            let mut payload = cell.to_payload().unwrap();
            client.wrap(hops - 1, &mut payload).unwrap();

            for hop in mirror.iter_mut() {
                hop.forward_cipher.apply_keystream(&mut payload);
            }
            let parsed = RelayCell::from_payload(&payload).unwrap();
            assert_eq!(parsed.recognized, 0, "{hops} hops");
            assert_eq!(parsed.data, vec![0xAB; 498]);

            // Inbound: last mirror hop originates; client peels.
            let cell = RelayCell::new(RelayCommand::Data, 7, b"reply".to_vec());
            let mut payload = cell.to_payload().unwrap();
            originate_inbound(&mut mirror, hops - 1, &mut payload);

            let from = client.peel(&mut payload).unwrap();
            assert_eq!(from, hops - 1);
            let parsed = RelayCell::from_payload(&payload).unwrap();
            assert_eq!(parsed.data, b"reply");
        }
    }

    #[test]
    fn digest_continues_across_cells() {
        let (mut client_hop, _) = hop_pair(9);
        // Stamp three cells in sequence; a parallel hasher that never
        // finalizes must agree with each produced digest.
        let keys = expand_key_seed(&[9; 32]).unwrap();
        let mut shadow = Sha1::new().chain_update(keys.forward_digest_seed);

        for n in 0u8..3 {
            let cell = RelayCell::new(RelayCommand::Data, 1, vec![n; 10]);
            let mut payload = cell.to_payload().unwrap();
            client_hop.set_digest(&mut payload);

            let mut zeroed = payload;
            zeroed[5..9].fill(0);
            shadow.update(zeroed);
            let expected = shadow.clone().finalize();
            assert_eq!(&payload[5..9], &expected[..4], "cell {n}");
        }
    }

    #[test]
    fn keystream_position_is_cumulative() {
        // XORing N bytes then M bytes equals XORing N+M bytes in one call.
        let key = [4u8; 16];
        let iv = [0u8; 16];
        let data = [0u8; 100];

        let mut split = data;
        let mut cipher = Aes128Ctr::new((&key).into(), (&iv).into());
        cipher.apply_keystream(&mut split[..37]);
        cipher.apply_keystream(&mut split[37..]);

        let mut whole = data;
        let mut cipher = Aes128Ctr::new((&key).into(), (&iv).into());
        cipher.apply_keystream(&mut whole);

        assert_eq!(split, whole);
    }

    #[test]
    fn replayed_digest_is_rejected() {
        let (client, _) = hop_pair(3);
        let mut mirror = {
            let keys = expand_key_seed(&[3; 32]).unwrap();
            vec![HopCrypto::new([3; 20], &keys)]
        };
        let mut circ = CircuitCrypto::new();
        circ.add_hop(client);

        let cell = RelayCell::new(RelayCommand::Data, 1, b"once".to_vec());
        let mut payload = cell.to_payload().unwrap();
        originate_inbound(&mut mirror, 0, &mut payload);
        let replay_copy = payload;

        assert_eq!(circ.peel(&mut payload).unwrap(), 0);

        // Same ciphertext again: the keystream has moved on, so the peel
        // yields garbage and fails as unrecognized, but an attacker who
        // replays the *plaintext* digest at the right position is caught
        // by the replay ring.
        let mut replayed = replay_copy;
        let err = circ.peel(&mut replayed).unwrap_err();
        assert!(matches!(
            err,
            TorError::UnrecognizedCell | TorError::ReplayDetected
        ));
    }

    #[test]
    fn unrecognized_cell_after_all_peels() {
        let mut circ = CircuitCrypto::new();
        let keys = expand_key_seed(&[5; 32]).unwrap();
        circ.add_hop(HopCrypto::new([5; 20], &keys));

        let mut payload = [0x5Au8; PAYLOAD_LEN];
        assert!(matches!(
            circ.peel(&mut payload),
            Err(TorError::UnrecognizedCell)
        ));
    }

    #[test]
    fn replay_ring_catches_identical_digest() {
        // Drive recognize() directly with two cells carrying the same
        // digest field; the second must be rejected even though the first
        // committed the hasher.
        let keys = expand_key_seed(&[8; 32]).unwrap();
        let mut hop = HopCrypto::new([8; 20], &keys);

        let cell = RelayCell::new(RelayCommand::Data, 2, b"data".to_vec());
        let mut payload = cell.to_payload().unwrap();
        // Compute the digest the hop expects for its first inbound cell.
        let mut trial = Sha1::new().chain_update(keys.backward_digest_seed);
        trial.update(payload);
        let digest = trial.finalize();
        payload[5..9].copy_from_slice(&digest[..4]);

        assert!(hop.recognize(&payload).unwrap());
        // Same digest presented again at this hop.
        assert!(matches!(hop.recognize(&payload), Err(TorError::ReplayDetected)));
    }
}

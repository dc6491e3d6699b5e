//! Relay selection for circuit paths.
//!
//! Candidates come from the consensus; choices are weighted by the
//! consensus `bandwidth-weights` for the position being filled (the Wg*/
//! Wm*/We* families, scaled by 10000), falling back to raw bandwidth
//! when the footer has no weights. Constraints: never reuse a relay,
//! never place two hops in the same /16, and (checked by the builder
//! once microdescs are in hand) never place two hops from one declared
//! family.

use rand::Rng;
use std::net::Ipv4Addr;
use std::rc::Rc;

use crate::directory::consensus::{ConsensusDocument, RelayEntry};
use crate::directory::microdesc::Microdesc;
use crate::error::{Result, TorError};

/// Position in the path being selected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Guard,
    Middle,
    Exit,
}

pub struct PathSelector {
    consensus: Rc<ConsensusDocument>,
}

impl PathSelector {
    pub fn new(consensus: Rc<ConsensusDocument>) -> Self {
        Self { consensus }
    }

    /// Pick a relay for `position`, excluding relays conflicting with
    /// hops already chosen. Exits must carry the Exit flag and not
    /// BadExit; everything needs Fast, Stable, Running.
    pub fn pick(
        &self,
        rng: &mut impl Rng,
        position: Position,
        exclude: &[&RelayEntry],
    ) -> Result<RelayEntry> {
        let candidates: Vec<&RelayEntry> = self
            .consensus
            .relays
            .iter()
            .filter(|r| self.eligible(r, position))
            .filter(|r| !exclude.iter().any(|x| conflicts(r, x)))
            .collect();
        if candidates.is_empty() {
            return Err(TorError::Directory(format!(
                "no eligible relay for {position:?}"
            )));
        }

        let weights: Vec<f64> = candidates
            .iter()
            .map(|r| self.weight(r, position))
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            // All-zero weights: uniform.
            let index = rng.gen_range(0..candidates.len());
            return Ok(candidates[index].clone());
        }
        let mut point = rng.gen_range(0.0..total);
        for (relay, weight) in candidates.iter().zip(&weights) {
            if point < *weight {
                return Ok((*relay).clone());
            }
            point -= weight;
        }
        Ok(candidates[candidates.len() - 1].clone())
    }

    fn eligible(&self, relay: &RelayEntry, position: Position) -> bool {
        let flags = &relay.flags;
        if !(flags.running && flags.fast && flags.stable && flags.valid) {
            return false;
        }
        match position {
            Position::Guard => flags.guard,
            Position::Middle => true,
            Position::Exit => flags.exit && !flags.bad_exit,
        }
    }

    /// Positional bandwidth weight (consensus-weight units).
    fn weight(&self, relay: &RelayEntry, position: Position) -> f64 {
        let flags = &relay.flags;
        let name = match (position, flags.guard, flags.exit) {
            (Position::Guard, _, true) => "Wgd",
            (Position::Guard, _, false) => "Wgg",
            (Position::Middle, true, true) => "Wmd",
            (Position::Middle, true, false) => "Wmg",
            (Position::Middle, false, true) => "Wme",
            (Position::Middle, false, false) => "Wmm",
            (Position::Exit, true, _) => "Wed",
            (Position::Exit, false, _) => "Wee",
        };
        let factor = self
            .consensus
            .bandwidth_weights
            .get(name)
            .copied()
            .unwrap_or(10_000) as f64
            / 10_000.0;
        relay.bandwidth as f64 * factor.max(0.0)
    }
}

/// Two candidate hops conflict if they are the same relay or share a /16.
pub fn conflicts(a: &RelayEntry, b: &RelayEntry) -> bool {
    a.rsa_id == b.rsa_id || same_slash16(a.ipv4, b.ipv4)
}

pub fn same_slash16(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    a.octets()[0] == b.octets()[0] && a.octets()[1] == b.octets()[1]
}

/// Family check over fetched microdescs: bidirectional, as relays can
/// claim anyone. Either side listing the other's fingerprint counts;
/// one-sided claims are treated as a conflict rather than trusted.
pub fn share_family(a_id: &[u8; 20], a_md: &Microdesc, b_id: &[u8; 20], b_md: &Microdesc) -> bool {
    let a_hex = hex::encode_upper(a_id);
    let b_hex = hex::encode_upper(b_id);
    a_md.family.iter().any(|m| *m == b_hex) || b_md.family.iter().any(|m| *m == a_hex)
}

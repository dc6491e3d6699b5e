//! Circuit construction: link bootstrap, path selection, ntor extension.
//!
//! The Snowflake bridge fronts exactly one entry relay, so the guard
//! position is fixed by the link: establishing the link proves the
//! peer's RSA identity, a one-hop CREATE_FAST directory circuit fetches
//! the peer's own descriptor (`/tor/server/authority`) for its ntor key
//! plus the consensus and microdescs, and real circuits then CREATE2 to
//! the guard and EXTEND2 through a weighted middle/exit pair.

use rand::rngs::OsRng;
use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use crate::directory::consensus::RelayEntry;
use crate::directory::DirectoryClient;
use crate::error::{Result, TorError};
use crate::http;
use crate::protocol::{establish_link, Channel, Circuit, HopTarget};
use crate::runtime::{with_deadline, CancelToken, SharedClock, SharedSpawner};
use crate::transport::{ByteStream, SharedConnector};

use super::path::{same_slash16, share_family, PathSelector, Position};

/// Attempts before a build is declared failed.
const MAX_BUILD_ATTEMPTS: usize = 10;
/// Middle/exit combinations tried per attempt before giving up on the
/// selection (fresh randomness each time).
const MAX_PATH_TRIES: usize = 8;

pub struct CircuitBuilder {
    connector: SharedConnector,
    snowflake_url: String,
    clock: SharedClock,
    spawner: SharedSpawner,
    directory: Rc<DirectoryClient>,
    connection_timeout_ms: u64,
    circuit_timeout_ms: u64,
    channel: RefCell<Option<Channel>>,
    dir_circuit: RefCell<Option<Circuit>>,
    bridge_target: RefCell<Option<HopTarget>>,
}

impl CircuitBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: SharedConnector,
        snowflake_url: String,
        clock: SharedClock,
        spawner: SharedSpawner,
        directory: Rc<DirectoryClient>,
        connection_timeout_ms: u64,
        circuit_timeout_ms: u64,
    ) -> Self {
        Self {
            connector,
            snowflake_url,
            clock,
            spawner,
            directory,
            connection_timeout_ms,
            circuit_timeout_ms,
            channel: RefCell::new(None),
            dir_circuit: RefCell::new(None),
            bridge_target: RefCell::new(None),
        }
    }

    pub fn directory(&self) -> &Rc<DirectoryClient> {
        &self.directory
    }

    /// A one-hop directory circuit on the current link (used by callers
    /// that need directory access outside a build).
    pub async fn directory_circuit(&self) -> Result<Circuit> {
        let channel = self.ensure_channel(&CancelToken::new()).await?;
        self.ensure_dir_circuit(&channel).await
    }

    /// Build a generic three-hop circuit (any `Exit`-flagged exit).
    pub async fn build(&self, cancel: &CancelToken) -> Result<Circuit> {
        self.build_for_port(None, cancel).await
    }

    /// Build a three-hop circuit, retrying with fresh path selection.
    /// With `exit_port` set, only exits whose port summary accepts that
    /// port are used; without one, the `Exit` flag is enough. Each
    /// attempt runs under its own deadline; `cancel` aborts the whole
    /// build.
    pub async fn build_for_port(
        &self,
        exit_port: Option<u16>,
        cancel: &CancelToken,
    ) -> Result<Circuit> {
        let mut last_error = TorError::AllAttemptsExhausted(0);
        for attempt in 0..MAX_BUILD_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(TorError::Cancelled);
            }
            let deadline = self.clock.now_ms() + self.circuit_timeout_ms;
            match with_deadline(&self.clock, cancel, deadline, self.try_build(exit_port)).await {
                Ok(circuit) => {
                    log::info!(
                        "circuit {} built on attempt {}",
                        circuit.id(),
                        attempt + 1
                    );
                    return Ok(circuit);
                }
                Err(TorError::Cancelled) => return Err(TorError::Cancelled),
                Err(e) => {
                    log::warn!("circuit build attempt {} failed: {e}", attempt + 1);
                    if e.is_fatal() {
                        // The link cannot be trusted; drop it before the
                        // error surfaces.
                        self.drop_link();
                        return Err(e);
                    }
                    last_error = e;
                }
            }
        }
        log::error!("all {MAX_BUILD_ATTEMPTS} circuit build attempts failed: {last_error}");
        Err(TorError::AllAttemptsExhausted(MAX_BUILD_ATTEMPTS))
    }

    async fn try_build(&self, exit_port: Option<u16>) -> Result<Circuit> {
        let channel = self.ensure_channel(&CancelToken::new()).await?;
        let dir_circuit = self.ensure_dir_circuit(&channel).await?;
        let guard = self.ensure_bridge_target(&channel, &dir_circuit).await?;
        let consensus = self.directory.get_consensus(&dir_circuit).await?;
        let selector = PathSelector::new(Rc::clone(&consensus));

        let mut rng = OsRng;
        let mut last_error = TorError::Directory("no path tried".into());
        for _ in 0..MAX_PATH_TRIES {
            let middle = selector.pick(&mut rng, Position::Middle, &[])?;
            if conflicts_with_guard(&guard, &middle) {
                continue;
            }
            let exit = selector.pick(&mut rng, Position::Exit, &[&middle])?;
            if conflicts_with_guard(&guard, &exit) {
                continue;
            }

            let mds = self
                .directory
                .get_microdescs(
                    &dir_circuit,
                    &[middle.microdesc_hash.clone(), exit.microdesc_hash.clone()],
                )
                .await?;
            let (Some(middle_md), Some(exit_md)) = (
                mds.get(&middle.microdesc_hash),
                mds.get(&exit.microdesc_hash),
            ) else {
                last_error = TorError::Directory("microdescs not served".into());
                continue;
            };

            // Family constraints, now that declarations are in hand.
            if share_family(&middle.rsa_id, middle_md, &exit.rsa_id, exit_md) {
                log::debug!("{} and {} share a family", middle.nickname, exit.nickname);
                continue;
            }
            let guard_hex = hex::encode_upper(guard.rsa_id);
            if middle_md.family.contains(&guard_hex) || exit_md.family.contains(&guard_hex) {
                continue;
            }

            // A concrete destination must clear the exit's port summary;
            // generic builds take any Exit-flagged relay.
            if let (Some(port), Some(policy)) = (exit_port, exit_md.port_policy.as_ref()) {
                if !policy.allows_port(port) {
                    log::debug!("{} rejects port {port}, re-picking exit", exit.nickname);
                    last_error = TorError::Directory(format!(
                        "exit {} rejects port {port}",
                        exit.nickname
                    ));
                    continue;
                }
            }

            let middle_target = hop_target(&middle, middle_md);
            let exit_target = hop_target(&exit, exit_md);

            log::info!(
                "building path {} -> {} -> {}",
                guard.nickname,
                middle.nickname,
                exit.nickname
            );
            // The guard closes the half-built circuit if this future is
            // dropped mid-extension (deadline, cancellation).
            let provisional =
                Provisional::new(Circuit::new(channel.clone(), self.clock.now_ms(), &self.spawner));
            let built = async {
                provisional.circuit().create_first_hop(&guard).await?;
                provisional.circuit().extend(&middle_target).await?;
                provisional.circuit().extend(&exit_target).await?;
                Ok(())
            }
            .await;
            match built {
                Ok(()) => return Ok(provisional.take()),
                Err(e) => {
                    // A failed extension poisons the whole circuit.
                    drop(provisional);
                    if matches!(e, TorError::InvalidNtorAuth) {
                        return Err(e);
                    }
                    last_error = e;
                }
            }
        }
        Err(TorError::ExtendFailed(format!(
            "no viable path after {MAX_PATH_TRIES} tries: {last_error}"
        )))
    }

    /// Reuse the live link or establish a fresh one through the bridge.
    async fn ensure_channel(&self, cancel: &CancelToken) -> Result<Channel> {
        if let Some(channel) = self.channel.borrow().as_ref() {
            if !channel.is_closed() {
                return Ok(channel.clone());
            }
        }
        self.drop_link();

        log::info!("connecting to snowflake bridge");
        let deadline = self.clock.now_ms() + self.connection_timeout_ms;
        let channel = with_deadline(&self.clock, cancel, deadline, async {
            let stream = self.connector.connect(&self.snowflake_url).await?;
            // The tunnel peer's address is unknown until its descriptor
            // is fetched; NETINFO carries the unspecified address.
            establish_link(
                stream,
                Ipv4Addr::UNSPECIFIED,
                None,
                self.clock.now_ms(),
                &self.spawner,
            )
            .await
        })
        .await?;

        *self.channel.borrow_mut() = Some(channel.clone());
        Ok(channel)
    }

    async fn ensure_dir_circuit(&self, channel: &Channel) -> Result<Circuit> {
        if let Some(circuit) = self.dir_circuit.borrow().as_ref() {
            if !circuit.is_closed() {
                return Ok(circuit.clone());
            }
        }
        let provisional =
            Provisional::new(Circuit::new(channel.clone(), self.clock.now_ms(), &self.spawner));
        provisional.circuit().create_fast_first_hop().await?;
        let circuit = provisional.take();
        *self.dir_circuit.borrow_mut() = Some(circuit.clone());
        Ok(circuit)
    }

    /// Fetch the bridge's own descriptor for its ntor key, pinning the
    /// identity the link handshake proved.
    async fn ensure_bridge_target(
        &self,
        channel: &Channel,
        dir_circuit: &Circuit,
    ) -> Result<HopTarget> {
        if let Some(target) = self.bridge_target.borrow().as_ref() {
            return Ok(target.clone());
        }

        let mut stream = dir_circuit.open_dir_stream().await?;
        let response =
            http::request(&mut stream, "GET", "localhost", "/tor/server/authority.z", &[], None)
                .await?;
        let _ = stream.close().await;
        if response.status != 200 {
            return Err(TorError::Directory(format!(
                "bridge descriptor fetch returned {}",
                response.status
            )));
        }
        let text = String::from_utf8(response.decoded_body()?)
            .map_err(|e| TorError::Directory(format!("descriptor not UTF-8: {e}")))?;
        let mut target = parse_server_descriptor(&text)?;

        let link_identity = channel.peer_identity().rsa_fingerprint;
        if target.rsa_id != link_identity {
            return Err(TorError::InvalidCert(
                "bridge descriptor identity does not match link identity".into(),
            ));
        }
        target.nickname = format!("bridge-{}", target.nickname);

        *self.bridge_target.borrow_mut() = Some(target.clone());
        Ok(target)
    }

    fn drop_link(&self) {
        if let Some(channel) = self.channel.borrow_mut().take() {
            channel.close();
        }
        *self.dir_circuit.borrow_mut() = None;
        *self.bridge_target.borrow_mut() = None;
    }

    /// Tear down the link and everything riding it.
    pub fn close(&self) {
        self.drop_link();
    }
}

/// RAII over a circuit under construction: closed on drop unless taken.
struct Provisional {
    circuit: Option<Circuit>,
}

impl Provisional {
    fn new(circuit: Circuit) -> Self {
        Self {
            circuit: Some(circuit),
        }
    }

    fn circuit(&self) -> &Circuit {
        self.circuit.as_ref().expect("not yet taken")
    }

    fn take(mut self) -> Circuit {
        self.circuit.take().expect("not yet taken")
    }
}

impl Drop for Provisional {
    fn drop(&mut self) {
        if let Some(circuit) = self.circuit.take() {
            circuit.close();
        }
    }
}

fn conflicts_with_guard(guard: &HopTarget, candidate: &RelayEntry) -> bool {
    candidate.rsa_id == guard.rsa_id
        || (!guard.ipv4.is_unspecified() && same_slash16(guard.ipv4, candidate.ipv4))
}

fn hop_target(entry: &RelayEntry, md: &crate::directory::microdesc::Microdesc) -> HopTarget {
    HopTarget {
        nickname: entry.nickname.clone(),
        rsa_id: entry.rsa_id,
        ntor_onion_key: md.ntor_onion_key,
        ed25519_id: md.ed25519_id,
        ipv4: entry.ipv4,
        or_port: entry.or_port,
        port_policy: md.port_policy.clone(),
    }
}

/// Minimal server-descriptor parse: enough for a bridge's self-serve
/// descriptor (`router`, `fingerprint`, `ntor-onion-key`,
/// `master-key-ed25519`).
pub fn parse_server_descriptor(text: &str) -> Result<HopTarget> {
    use base64::Engine;

    let mut nickname = String::new();
    let mut ipv4 = Ipv4Addr::UNSPECIFIED;
    let mut or_port = 0u16;
    let mut rsa_id: Option<[u8; 20]> = None;
    let mut ntor_key: Option<[u8; 32]> = None;
    let mut ed_id: Option<[u8; 32]> = None;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("router ") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 3 {
                nickname = parts[0].to_string();
                ipv4 = parts[1].parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
                or_port = parts[2].parse().unwrap_or(0);
            }
        } else if let Some(rest) = line.strip_prefix("fingerprint ") {
            let joined: String = rest.split_whitespace().collect();
            if let Ok(bytes) = hex::decode(&joined) {
                rsa_id = bytes.try_into().ok();
            }
        } else if let Some(rest) = line.strip_prefix("ntor-onion-key ") {
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD_NO_PAD
                .decode(rest.trim().trim_end_matches('='))
            {
                ntor_key = bytes.try_into().ok();
            }
        } else if let Some(rest) = line.strip_prefix("master-key-ed25519 ") {
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD_NO_PAD
                .decode(rest.trim().trim_end_matches('='))
            {
                ed_id = bytes.try_into().ok();
            }
        }
    }

    Ok(HopTarget {
        nickname,
        rsa_id: rsa_id
            .ok_or_else(|| TorError::Directory("descriptor missing fingerprint".into()))?,
        ntor_onion_key: ntor_key
            .ok_or_else(|| TorError::Directory("descriptor missing ntor-onion-key".into()))?,
        ed25519_id: ed_id,
        ipv4,
        or_port,
        port_policy: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_descriptor_parses() {
        let text = "router SnowBridge 203.0.113.7 9001 0 0\n\
                    fingerprint D586 D183 09DE D4CD 6D57 C18F DB97 EFA9 6D33 0566\n\
                    master-key-ed25519 AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\n\
                    ntor-onion-key mRGHIg9BEhT1j4Xym7vyqkqAls3ZMnwL3rL3S1zEqkY\n\
                    reject *:*\n";
        let target = parse_server_descriptor(text).unwrap();
        assert_eq!(target.nickname, "SnowBridge");
        assert_eq!(target.ipv4, "203.0.113.7".parse::<Ipv4Addr>().unwrap());
        assert_eq!(target.or_port, 9001);
        assert_eq!(
            hex::encode_upper(target.rsa_id),
            "D586D18309DED4CD6D57C18FDB97EFA96D330566"
        );
        assert_eq!(target.ed25519_id, Some([0u8; 32]));
    }

    #[test]
    fn descriptor_without_ntor_key_fails() {
        let text = "router X 1.2.3.4 9001 0 0\n\
                    fingerprint AAAA AAAA AAAA AAAA AAAA AAAA AAAA AAAA AAAA AAAA\n";
        assert!(parse_server_descriptor(text).is_err());
    }

    #[test]
    fn guard_conflicts() {
        let guard = HopTarget {
            nickname: "g".into(),
            rsa_id: [1; 20],
            ntor_onion_key: [0; 32],
            ed25519_id: None,
            ipv4: "10.1.0.1".parse().unwrap(),
            or_port: 9001,
            port_policy: None,
        };
        let mut relay = RelayEntry {
            nickname: "m".into(),
            rsa_id: [2; 20],
            ipv4: "10.1.200.200".parse().unwrap(),
            or_port: 443,
            dir_port: 0,
            ipv6: None,
            microdesc_hash: "h".into(),
            flags: Default::default(),
            protocols: None,
            bandwidth: 1,
        };
        assert!(conflicts_with_guard(&guard, &relay)); // same /16
        relay.ipv4 = "10.9.0.1".parse().unwrap();
        assert!(!conflicts_with_guard(&guard, &relay));
        relay.rsa_id = [1; 20];
        assert!(conflicts_with_guard(&guard, &relay));
    }
}

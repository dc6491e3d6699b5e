//! Microdescriptor parsing and caching.
//!
//! A microdesc carries the per-relay cryptographic material the consensus
//! only references by hash: the ntor onion key, the ed25519 identity, and
//! the exit port summary. Bodies are fetched in batches from
//! `/tor/micro/d/<hash>-<hash>...` and must hash (SHA-256, base64
//! unpadded) to the reference in the consensus `m` line.

use base64::Engine;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Result, TorError};
use crate::storage::{microdesc_key, SharedStorage};

/// Exit port summary from the microdesc `p` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortPolicy {
    Accept(Vec<(u16, u16)>),
    Reject(Vec<(u16, u16)>),
}

impl PortPolicy {
    pub fn parse(rest: &str) -> Option<Self> {
        let rest = rest.trim();
        let (kind, list) = rest.split_once(' ')?;
        let mut ranges = Vec::new();
        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (lo.parse().ok()?, hi.parse().ok()?),
                None => {
                    let p: u16 = part.parse().ok()?;
                    (p, p)
                }
            };
            ranges.push((lo, hi));
        }
        match kind {
            "accept" => Some(PortPolicy::Accept(ranges)),
            "reject" => Some(PortPolicy::Reject(ranges)),
            _ => None,
        }
    }

    pub fn allows_port(&self, port: u16) -> bool {
        let contains = |ranges: &[(u16, u16)]| ranges.iter().any(|&(lo, hi)| lo <= port && port <= hi);
        match self {
            PortPolicy::Accept(ranges) => contains(ranges),
            PortPolicy::Reject(ranges) => !contains(ranges),
        }
    }
}

/// Parsed microdescriptor body.
#[derive(Debug, Clone)]
pub struct Microdesc {
    /// Base64 (unpadded) SHA-256 of the body text: the consensus ref.
    pub hash: String,
    pub ntor_onion_key: [u8; 32],
    pub ed25519_id: Option<[u8; 32]>,
    pub port_policy: Option<PortPolicy>,
    /// Declared family members (`$FINGERPRINT` entries, uppercased hex).
    pub family: Vec<String>,
    /// Exact body text, for persisting.
    pub raw: String,
}

impl Microdesc {
    /// Parse one microdesc body (from `onion-key` through the last of
    /// its lines) and compute its hash.
    pub fn parse(body: &str) -> Result<Self> {
        if !body.starts_with("onion-key") {
            return Err(TorError::Directory("microdesc does not start with onion-key".into()));
        }
        let hash = base64::engine::general_purpose::STANDARD_NO_PAD
            .encode(Sha256::digest(body.as_bytes()));

        let mut ntor_onion_key = None;
        let mut ed25519_id = None;
        let mut port_policy = None;
        let mut family = Vec::new();
        for line in body.lines() {
            if let Some(rest) = line.strip_prefix("ntor-onion-key ") {
                let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
                    .decode(rest.trim().trim_end_matches('='))
                    .map_err(|_| TorError::Directory("bad ntor-onion-key base64".into()))?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| TorError::Directory("ntor-onion-key is not 32 bytes".into()))?;
                ntor_onion_key = Some(bytes);
            } else if let Some(rest) = line.strip_prefix("id ed25519 ") {
                if let Ok(bytes) = base64::engine::general_purpose::STANDARD_NO_PAD
                    .decode(rest.trim().trim_end_matches('='))
                {
                    if let Ok(bytes) = <[u8; 32]>::try_from(bytes) {
                        ed25519_id = Some(bytes);
                    }
                }
            } else if let Some(rest) = line.strip_prefix("p ") {
                port_policy = PortPolicy::parse(rest);
            } else if let Some(rest) = line.strip_prefix("family ") {
                family = rest
                    .split_whitespace()
                    .filter_map(|m| m.strip_prefix('$'))
                    .map(|fp| fp.to_uppercase())
                    .collect();
            }
        }

        Ok(Self {
            hash,
            ntor_onion_key: ntor_onion_key
                .ok_or_else(|| TorError::Directory("microdesc missing ntor-onion-key".into()))?,
            ed25519_id,
            port_policy,
            family,
            raw: body.to_string(),
        })
    }

    /// Split a concatenated fetch response into individual bodies; each
    /// starts at an `onion-key` line.
    pub fn split_bodies(text: &str) -> Vec<String> {
        let mut bodies = Vec::new();
        let mut current = String::new();
        for line in text.lines() {
            if line.trim_end() == "onion-key" && !current.is_empty() {
                bodies.push(std::mem::take(&mut current));
            }
            current.push_str(line);
            current.push('\n');
        }
        if !current.is_empty() {
            bodies.push(current);
        }
        bodies
    }
}

/// Cache of microdesc bodies keyed by their consensus hash.
pub struct MicrodescCache {
    storage: SharedStorage,
    entries: RefCell<HashMap<String, Rc<Microdesc>>>,
}

impl MicrodescCache {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            entries: RefCell::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, hash: &str) -> Option<Rc<Microdesc>> {
        self.entries.borrow().get(hash).cloned()
    }

    /// Check storage for a body we fetched in an earlier session.
    pub async fn load(&self, hash: &str) -> Result<Option<Rc<Microdesc>>> {
        if let Some(hit) = self.lookup(hash) {
            return Ok(Some(hit));
        }
        if let Some(bytes) = self.storage.read(&microdesc_key(hash)).await? {
            let text = String::from_utf8_lossy(&bytes);
            match Microdesc::parse(&text) {
                Ok(md) if md.hash == hash => {
                    let md = Rc::new(md);
                    self.entries
                        .borrow_mut()
                        .insert(hash.to_string(), Rc::clone(&md));
                    return Ok(Some(md));
                }
                _ => {
                    log::warn!("dropping corrupt cached microdesc {hash}");
                    self.storage.remove(&microdesc_key(hash)).await?;
                }
            }
        }
        Ok(None)
    }

    /// Verify a freshly fetched body against its expected hash, then
    /// cache and persist it.
    pub async fn put_verified(&self, expected_hash: &str, body: &str) -> Result<Rc<Microdesc>> {
        let md = Microdesc::parse(body)?;
        if md.hash != expected_hash {
            return Err(TorError::MicrodescHashMismatch(expected_hash.to_string()));
        }
        self.storage
            .write(&microdesc_key(expected_hash), body.as_bytes())
            .await?;
        let md = Rc::new(md);
        self.entries
            .borrow_mut()
            .insert(expected_hash.to_string(), Rc::clone(&md));
        Ok(md)
    }

    /// Drop bodies that no current consensus references.
    pub async fn retain_referenced(&self, referenced: &std::collections::HashSet<String>) -> Result<()> {
        self.entries
            .borrow_mut()
            .retain(|hash, _| referenced.contains(hash));
        for key in self.storage.list("microdesc:").await? {
            let hash = key.trim_start_matches("microdesc:");
            if !referenced.contains(hash) {
                self.storage.remove(&key).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_docs {
    /// Build a microdesc body carrying the given ntor key.
    pub fn body_with_ntor(ntor_key: &[u8; 32], policy: Option<&str>) -> String {
        use base64::Engine;
        let mut body = String::from(
            "onion-key\n-----BEGIN RSA PUBLIC KEY-----\nMIGJAoGBAMibyQ\n-----END RSA PUBLIC KEY-----\n",
        );
        body.push_str(&format!(
            "ntor-onion-key {}\n",
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(ntor_key)
        ));
        if let Some(p) = policy {
            body.push_str(&format!("p {p}\n"));
        }
        body.push_str("id ed25519 AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\n");
        body
    }
}

#[cfg(test)]
mod tests {
    use super::test_docs::body_with_ntor;
    use super::*;
    use crate::storage::MemoryStorage;
    use futures::executor::block_on;

    #[test]
    fn parse_extracts_keys_and_policy() {
        let body = body_with_ntor(&[7u8; 32], Some("accept 80,443,8000-9000"));
        let md = Microdesc::parse(&body).unwrap();
        assert_eq!(md.ntor_onion_key, [7u8; 32]);
        assert_eq!(md.ed25519_id, Some([0u8; 32]));

        let policy = md.port_policy.unwrap();
        assert!(policy.allows_port(443));
        assert!(policy.allows_port(8500));
        assert!(!policy.allows_port(25));
    }

    #[test]
    fn reject_policy() {
        let policy = PortPolicy::parse("reject 25,119,135-139").unwrap();
        assert!(!policy.allows_port(25));
        assert!(!policy.allows_port(137));
        assert!(policy.allows_port(443));
    }

    #[test]
    fn hash_is_sha256_of_body() {
        let body = body_with_ntor(&[1u8; 32], None);
        let md = Microdesc::parse(&body).unwrap();
        let expected = base64::engine::general_purpose::STANDARD_NO_PAD
            .encode(Sha256::digest(body.as_bytes()));
        assert_eq!(md.hash, expected);
    }

    #[test]
    fn split_concatenated_bodies() {
        let a = body_with_ntor(&[1u8; 32], None);
        let b = body_with_ntor(&[2u8; 32], Some("accept 443"));
        let joined = format!("{a}{b}");
        let bodies = Microdesc::split_bodies(&joined);
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0], a);
        assert_eq!(bodies[1], b);
    }

    #[test]
    fn cache_rejects_wrong_hash() {
        let storage: crate::storage::SharedStorage = Rc::new(MemoryStorage::new());
        let cache = MicrodescCache::new(storage);
        let body = body_with_ntor(&[3u8; 32], None);
        block_on(async {
            let err = cache.put_verified("bogus-hash", &body).await.unwrap_err();
            assert!(matches!(err, TorError::MicrodescHashMismatch(_)));
            assert!(cache.lookup("bogus-hash").is_none());
        });
    }

    #[test]
    fn cache_round_trips_through_storage() {
        let storage: crate::storage::SharedStorage = Rc::new(MemoryStorage::new());
        let body = body_with_ntor(&[4u8; 32], None);
        let hash = Microdesc::parse(&body).unwrap().hash;
        block_on(async {
            {
                let cache = MicrodescCache::new(Rc::clone(&storage));
                cache.put_verified(&hash, &body).await.unwrap();
            }
            // A fresh cache (new session) finds it in storage.
            let cache = MicrodescCache::new(storage);
            assert!(cache.lookup(&hash).is_none());
            let loaded = cache.load(&hash).await.unwrap().unwrap();
            assert_eq!(loaded.ntor_onion_key, [4u8; 32]);
        });
    }
}

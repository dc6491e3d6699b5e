//! Directory subsystem: consensus, authority certificates, microdescs.
//!
//! [`DirectoryClient`] owns the caches and drives fetches over whatever
//! circuit the caller provides (one BEGIN_DIR stream per request,
//! `Connection: close`). Consensus retrieval prefers the diff path: every
//! cached consensus's signed-prefix digest is offered in
//! `X-Or-Diff-From-Consensus`, and 304/diff/full responses are all
//! handled. Documents never become visible until their signatures meet
//! the authority quorum.

pub mod authority;
pub mod consensus;
pub mod diff;
pub mod microdesc;
pub mod verify;

use futures::channel::oneshot;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::error::{Result, TorError};
use crate::http;
use crate::protocol::Circuit;
use crate::runtime::SharedClock;
use crate::storage::{consensus_key, SharedStorage};
use crate::transport::ByteStream;

use authority::{AuthorityCert, CertificateCache};
use consensus::ConsensusDocument;
use diff::{looks_like_diff, ConsensusDiff};
use microdesc::{Microdesc, MicrodescCache};

const CONSENSUS_PATH: &str = "/tor/status-vote/current/consensus-microdesc.z";

pub struct DirectoryClient {
    storage: SharedStorage,
    clock: SharedClock,
    pub certs: CertificateCache,
    pub microdescs: MicrodescCache,
    /// Valid cached consensuses, oldest first.
    cached: RefCell<Vec<Rc<ConsensusDocument>>>,
    storage_loaded: Cell<bool>,
    /// Joiners for an in-flight consensus fetch (keyed single-flight:
    /// there is one key for the consensus document).
    consensus_waiters: RefCell<Option<Vec<oneshot::Sender<Result<Rc<ConsensusDocument>>>>>>,
}

impl DirectoryClient {
    pub fn new(storage: SharedStorage, clock: SharedClock) -> Self {
        Self {
            certs: CertificateCache::new(Rc::clone(&storage)),
            microdescs: MicrodescCache::new(Rc::clone(&storage)),
            storage,
            clock,
            cached: RefCell::new(Vec::new()),
            storage_loaded: Cell::new(false),
            consensus_waiters: RefCell::new(None),
        }
    }

    /// The freshest cached consensus that is still fresh, if any.
    pub fn fresh_consensus(&self) -> Option<Rc<ConsensusDocument>> {
        let now = self.clock.now_ms();
        self.cached
            .borrow()
            .iter()
            .rev()
            .find(|c| c.is_fresh(now))
            .cloned()
    }

    /// Get a verified consensus, fetching (or diffing) over `circuit` if
    /// the cache has nothing fresh. Concurrent callers join the same
    /// fetch.
    pub async fn get_consensus(&self, circuit: &Circuit) -> Result<Rc<ConsensusDocument>> {
        self.ensure_storage_loaded().await?;
        if let Some(doc) = self.fresh_consensus() {
            return Ok(doc);
        }

        // Single-flight: second caller joins the first.
        let rx = {
            let mut waiters = self.consensus_waiters.borrow_mut();
            match waiters.as_mut() {
                Some(list) => {
                    let (tx, rx) = oneshot::channel();
                    list.push(tx);
                    Some(rx)
                }
                None => {
                    *waiters = Some(Vec::new());
                    None
                }
            }
        };
        if let Some(rx) = rx {
            return rx.await.map_err(|_| TorError::Cancelled)?;
        }

        // If the leading fetch is dropped mid-flight (deadline or
        // cancellation), joiners must not hang on a flight nobody is
        // flying.
        struct FlightGuard<'a>(&'a DirectoryClient);
        impl Drop for FlightGuard<'_> {
            fn drop(&mut self) {
                if let Some(waiters) = self.0.consensus_waiters.borrow_mut().take() {
                    for waiter in waiters {
                        let _ = waiter.send(Err(TorError::Cancelled));
                    }
                }
            }
        }
        let flight = FlightGuard(self);

        let outcome = self.fetch_consensus(circuit).await;
        if let Some(waiters) = self.consensus_waiters.borrow_mut().take() {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
        std::mem::forget(flight);
        outcome
    }

    async fn fetch_consensus(&self, circuit: &Circuit) -> Result<Rc<ConsensusDocument>> {
        let now = self.clock.now_ms();
        let known: Vec<(String, Rc<ConsensusDocument>)> = self
            .cached
            .borrow()
            .iter()
            .filter(|c| c.is_valid(now))
            .map(|c| (c.preimage_hash_hex(), Rc::clone(c)))
            .collect();

        let diff_header = known
            .iter()
            .map(|(hash, _)| hash.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        log::info!("fetching consensus ({} diff bases offered)", known.len());
        let mut stream = circuit.open_dir_stream().await?;
        let mut headers: Vec<(&str, &str)> = Vec::new();
        if !diff_header.is_empty() {
            headers.push(("X-Or-Diff-From-Consensus", diff_header.as_str()));
        }
        let response =
            http::request(&mut stream, "GET", "localhost", CONSENSUS_PATH, &headers, None).await?;
        let _ = stream.close().await;

        let doc = match response.status {
            304 => {
                // Nothing newer; the freshest valid base we offered wins.
                return known
                    .last()
                    .map(|(_, doc)| Rc::clone(doc))
                    .ok_or(TorError::NotModifiedNoBase);
            }
            200 => {
                let body = response.decoded_body()?;
                let text = String::from_utf8(body)
                    .map_err(|e| TorError::Directory(format!("consensus not UTF-8: {e}")))?;
                if looks_like_diff(response.header("content-type"), &text) {
                    let diff = ConsensusDiff::parse(&text)?;
                    let base = known
                        .iter()
                        .find(|(hash, _)| diff.applies_to(hash))
                        .map(|(_, doc)| doc)
                        .ok_or_else(|| TorError::DiffBaseUnknown(diff.from_hex.clone()))?;
                    log::info!("applying consensus diff against {}", &diff.from_hex[..16]);
                    let full = diff.apply(&base.full_text())?;
                    ConsensusDocument::parse(&full)?
                } else {
                    ConsensusDocument::parse(&text)?
                }
            }
            status => {
                return Err(TorError::Directory(format!(
                    "consensus fetch returned {status}"
                )))
            }
        };

        if !doc.is_valid(now) {
            return Err(TorError::ConsensusExpired);
        }

        // Gather signing certs and enforce the quorum before anything is
        // cached or trusted.
        let certs = self.collect_signing_certs(circuit, &doc).await?;
        verify::verify_consensus(&doc, &certs)?;

        let doc = Rc::new(doc);
        self.remember(Rc::clone(&doc)).await?;
        Ok(doc)
    }

    /// Fetch (or load) every signing cert the document's signatures name.
    async fn collect_signing_certs(
        &self,
        circuit: &Circuit,
        doc: &ConsensusDocument,
    ) -> Result<Vec<Rc<AuthorityCert>>> {
        let now = self.clock.now_ms();
        let mut found = Vec::new();
        for sig in &doc.signatures {
            if !authority::is_trusted_authority(&sig.identity) {
                continue;
            }
            if let Some(cert) = self
                .certs
                .get(&sig.identity, &sig.signing_key_digest, now)
                .await?
            {
                found.push(cert);
                continue;
            }
            match self.fetch_signing_cert(circuit, &sig.identity).await {
                Ok(cert) => {
                    if cert.signing_key_digest == sig.signing_key_digest {
                        found.push(cert);
                    } else {
                        log::warn!(
                            "authority {} served signing key {} but consensus wants {}",
                            sig.identity,
                            cert.signing_key_digest,
                            sig.signing_key_digest
                        );
                    }
                }
                Err(e) => log::warn!("fetching cert for {}: {e}", sig.identity),
            }
        }
        Ok(found)
    }

    async fn fetch_signing_cert(
        &self,
        circuit: &Circuit,
        identity: &str,
    ) -> Result<Rc<AuthorityCert>> {
        let path = format!("/tor/keys/fp/{identity}.z");
        let mut stream = circuit.open_dir_stream().await?;
        let response = http::request(&mut stream, "GET", "localhost", &path, &[], None).await?;
        let _ = stream.close().await;
        if response.status != 200 {
            return Err(TorError::Directory(format!(
                "cert fetch for {identity} returned {}",
                response.status
            )));
        }
        let text = String::from_utf8(response.decoded_body()?)
            .map_err(|e| TorError::Directory(format!("cert not UTF-8: {e}")))?;
        let cert = AuthorityCert::parse(&text)?;
        if !cert.identity_fingerprint.eq_ignore_ascii_case(identity) {
            return Err(TorError::InvalidCert(format!(
                "requested cert for {identity}, got {}",
                cert.identity_fingerprint
            )));
        }
        if cert.is_expired(self.clock.now_ms()) {
            return Err(TorError::CertificateExpired(identity.to_string()));
        }
        let cert = Rc::new(cert);
        self.certs.put(Rc::clone(&cert)).await?;
        Ok(cert)
    }

    /// Resolve microdescs for the given consensus refs, fetching missing
    /// bodies in one batch.
    pub async fn get_microdescs(
        &self,
        circuit: &Circuit,
        hashes: &[String],
    ) -> Result<HashMap<String, Rc<Microdesc>>> {
        let mut out = HashMap::new();
        let mut missing = Vec::new();
        for hash in hashes {
            match self.microdescs.load(hash).await? {
                Some(md) => {
                    out.insert(hash.clone(), md);
                }
                None => missing.push(hash.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }

        let path = format!("/tor/micro/d/{}.z", missing.join("-"));
        log::debug!("fetching {} microdescs", missing.len());
        let mut stream = circuit.open_dir_stream().await?;
        let response = http::request(&mut stream, "GET", "localhost", &path, &[], None).await?;
        let _ = stream.close().await;
        if response.status != 200 {
            return Err(TorError::Directory(format!(
                "microdesc fetch returned {}",
                response.status
            )));
        }
        let text = String::from_utf8(response.decoded_body()?)
            .map_err(|e| TorError::Directory(format!("microdescs not UTF-8: {e}")))?;

        let wanted: HashSet<&String> = missing.iter().collect();
        for body in Microdesc::split_bodies(&text) {
            match Microdesc::parse(&body) {
                Ok(md) if wanted.contains(&md.hash) => {
                    let hash = md.hash.clone();
                    let md = self.microdescs.put_verified(&hash, &body).await?;
                    out.insert(hash, md);
                }
                Ok(md) => log::debug!("unrequested microdesc {} ignored", md.hash),
                Err(e) => log::debug!("skipping unparseable microdesc: {e}"),
            }
        }
        Ok(out)
    }

    /// Cache a verified consensus in memory and storage, pruning expired
    /// material.
    async fn remember(&self, doc: Rc<ConsensusDocument>) -> Result<()> {
        let now = self.clock.now_ms();
        self.storage
            .write(&consensus_key(&doc.valid_after_iso), doc.full_text().as_bytes())
            .await?;

        {
            let mut cached = self.cached.borrow_mut();
            cached.retain(|c| c.is_valid(now) && c.valid_after_ms != doc.valid_after_ms);
            cached.push(doc);
            cached.sort_by_key(|c| c.valid_after_ms);
        }

        // Drop expired documents from storage too.
        let live: HashSet<String> = self
            .cached
            .borrow()
            .iter()
            .map(|c| consensus_key(&c.valid_after_iso))
            .collect();
        for key in self.storage.list("consensus:").await? {
            if !live.contains(&key) {
                self.storage.remove(&key).await?;
            }
        }
        Ok(())
    }

    async fn ensure_storage_loaded(&self) -> Result<()> {
        if self.storage_loaded.get() {
            return Ok(());
        }
        self.storage_loaded.set(true);
        let now = self.clock.now_ms();
        for key in self.storage.list("consensus:").await? {
            let Some(bytes) = self.storage.read(&key).await? else {
                continue;
            };
            let text = String::from_utf8_lossy(&bytes);
            match ConsensusDocument::parse(&text) {
                Ok(doc) if doc.is_valid(now) => {
                    self.cached.borrow_mut().push(Rc::new(doc));
                }
                Ok(_) => {
                    self.storage.remove(&key).await?;
                }
                Err(e) => {
                    log::warn!("dropping unparseable cached consensus {key}: {e}");
                    self.storage.remove(&key).await?;
                }
            }
        }
        self.cached.borrow_mut().sort_by_key(|c| c.valid_after_ms);
        log::debug!(
            "loaded {} cached consensuses from storage",
            self.cached.borrow().len()
        );
        Ok(())
    }

    /// Seed the in-memory cache directly (tests and embedders with their
    /// own bootstrap path).
    pub fn seed_consensus(&self, doc: Rc<ConsensusDocument>) {
        self.storage_loaded.set(true);
        let mut cached = self.cached.borrow_mut();
        cached.push(doc);
        cached.sort_by_key(|c| c.valid_after_ms);
    }
}

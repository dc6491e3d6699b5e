//! Directory authorities and their signing certificates.
//!
//! The trusted authority identities are pinned here, as shipped clients
//! do. Signing certificates (`dir-key-certificate-version 3` documents)
//! are fetched on demand, verified against the identity key they claim,
//! and cached keyed by `(identity, signing-key-digest)`; one authority
//! may have several live signing keys.

use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest, Sha1};
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Result, TorError};
use crate::storage::{cert_key, SharedStorage};

use super::consensus::parse_timestamp_ms;

/// One pinned directory authority.
#[derive(Debug, Clone, Copy)]
pub struct TrustedAuthority {
    pub name: &'static str,
    /// v3 identity fingerprint (hex, uppercase).
    pub v3ident: &'static str,
}

/// The hardcoded authority set (from tor's auth_dirs.inc).
pub const DIRECTORY_AUTHORITIES: &[TrustedAuthority] = &[
    TrustedAuthority { name: "moria1", v3ident: "D586D18309DED4CD6D57C18FDB97EFA96D330566" },
    TrustedAuthority { name: "tor26", v3ident: "14C131DFC5C6F93646BE72FA1401C02A8DF2E8B4" },
    TrustedAuthority { name: "dizum", v3ident: "E8A9C45EDE6D711294FADF8E7951F4DE6CA56B58" },
    TrustedAuthority { name: "gabelmoo", v3ident: "ED03BB616EB2F60BEC80151114BB25CEF515B226" },
    TrustedAuthority { name: "dannenberg", v3ident: "0232AF901C31A04EE9848595AF9BB7620D4C5B2E" },
    TrustedAuthority { name: "maatuska", v3ident: "49015F787433103580E3B66A1707A00E60F2D15B" },
    TrustedAuthority { name: "Faravahar", v3ident: "EFCBE720AB3A82B99F9E953CD5BF50F7EEFC7B97" },
    TrustedAuthority { name: "longclaw", v3ident: "23D15D965BC35114467363C165C4F724B64B4F66" },
    TrustedAuthority { name: "bastet", v3ident: "27102BC123E7AF1D4741AE047E160C91ADC76B21" },
];

/// Is this identity fingerprint one of the pinned authorities?
pub fn is_trusted_authority(identity: &str) -> bool {
    let normalized = identity.to_uppercase();
    DIRECTORY_AUTHORITIES
        .iter()
        .any(|a| a.v3ident == normalized)
}

/// A parsed and self-consistent authority signing certificate.
#[derive(Clone)]
pub struct AuthorityCert {
    /// Authority identity fingerprint (hex, uppercase).
    pub identity_fingerprint: String,
    /// SHA-1 of the signing key's DER (hex, uppercase); consensuses name
    /// the signing key they were made with by this digest.
    pub signing_key_digest: String,
    pub published_ms: u64,
    pub expires_ms: u64,
    pub identity_key: RsaPublicKey,
    pub signing_key: RsaPublicKey,
    /// Original document text, for persisting.
    pub raw: String,
}

impl std::fmt::Debug for AuthorityCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityCert")
            .field("identity", &self.identity_fingerprint)
            .field("signing_key_digest", &self.signing_key_digest)
            .field("expires_ms", &self.expires_ms)
            .finish()
    }
}

impl AuthorityCert {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_ms
    }

    /// Parse a `dir-key-certificate-version 3` document and check its
    /// internal signatures: the certification (identity key over the
    /// document) and the cross-cert (signing key over the identity key
    /// digest). Both are Tor's raw unprefixed PKCS#1 v1.5.
    pub fn parse(text: &str) -> Result<Self> {
        if !text.starts_with("dir-key-certificate-version 3") {
            return Err(TorError::Directory("not a v3 key certificate".into()));
        }

        let fingerprint = keyword_arg(text, "fingerprint")
            .ok_or_else(|| TorError::Directory("key certificate missing fingerprint".into()))?
            .to_uppercase();
        let published_ms = parse_timestamp_ms(
            keyword_arg(text, "dir-key-published")
                .ok_or_else(|| TorError::Directory("missing dir-key-published".into()))?,
        )?;
        let expires_ms = parse_timestamp_ms(
            keyword_arg(text, "dir-key-expires")
                .ok_or_else(|| TorError::Directory("missing dir-key-expires".into()))?,
        )?;

        let identity_key = pem_rsa_key(text, "dir-identity-key")?;
        let signing_key = pem_rsa_key(text, "dir-signing-key")?;

        // Fingerprint must be the SHA-1 of the identity key.
        let identity_digest = rsa_der_sha1_hex(&identity_key)?;
        if identity_digest != fingerprint {
            return Err(TorError::InvalidCert(format!(
                "key certificate fingerprint {fingerprint} does not match identity key"
            )));
        }

        // Cross-cert: signing key signs the identity key digest.
        let crosscert = pem_object(text, "dir-key-crosscert", &["ID SIGNATURE", "SIGNATURE"])?;
        let identity_digest_raw = rsa_der_sha1(&identity_key)?;
        signing_key
            .verify(Pkcs1v15Sign::new_unprefixed(), &identity_digest_raw, &crosscert)
            .map_err(|_| TorError::InvalidSignature("authority cross-cert".into()))?;

        // Certification: identity key signs the document up through the
        // newline after dir-key-certification.
        const CERTIFICATION: &str = "dir-key-certification\n";
        let end = text
            .find(CERTIFICATION)
            .ok_or_else(|| TorError::Directory("missing dir-key-certification".into()))?
            + CERTIFICATION.len();
        let signed_digest: [u8; 20] = Sha1::digest(text[..end].as_bytes()).into();
        let certification = pem_object(text, "dir-key-certification", &["SIGNATURE"])?;
        identity_key
            .verify(Pkcs1v15Sign::new_unprefixed(), &signed_digest, &certification)
            .map_err(|_| TorError::InvalidSignature("authority key certification".into()))?;

        Ok(Self {
            identity_fingerprint: fingerprint,
            signing_key_digest: rsa_der_sha1_hex(&signing_key)?,
            published_ms,
            expires_ms,
            identity_key,
            signing_key,
            raw: text.to_string(),
        })
    }
}

fn keyword_arg<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        line.strip_prefix(keyword)
            .and_then(|rest| rest.strip_prefix(' '))
            .map(str::trim)
    })
}

fn rsa_der_sha1(key: &RsaPublicKey) -> Result<[u8; 20]> {
    let der = key
        .to_pkcs1_der()
        .map_err(|e| TorError::Internal(format!("encode RSA key: {e}")))?;
    Ok(Sha1::digest(der.as_bytes()).into())
}

fn rsa_der_sha1_hex(key: &RsaPublicKey) -> Result<String> {
    Ok(hex::encode_upper(rsa_der_sha1(key)?))
}

/// Extract the base64 body of the PEM-ish object following `keyword`.
fn pem_object(text: &str, keyword: &str, labels: &[&str]) -> Result<Vec<u8>> {
    use base64::Engine;
    let start = text
        .find(&format!("{keyword}\n"))
        .ok_or_else(|| TorError::Directory(format!("missing {keyword}")))?;
    let after = &text[start + keyword.len() + 1..];
    for label in labels {
        let begin = format!("-----BEGIN {label}-----\n");
        let end = format!("-----END {label}-----");
        if let Some(body_start) = after.find(&begin) {
            let body = &after[body_start + begin.len()..];
            let Some(body_end) = body.find(&end) else {
                continue;
            };
            let b64: String = body[..body_end].chars().filter(|c| !c.is_whitespace()).collect();
            return base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| TorError::Directory(format!("bad base64 in {keyword}: {e}")));
        }
    }
    Err(TorError::Directory(format!("no PEM object after {keyword}")))
}

fn pem_rsa_key(text: &str, keyword: &str) -> Result<RsaPublicKey> {
    let der = pem_object(text, keyword, &["RSA PUBLIC KEY"])?;
    RsaPublicKey::from_pkcs1_der(&der)
        .map_err(|e| TorError::Directory(format!("bad RSA key in {keyword}: {e}")))
}

/// In-memory LRU over the persisted certificate store.
pub struct CertificateCache {
    storage: SharedStorage,
    entries: RefCell<Vec<Rc<AuthorityCert>>>,
    max_cached: usize,
}

/// Default LRU capacity.
pub const DEFAULT_MAX_CACHED_CERTS: usize = 20;

impl CertificateCache {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            entries: RefCell::new(Vec::new()),
            max_cached: DEFAULT_MAX_CACHED_CERTS,
        }
    }

    /// Find a cert for `(identity, signing_key_digest)`, consulting
    /// memory first and then the store. Expired certs are dropped from
    /// both on sight.
    pub async fn get(
        &self,
        identity: &str,
        signing_key_digest: &str,
        now_ms: u64,
    ) -> Result<Option<Rc<AuthorityCert>>> {
        let identity = identity.to_uppercase();
        let skd = signing_key_digest.to_uppercase();

        // LRU hit: move to the back.
        let hit = {
            let mut entries = self.entries.borrow_mut();
            match entries.iter().position(|c| {
                c.identity_fingerprint == identity && c.signing_key_digest == skd
            }) {
                Some(pos) => {
                    let cert = entries.remove(pos);
                    if cert.is_expired(now_ms) {
                        None
                    } else {
                        entries.push(Rc::clone(&cert));
                        Some(cert)
                    }
                }
                None => None,
            }
        };
        if hit.is_some() {
            return Ok(hit);
        }

        let key = cert_key(&identity);
        if let Some(bytes) = self.storage.read(&key).await? {
            let text = String::from_utf8_lossy(&bytes);
            match AuthorityCert::parse(&text) {
                Ok(cert) if cert.is_expired(now_ms) => {
                    self.storage.remove(&key).await?;
                }
                Ok(cert) if cert.signing_key_digest == skd => {
                    let cert = Rc::new(cert);
                    self.insert(Rc::clone(&cert));
                    return Ok(Some(cert));
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("discarding unparseable cached cert {key}: {e}");
                    self.storage.remove(&key).await?;
                }
            }
        }
        Ok(None)
    }

    /// Add a verified cert to the cache and persist it.
    pub async fn put(&self, cert: Rc<AuthorityCert>) -> Result<()> {
        self.storage
            .write(&cert_key(&cert.identity_fingerprint), cert.raw.as_bytes())
            .await?;
        self.insert(cert);
        Ok(())
    }

    fn insert(&self, cert: Rc<AuthorityCert>) {
        let mut entries = self.entries.borrow_mut();
        entries.retain(|c| {
            !(c.identity_fingerprint == cert.identity_fingerprint
                && c.signing_key_digest == cert.signing_key_digest)
        });
        entries.push(cert);
        if entries.len() > self.max_cached {
            entries.remove(0);
        }
    }
}

//! CERTS cell parsing and link certificate chain verification.
//!
//! The guard proves its identity during the link handshake with a bundle
//! of certificates (tor-spec §4.2):
//!
//! - type 2: self-signed X.509 RSA-1024 identity certificate
//! - type 7: RSA→Ed25519 cross-certificate, binding the Ed25519 identity
//!   to the RSA identity with Tor's *unprefixed* PKCS#1 v1.5 signature
//!   over `SHA-256("Tor TLS RSA/Ed25519 cross-certificate" || body)`
//! - type 4: Ed25519 signing-key certificate, signed by the identity
//! - type 5: Ed25519 link certificate whose certified "key" is the
//!   SHA-256 of the peer's TLS leaf certificate
//!
//! All four links must check out, and the TLS binding must match the
//! certificate actually presented on the wire.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{Result, TorError};

/// Certificate types carried in a CERTS cell.
pub const CERT_TYPE_RSA_ID: u8 = 2;
pub const CERT_TYPE_ED_SIGNING: u8 = 4;
pub const CERT_TYPE_ED_LINK: u8 = 5;
pub const CERT_TYPE_RSA_CROSS: u8 = 7;

const CROSS_CERT_PREFIX: &[u8] = b"Tor TLS RSA/Ed25519 cross-certificate";

/// One entry of a CERTS cell.
#[derive(Debug, Clone)]
pub struct CertEntry {
    pub cert_type: u8,
    pub data: Vec<u8>,
}

/// Parsed CERTS cell payload: `N (1) || (type (1) || len (2) || data)*`.
#[derive(Debug)]
pub struct CertsCell {
    pub certs: Vec<CertEntry>,
}

impl CertsCell {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(TorError::InvalidCert("empty CERTS cell".into()));
        }
        let count = payload[0] as usize;
        let mut offset = 1;
        let mut certs = Vec::with_capacity(count);
        for i in 0..count {
            if offset + 3 > payload.len() {
                return Err(TorError::InvalidCert(format!(
                    "CERTS cell truncated at certificate {i}"
                )));
            }
            let cert_type = payload[offset];
            let len = u16::from_be_bytes([payload[offset + 1], payload[offset + 2]]) as usize;
            offset += 3;
            if offset + len > payload.len() {
                return Err(TorError::InvalidCert(format!(
                    "certificate {i} data truncated"
                )));
            }
            certs.push(CertEntry {
                cert_type,
                data: payload[offset..offset + len].to_vec(),
            });
            offset += len;
        }
        Ok(Self { certs })
    }

    pub fn get(&self, cert_type: u8) -> Option<&CertEntry> {
        self.certs.iter().find(|c| c.cert_type == cert_type)
    }
}

/// Identity established by a verified CERTS chain.
#[derive(Debug, Clone)]
pub struct VerifiedLinkIdentity {
    /// SHA-1 of the relay's DER-encoded RSA identity key.
    pub rsa_fingerprint: [u8; 20],
    pub ed25519_identity: [u8; 32],
    pub ed25519_signing_key: [u8; 32],
}

/// Verify the whole chain against the TLS leaf certificate presented on
/// the link. `now_ms` is Unix wall time for expiry checks.
pub fn verify_link_certs(
    cell: &CertsCell,
    tls_leaf_der: &[u8],
    now_ms: u64,
) -> Result<VerifiedLinkIdentity> {
    // 1. RSA identity: self-signed X.509, exactly 1024 bits.
    let rsa_entry = cell
        .get(CERT_TYPE_RSA_ID)
        .ok_or_else(|| TorError::InvalidCert("missing RSA identity certificate".into()))?;
    let identity_key = x509::verify_self_signed_rsa(&rsa_entry.data)?;
    if identity_key.size() != 128 {
        return Err(TorError::InvalidCert(format!(
            "RSA identity key is {} bits, expected 1024",
            identity_key.size() * 8
        )));
    }
    let rsa_fingerprint = rsa_key_fingerprint(&identity_key)?;

    // 2. Cross-cert: RSA identity vouches for the Ed25519 identity.
    let cross_entry = cell
        .get(CERT_TYPE_RSA_CROSS)
        .ok_or_else(|| TorError::InvalidCert("missing RSA cross-certificate".into()))?;
    let cross = RsaCrossCert::parse(&cross_entry.data)?;
    cross.check_signature(&identity_key)?;
    if cross.expiry_ms() <= now_ms {
        return Err(TorError::InvalidCert("RSA cross-certificate expired".into()));
    }
    let ed25519_identity = cross.ed_identity;

    // 3. Signing-key certificate, signed by the Ed25519 identity.
    let signing_entry = cell
        .get(CERT_TYPE_ED_SIGNING)
        .ok_or_else(|| TorError::InvalidCert("missing Ed25519 signing certificate".into()))?;
    let signing_cert = Ed25519Cert::parse(&signing_entry.data)?;
    signing_cert.check_signature(&ed25519_identity)?;
    if signing_cert.expiry_ms() <= now_ms {
        return Err(TorError::InvalidCert("signing certificate expired".into()));
    }
    let ed25519_signing_key = signing_cert.certified_key;

    // 4. Link certificate, signed by the signing key, binding the chain
    //    to the TLS leaf by hash.
    let link_entry = cell
        .get(CERT_TYPE_ED_LINK)
        .ok_or_else(|| TorError::InvalidCert("missing Ed25519 link certificate".into()))?;
    let link_cert = Ed25519Cert::parse(&link_entry.data)?;
    link_cert.check_signature(&ed25519_signing_key)?;
    if link_cert.expiry_ms() <= now_ms {
        return Err(TorError::InvalidCert("link certificate expired".into()));
    }
    let tls_digest: [u8; 32] = Sha256::digest(tls_leaf_der).into();
    if link_cert.certified_key != tls_digest {
        return Err(TorError::InvalidCert(
            "link certificate does not match TLS leaf certificate".into(),
        ));
    }

    log::debug!(
        "link certs verified, rsa id {}",
        hex::encode(rsa_fingerprint)
    );
    Ok(VerifiedLinkIdentity {
        rsa_fingerprint,
        ed25519_identity,
        ed25519_signing_key,
    })
}

/// SHA-1 over the PKCS#1 DER encoding of the key: the legacy relay id.
pub fn rsa_key_fingerprint(key: &RsaPublicKey) -> Result<[u8; 20]> {
    let der = key
        .to_pkcs1_der()
        .map_err(|e| TorError::Internal(format!("encode RSA key: {e}")))?;
    Ok(Sha1::digest(der.as_bytes()).into())
}

/// Tor's Ed25519 certificate format (cert-spec §2.1).
///
/// `VERSION (1) || CERT_TYPE (1) || EXPIRATION (4, hours) ||
///  CERT_KEY_TYPE (1) || CERTIFIED_KEY (32) || N_EXTENSIONS (1) ||
///  extensions || SIGNATURE (64)`; the signature covers everything before
/// itself.
#[derive(Debug, Clone)]
pub struct Ed25519Cert {
    pub cert_type: u8,
    pub expiration_hours: u32,
    pub cert_key_type: u8,
    pub certified_key: [u8; 32],
    /// Signing key carried in a signed-with extension, if present.
    pub signed_with: Option<[u8; 32]>,
    signed_text: Vec<u8>,
    signature: [u8; 64],
}

impl Ed25519Cert {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 104 {
            return Err(TorError::InvalidCert(format!(
                "ed25519 certificate too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != 0x01 {
            return Err(TorError::InvalidCert(format!(
                "unknown ed25519 certificate version {}",
                data[0]
            )));
        }
        let cert_type = data[1];
        let expiration_hours = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let cert_key_type = data[6];
        let mut certified_key = [0u8; 32];
        certified_key.copy_from_slice(&data[7..39]);

        let n_extensions = data[39];
        let mut offset = 40;
        let mut signed_with = None;
        for _ in 0..n_extensions {
            if offset + 4 > data.len() {
                return Err(TorError::InvalidCert("extension header truncated".into()));
            }
            let ext_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            let ext_type = data[offset + 2];
            offset += 4;
            if offset + ext_len > data.len() {
                return Err(TorError::InvalidCert("extension data truncated".into()));
            }
            // Extension 4: signed-with-ed25519-key.
            if ext_type == 4 && ext_len == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&data[offset..offset + 32]);
                signed_with = Some(key);
            }
            offset += ext_len;
        }

        if data.len() != offset + 64 {
            return Err(TorError::InvalidCert(format!(
                "bad ed25519 certificate length: {} bytes after extensions",
                data.len() - offset
            )));
        }
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[offset..]);

        Ok(Self {
            cert_type,
            expiration_hours,
            cert_key_type,
            certified_key,
            signed_with,
            signed_text: data[..offset].to_vec(),
            signature,
        })
    }

    pub fn expiry_ms(&self) -> u64 {
        self.expiration_hours as u64 * 3_600_000
    }

    pub fn check_signature(&self, signing_key: &[u8; 32]) -> Result<()> {
        if let Some(claimed) = &self.signed_with {
            if claimed != signing_key {
                return Err(TorError::InvalidCert(
                    "certificate claims a different signing key".into(),
                ));
            }
        }
        let key = VerifyingKey::from_bytes(signing_key)
            .map_err(|e| TorError::InvalidCert(format!("bad ed25519 key: {e}")))?;
        let signature = Signature::from_bytes(&self.signature);
        key.verify(&self.signed_text, &signature)
            .map_err(|_| TorError::InvalidSignature("ed25519 certificate signature".into()))
    }
}

/// RSA→Ed25519 cross-certificate (tor-spec §4.2):
/// `ED25519_KEY (32) || EXPIRATION (4, hours) || SIGLEN (1) || SIGNATURE`.
#[derive(Debug, Clone)]
pub struct RsaCrossCert {
    pub ed_identity: [u8; 32],
    pub expiration_hours: u32,
    digest: [u8; 32],
    signature: Vec<u8>,
}

impl RsaCrossCert {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 37 {
            return Err(TorError::InvalidCert("cross-certificate too short".into()));
        }
        let mut ed_identity = [0u8; 32];
        ed_identity.copy_from_slice(&data[..32]);
        let expiration_hours = u32::from_be_bytes([data[32], data[33], data[34], data[35]]);
        let siglen = data[36] as usize;
        if data.len() < 37 + siglen {
            return Err(TorError::InvalidCert("cross-certificate signature truncated".into()));
        }

        // The signed value is SHA-256 over the prefix and the first 36
        // bytes; the RSA signature carries that hash raw, with no
        // DigestInfo wrapping.
        let mut hasher = Sha256::new();
        hasher.update(CROSS_CERT_PREFIX);
        hasher.update(&data[..36]);

        Ok(Self {
            ed_identity,
            expiration_hours,
            digest: hasher.finalize().into(),
            signature: data[37..37 + siglen].to_vec(),
        })
    }

    pub fn expiry_ms(&self) -> u64 {
        self.expiration_hours as u64 * 3_600_000
    }

    pub fn check_signature(&self, identity_key: &RsaPublicKey) -> Result<()> {
        identity_key
            .verify(Pkcs1v15Sign::new_unprefixed(), &self.digest, &self.signature)
            .map_err(|_| TorError::InvalidSignature("RSA cross-certificate".into()))
    }
}

/// X.509 walking for the self-signed RSA identity certificate, built on
/// `der-parser`. Only the pieces the link handshake needs: the raw
/// TBSCertificate span (the signed bytes), the subject RSA key, and the
/// signature BIT STRING.
pub(crate) mod x509 {
    use super::*;
    use der_parser::asn1_rs::{Any, Class, FromDer, Tag};

    fn der_error(what: &str) -> TorError {
        TorError::InvalidCert(format!("identity certificate DER: {what}"))
    }

    /// Pull the next DER element, keeping the remainder.
    fn next<'a>(input: &'a [u8], what: &'static str) -> Result<(Any<'a>, &'a [u8])> {
        let (rest, obj) = Any::from_der(input).map_err(|_| der_error(what))?;
        Ok((obj, rest))
    }

    /// Content bytes of a BIT STRING element, unused-bits octet removed.
    fn bit_string_bytes<'a>(obj: &Any<'a>, what: &'static str) -> Result<&'a [u8]> {
        if obj.header.tag() != Tag::BitString || obj.data.is_empty() {
            return Err(der_error(what));
        }
        Ok(&obj.data[1..])
    }

    /// Parse a self-signed X.509 certificate, verify its RSASSA-PKCS1-v1_5
    /// (SHA-256) self-signature, and return the subject RSA key.
    pub fn verify_self_signed_rsa(der: &[u8]) -> Result<RsaPublicKey> {
        let (outer, _) = next(der, "certificate")?;
        if outer.header.tag() != Tag::Sequence {
            return Err(der_error("certificate is not a SEQUENCE"));
        }
        let content = outer.data;

        // Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm,
        // signatureValue }; the self-signature covers the raw
        // tbsCertificate bytes.
        let (tbs, rest) = next(content, "tbsCertificate")?;
        let tbs_raw = &content[..content.len() - rest.len()];
        let (_sig_alg, rest) = next(rest, "signatureAlgorithm")?;
        let (sig_bits, _) = next(rest, "signatureValue")?;
        let signature = bit_string_bytes(&sig_bits, "signatureValue")?;

        let key = subject_rsa_key(&tbs)?;
        let hashed: [u8; 32] = Sha256::digest(tbs_raw).into();
        key.verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, signature)
            .map_err(|_| TorError::InvalidSignature("RSA identity self-signature".into()))?;
        Ok(key)
    }

    /// Walk the TBSCertificate to subjectPublicKeyInfo and decode the RSA
    /// key inside its BIT STRING.
    fn subject_rsa_key(tbs: &Any<'_>) -> Result<RsaPublicKey> {
        if tbs.header.tag() != Tag::Sequence {
            return Err(der_error("tbsCertificate is not a SEQUENCE"));
        }
        let mut rest = tbs.data;

        // Optional version field: context tag [0].
        let (first, after) = next(rest, "tbsCertificate fields")?;
        if first.header.class() == Class::ContextSpecific && first.header.tag().0 == 0 {
            rest = after;
        }

        // serialNumber, signature, issuer, validity, subject.
        for _ in 0..5 {
            let (_field, after) = next(rest, "tbsCertificate fields")?;
            rest = after;
        }

        let (spki, _) = next(rest, "subjectPublicKeyInfo")?;
        if spki.header.tag() != Tag::Sequence {
            return Err(der_error("bad subjectPublicKeyInfo"));
        }
        let (_algorithm, after) = next(spki.data, "algorithm")?;
        let (key_bits, _) = next(after, "subjectPublicKey")?;
        let key_der = bit_string_bytes(&key_bits, "subjectPublicKey")?;
        RsaPublicKey::from_pkcs1_der(key_der)
            .map_err(|e| TorError::InvalidCert(format!("bad RSA subject key: {e}")))
    }
}

//! ntor handshake (tor-spec §5.1.4).
//!
//! X25519-based authenticated key agreement run once per hop. The client
//! sends `ID || B || X` in CREATE2/EXTEND2; the relay answers `Y || auth`,
//! and both sides expand `KEY_SEED` into the per-hop digest seeds, AES
//! keys, and the KH binding value.
//!
//! The auth tag comparison is constant-time.

use crate::error::{Result, TorError};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Bytes of key material expanded per hop:
/// Df (20) || Db (20) || Kf (16) || Kb (16) || KH (20).
pub const KEY_MATERIAL_LEN: usize = 92;

/// Expanded per-hop key material.
pub struct NtorKeyMaterial {
    pub forward_digest_seed: [u8; 20],
    pub backward_digest_seed: [u8; 20],
    pub forward_key: [u8; 16],
    pub backward_key: [u8; 16],
    /// Derivative key handle (KH), kept for protocol extensions that bind
    /// to the circuit.
    pub kh: [u8; 20],
}

/// Client side of one ntor exchange.
///
/// The ephemeral secret lives only as long as this value; `StaticSecret`
/// zeroizes itself on drop.
pub struct NtorClient {
    secret: StaticSecret,
    public: PublicKey,
    relay_id: [u8; 20],
    relay_onion_key: PublicKey,
}

impl NtorClient {
    /// Start a handshake toward a relay identified by its RSA fingerprint
    /// and ntor onion key B.
    pub fn new(relay_id: [u8; 20], relay_onion_key: [u8; 32]) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            relay_id,
            relay_onion_key: PublicKey::from(relay_onion_key),
        }
    }

    /// The onion skin sent in CREATE2/EXTEND2: `ID || B || X`, 84 bytes.
    pub fn onion_skin(&self) -> Vec<u8> {
        let mut skin = Vec::with_capacity(84);
        skin.extend_from_slice(&self.relay_id);
        skin.extend_from_slice(self.relay_onion_key.as_bytes());
        skin.extend_from_slice(self.public.as_bytes());
        skin
    }

    /// Finish with the relay's `Y || auth` reply, verifying the auth tag
    /// and expanding the key material.
    pub fn finish(self, reply: &[u8]) -> Result<NtorKeyMaterial> {
        if reply.len() < 64 {
            return Err(TorError::ProtocolViolation(format!(
                "ntor reply too short: {} bytes",
                reply.len()
            )));
        }
        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&reply[..32]);
        let server_public = PublicKey::from(y_bytes);
        let auth = &reply[32..64];

        let xy = self.secret.diffie_hellman(&server_public);
        let xb = self.secret.diffie_hellman(&self.relay_onion_key);

        // secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
        let mut secret_input = Zeroizing::new(Vec::with_capacity(32 * 4 + 20 + PROTOID.len()));
        secret_input.extend_from_slice(xy.as_bytes());
        secret_input.extend_from_slice(xb.as_bytes());
        secret_input.extend_from_slice(&self.relay_id);
        secret_input.extend_from_slice(self.relay_onion_key.as_bytes());
        secret_input.extend_from_slice(self.public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_over(T_KEY, &secret_input);
        let verify = hmac_over(T_VERIFY, &secret_input);

        // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
        let mut auth_input = Vec::with_capacity(32 * 4 + 20 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.relay_id);
        auth_input.extend_from_slice(self.relay_onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let expected_auth = hmac_over(T_MAC, &auth_input);
        if !bool::from(expected_auth.as_slice().ct_eq(auth)) {
            log::warn!("ntor auth tag mismatch");
            return Err(TorError::InvalidNtorAuth);
        }

        expand_key_seed(&key_seed)
    }
}

fn hmac_over(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Expand KEY_SEED via HKDF-SHA256 into the 92-byte hop key block.
///
/// KEY_SEED is already a PRK (output of HMAC-SHA256), so the extract step
/// is skipped per RFC 5869.
pub fn expand_key_seed(key_seed: &[u8; 32]) -> Result<NtorKeyMaterial> {
    let hkdf = hkdf::Hkdf::<Sha256>::from_prk(key_seed)
        .map_err(|_| TorError::Internal("invalid PRK length".into()))?;
    let mut okm = Zeroizing::new([0u8; KEY_MATERIAL_LEN]);
    hkdf.expand(M_EXPAND, &mut okm[..])
        .map_err(|_| TorError::Internal("HKDF expand failed".into()))?;

    let mut keys = NtorKeyMaterial {
        forward_digest_seed: [0; 20],
        backward_digest_seed: [0; 20],
        forward_key: [0; 16],
        backward_key: [0; 16],
        kh: [0; 20],
    };
    keys.forward_digest_seed.copy_from_slice(&okm[0..20]);
    keys.backward_digest_seed.copy_from_slice(&okm[20..40]);
    keys.forward_key.copy_from_slice(&okm[40..56]);
    keys.backward_key.copy_from_slice(&okm[56..72]);
    keys.kh.copy_from_slice(&okm[72..92]);
    Ok(keys)
}

/// Legacy TAP-era KDF (tor-spec §5.2.1), still used by CREATE_FAST.
///
/// `K = SHA1(K0 | [00]) | SHA1(K0 | [01]) | ...` where `K0 = X | Y`. The
/// first 20 bytes are KH (returned for verification against the
/// CREATED_FAST reply); the rest populate the hop keys in the same layout
/// as the ntor expansion.
pub fn kdf_tor(x: &[u8; 20], y: &[u8; 20]) -> Result<([u8; 20], NtorKeyMaterial)> {
    use sha1::{Digest, Sha1};

    let mut k0 = Vec::with_capacity(40);
    k0.extend_from_slice(x);
    k0.extend_from_slice(y);

    // KH (20) + Df (20) + Db (20) + Kf (16) + Kb (16) = 92 bytes.
    let mut stream = Zeroizing::new(Vec::with_capacity(100));
    let mut counter = 0u8;
    while stream.len() < 92 {
        let mut hasher = Sha1::new();
        hasher.update(&k0);
        hasher.update([counter]);
        stream.extend_from_slice(&hasher.finalize());
        counter += 1;
    }

    let mut kh = [0u8; 20];
    kh.copy_from_slice(&stream[0..20]);
    let mut keys = NtorKeyMaterial {
        forward_digest_seed: [0; 20],
        backward_digest_seed: [0; 20],
        forward_key: [0; 16],
        backward_key: [0; 16],
        kh,
    };
    keys.forward_digest_seed.copy_from_slice(&stream[20..40]);
    keys.backward_digest_seed.copy_from_slice(&stream[40..60]);
    keys.forward_key.copy_from_slice(&stream[60..76]);
    keys.backward_key.copy_from_slice(&stream[76..92]);
    Ok((kh, keys))
}

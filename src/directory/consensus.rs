//! Microdesc consensus document model and parser (dir-spec §3).
//!
//! The parser keeps the *exact* byte prefix of the document through the
//! first `directory-signature ` keyword (trailing space included) as the
//! `preimage`; everything after is `signature_text`. Their concatenation
//! is the full document, and its SHA3-256 is what consensus diffs key on.
//!
//! Malformed `r` lines are skipped with a diagnostic rather than failing
//! the whole document; authorities occasionally let oddities through.

use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Result, TorError};

/// Relay status flags from the consensus `s` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayFlags {
    pub authority: bool,
    pub bad_exit: bool,
    pub exit: bool,
    pub fast: bool,
    pub guard: bool,
    pub hsdir: bool,
    pub running: bool,
    pub stable: bool,
    pub v2dir: bool,
    pub valid: bool,
}

impl RelayFlags {
    pub fn from_line(flags: &str) -> Self {
        let mut out = Self::default();
        for flag in flags.split_whitespace() {
            match flag {
                "Authority" => out.authority = true,
                "BadExit" => out.bad_exit = true,
                "Exit" => out.exit = true,
                "Fast" => out.fast = true,
                "Guard" => out.guard = true,
                "HSDir" => out.hsdir = true,
                "Running" => out.running = true,
                "Stable" => out.stable = true,
                "V2Dir" => out.v2dir = true,
                "Valid" => out.valid = true,
                _ => {}
            }
        }
        out
    }
}

/// One relay's microdesc reference in the consensus.
#[derive(Debug, Clone)]
pub struct RelayEntry {
    pub nickname: String,
    pub rsa_id: [u8; 20],
    pub ipv4: Ipv4Addr,
    pub or_port: u16,
    pub dir_port: u16,
    pub ipv6: Option<(Ipv6Addr, u16)>,
    /// Base64 (unpadded) SHA-256 of the microdesc body.
    pub microdesc_hash: String,
    pub flags: RelayFlags,
    /// Raw `pr` protocol-versions line, kept as text.
    pub protocols: Option<String>,
    pub bandwidth: u64,
}

/// An authority's `dir-source` declaration.
#[derive(Debug, Clone)]
pub struct AuthoritySource {
    pub nickname: String,
    pub identity: String,
    pub address: String,
}

/// One `directory-signature` entry from the footer.
#[derive(Debug, Clone)]
pub struct DirectorySignature {
    pub algorithm: String,
    pub identity: String,
    pub signing_key_digest: String,
    pub signature: Vec<u8>,
}

/// Parsed consensus, plus the byte-exact halves needed for diffs and
/// signature checking.
#[derive(Debug, Clone)]
pub struct ConsensusDocument {
    pub valid_after_ms: u64,
    pub fresh_until_ms: u64,
    pub valid_until_ms: u64,
    /// `valid-after` as an ISO timestamp, used in the storage key.
    pub valid_after_iso: String,
    pub authorities: Vec<AuthoritySource>,
    pub relays: Vec<RelayEntry>,
    pub bandwidth_weights: HashMap<String, i64>,
    pub signatures: Vec<DirectorySignature>,
    /// Document bytes from the start through `directory-signature `
    /// (trailing space included).
    pub preimage: String,
    /// Everything after the preimage.
    pub signature_text: String,
    /// SHA3-256 of `preimage || signature_text`.
    pub full_text_hash: [u8; 32],
}

impl ConsensusDocument {
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms < self.fresh_until_ms
    }

    pub fn is_valid(&self, now_ms: u64) -> bool {
        now_ms < self.valid_until_ms
    }

    /// SHA3-256 of the signed prefix, hex: the digest diffs refer to and
    /// the value sent in `X-Or-Diff-From-Consensus`.
    pub fn preimage_hash_hex(&self) -> String {
        hex::encode(Sha3_256::digest(self.preimage.as_bytes()))
    }

    /// Reconstruct the exact document text.
    pub fn full_text(&self) -> String {
        format!("{}{}", self.preimage, self.signature_text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        // Split at the first directory-signature keyword; the trailing
        // space is part of the signed prefix.
        const KEYWORD: &str = "directory-signature ";
        let split = if let Some(idx) = text.find(&format!("\n{KEYWORD}")) {
            idx + 1 + KEYWORD.len()
        } else {
            return Err(TorError::Directory("consensus has no signatures".into()));
        };
        let preimage = text[..split].to_string();
        let signature_text = text[split..].to_string();
        let full_text_hash: [u8; 32] = Sha3_256::digest(text.as_bytes()).into();

        let mut doc = Self {
            valid_after_ms: 0,
            fresh_until_ms: 0,
            valid_until_ms: 0,
            valid_after_iso: String::new(),
            authorities: Vec::new(),
            relays: Vec::new(),
            bandwidth_weights: HashMap::new(),
            signatures: Vec::new(),
            preimage,
            signature_text,
            full_text_hash,
        };

        let mut current: Option<RelayEntry> = None;
        for line in text[..split].lines() {
            let Some((keyword, rest)) = split_keyword(line) else {
                continue;
            };
            match keyword {
                "network-status-version" => {
                    if !rest.starts_with('3') {
                        return Err(TorError::Directory(format!(
                            "unsupported consensus version: {rest}"
                        )));
                    }
                }
                "valid-after" => {
                    doc.valid_after_ms = parse_timestamp_ms(rest)?;
                    doc.valid_after_iso = rest.trim().replace(' ', "T");
                }
                "fresh-until" => doc.fresh_until_ms = parse_timestamp_ms(rest)?,
                "valid-until" => doc.valid_until_ms = parse_timestamp_ms(rest)?,
                "dir-source" => {
                    let parts: Vec<&str> = rest.split_whitespace().collect();
                    if parts.len() >= 3 {
                        doc.authorities.push(AuthoritySource {
                            nickname: parts[0].into(),
                            identity: parts[1].to_uppercase(),
                            address: parts[2].into(),
                        });
                    }
                }
                "r" => {
                    if let Some(entry) = current.take() {
                        doc.relays.push(entry);
                    }
                    match parse_r_line(rest) {
                        Ok(entry) => current = Some(entry),
                        Err(e) => log::debug!("skipping malformed r line: {e}"),
                    }
                }
                "a" => {
                    if let Some(entry) = current.as_mut() {
                        entry.ipv6 = parse_a_line(rest);
                    }
                }
                "m" => {
                    if let Some(entry) = current.as_mut() {
                        entry.microdesc_hash = rest.trim().to_string();
                    }
                }
                "s" => {
                    if let Some(entry) = current.as_mut() {
                        entry.flags = RelayFlags::from_line(rest);
                    }
                }
                "pr" => {
                    if let Some(entry) = current.as_mut() {
                        entry.protocols = Some(rest.trim().to_string());
                    }
                }
                "w" => {
                    if let Some(entry) = current.as_mut() {
                        entry.bandwidth = rest
                            .split_whitespace()
                            .find_map(|p| p.strip_prefix("Bandwidth="))
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                    }
                }
                "bandwidth-weights" => {
                    for pair in rest.split_whitespace() {
                        if let Some((name, value)) = pair.split_once('=') {
                            if let Ok(value) = value.parse() {
                                doc.bandwidth_weights.insert(name.to_string(), value);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        if let Some(entry) = current.take() {
            doc.relays.push(entry);
        }

        // Relays without a microdesc reference are unusable.
        doc.relays.retain(|r| !r.microdesc_hash.is_empty());

        doc.signatures = parse_signatures(&doc.signature_text);
        if doc.valid_after_ms == 0 || doc.valid_until_ms == 0 {
            return Err(TorError::Directory("consensus missing validity window".into()));
        }
        Ok(doc)
    }
}

fn split_keyword(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }
    match line.split_once(' ') {
        Some((kw, rest)) => Some((kw, rest)),
        None => Some((line, "")),
    }
}

/// `r <nickname> <b64 identity> <published date> <time> <IP> <ORPort> <DirPort>`
fn parse_r_line(rest: &str) -> Result<RelayEntry> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    if parts.len() < 7 {
        return Err(TorError::Directory(format!("short r line: {rest}")));
    }
    let rsa_id = decode_b64_fingerprint(parts[1])?;
    let ipv4: Ipv4Addr = parts[4]
        .parse()
        .map_err(|_| TorError::Directory(format!("bad relay address {}", parts[4])))?;
    let or_port: u16 = parts[5]
        .parse()
        .map_err(|_| TorError::Directory(format!("bad OR port {}", parts[5])))?;
    let dir_port: u16 = parts[6].parse().unwrap_or(0);
    Ok(RelayEntry {
        nickname: parts[0].to_string(),
        rsa_id,
        ipv4,
        or_port,
        dir_port,
        ipv6: None,
        microdesc_hash: String::new(),
        flags: RelayFlags::default(),
        protocols: None,
        bandwidth: 0,
    })
}

/// `a [2001:db8::1]:9001`
fn parse_a_line(rest: &str) -> Option<(Ipv6Addr, u16)> {
    let rest = rest.trim();
    let rest = rest.strip_prefix('[')?;
    let (addr, port) = rest.split_once("]:")?;
    Some((addr.parse().ok()?, port.parse().ok()?))
}

fn decode_b64_fingerprint(b64: &str) -> Result<[u8; 20]> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(b64.trim_end_matches('='))
        .map_err(|_| TorError::Directory(format!("bad base64 identity: {b64}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| TorError::Directory(format!("identity is {} bytes", bytes.len())))
}

fn parse_signatures(signature_text: &str) -> Vec<DirectorySignature> {
    // The first entry's keyword is consumed by the preimage split, so its
    // line arrives here headless.
    let mut out = Vec::new();
    let mut header: Option<(String, String, String)> = None;
    let mut sig_b64: Option<String> = None;

    let mut handle_header = |rest: &str| -> Option<(String, String, String)> {
        let parts: Vec<&str> = rest.split_whitespace().collect();
        match parts.len() {
            2 => Some(("sha1".into(), parts[0].to_uppercase(), parts[1].to_uppercase())),
            n if n >= 3 => Some((
                parts[0].to_string(),
                parts[1].to_uppercase(),
                parts[2].to_uppercase(),
            )),
            _ => None,
        }
    };

    for (i, line) in signature_text.lines().enumerate() {
        let line = line.trim_end();
        if i == 0 {
            header = handle_header(line);
            continue;
        }
        if let Some(rest) = line.strip_prefix("directory-signature ") {
            header = handle_header(rest);
        } else if line == "-----BEGIN SIGNATURE-----" {
            sig_b64 = Some(String::new());
        } else if line == "-----END SIGNATURE-----" {
            use base64::Engine;
            if let (Some((algorithm, identity, skd)), Some(b64)) = (header.take(), sig_b64.take())
            {
                if let Ok(signature) = base64::engine::general_purpose::STANDARD.decode(&b64) {
                    out.push(DirectorySignature {
                        algorithm,
                        identity,
                        signing_key_digest: skd,
                        signature,
                    });
                }
            }
        } else if let Some(buf) = sig_b64.as_mut() {
            buf.push_str(line);
        }
    }
    out
}

/// Parse `YYYY-MM-DD HH:MM:SS` (UTC) into Unix milliseconds.
pub fn parse_timestamp_ms(text: &str) -> Result<u64> {
    let bad = || TorError::Directory(format!("bad timestamp: {text}"));
    let text = text.trim();
    let (date, time) = text.split_once(' ').ok_or_else(bad)?;

    let mut date_parts = date.split('-');
    let year: i64 = date_parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let month: i64 = date_parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let day: i64 = date_parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(bad());
    }

    let mut time_parts = time.split(':');
    let hour: i64 = time_parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let minute: i64 = time_parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let second: i64 = time_parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if hour > 23 || minute > 59 || second > 60 {
        return Err(bad());
    }

    // Days-from-civil, Gregorian.
    let y = if month <= 2 { year - 1 } else { year };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe - 719_468;

    let secs = days * 86_400 + hour * 3_600 + minute * 60 + second;
    u64::try_from(secs * 1_000).map_err(|_| bad())
}

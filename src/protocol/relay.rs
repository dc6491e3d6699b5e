//! RELAY cell payloads and subcommand encodings.
//!
//! A RELAY cell's 509-byte payload carries an 11-byte header (command,
//! recognized, stream id, digest, length) followed by data and zero
//! padding. The digest and recognized fields are what the per-hop crypto
//! in [`super::hop`] fills in and checks.

use crate::error::{Result, TorError};

use super::cell::PAYLOAD_LEN;

/// Relay subcommands (tor-spec §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Sendme = 5,
    Truncate = 8,
    Truncated = 9,
    Drop = 10,
    BeginDir = 13,
    Extend2 = 14,
    Extended2 = 15,
}

impl RelayCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// RELAY_END reason: clean close.
pub const END_REASON_DONE: u8 = 6;

/// Size of the relay header within the cell payload.
pub const RELAY_HEADER_LEN: usize = 11;

/// Maximum data bytes one RELAY_DATA cell can carry.
pub const MAX_RELAY_DATA_LEN: usize = PAYLOAD_LEN - RELAY_HEADER_LEN; // 498

/// Parsed relay cell payload.
#[derive(Debug, Clone)]
pub struct RelayCell {
    pub command: RelayCommand,
    pub recognized: u16,
    pub stream_id: u16,
    pub digest: [u8; 4],
    pub data: Vec<u8>,
}

impl RelayCell {
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= MAX_RELAY_DATA_LEN);
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Serialize into a full 509-byte cell payload, digest field zeroed.
    pub fn to_payload(&self) -> Result<[u8; PAYLOAD_LEN]> {
        if self.data.len() > MAX_RELAY_DATA_LEN {
            return Err(TorError::Internal("relay data too long".into()));
        }
        let mut buf = [0u8; PAYLOAD_LEN];
        buf[0] = self.command as u8;
        buf[1..3].copy_from_slice(&self.recognized.to_be_bytes());
        buf[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[5..9].copy_from_slice(&self.digest);
        buf[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf[11..11 + self.data.len()].copy_from_slice(&self.data);
        Ok(buf)
    }

    /// Parse a decrypted 509-byte cell payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < RELAY_HEADER_LEN {
            return Err(TorError::ProtocolViolation("relay cell too short".into()));
        }
        let command = RelayCommand::from_u8(payload[0]).ok_or_else(|| {
            TorError::ProtocolViolation(format!("unknown relay command {}", payload[0]))
        })?;
        let recognized = u16::from_be_bytes([payload[1], payload[2]]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let digest = [payload[5], payload[6], payload[7], payload[8]];
        let length = u16::from_be_bytes([payload[9], payload[10]]) as usize;
        if RELAY_HEADER_LEN + length > payload.len() {
            return Err(TorError::ProtocolViolation("relay length past cell end".into()));
        }
        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: payload[RELAY_HEADER_LEN..RELAY_HEADER_LEN + length].to_vec(),
        })
    }

    /// RELAY_BEGIN: `host:port\0` followed by the 32-bit flags field.
    pub fn begin(stream_id: u16, host: &str, port: u16, flags: u32) -> Self {
        let mut data = format!("{host}:{port}\0").into_bytes();
        data.extend_from_slice(&flags.to_be_bytes());
        Self::new(RelayCommand::Begin, stream_id, data)
    }

    /// RELAY_BEGIN_DIR: empty body, directory of the last hop.
    pub fn begin_dir(stream_id: u16) -> Self {
        Self::new(RelayCommand::BeginDir, stream_id, Vec::new())
    }

    /// RELAY_END with a reason byte.
    pub fn end(stream_id: u16, reason: u8) -> Self {
        Self::new(RelayCommand::End, stream_id, vec![reason])
    }

    /// SENDME; `stream_id == 0` makes it circuit-level.
    pub fn sendme(stream_id: u16) -> Self {
        Self::new(RelayCommand::Sendme, stream_id, Vec::new())
    }

    /// RELAY_TRUNCATE to drop hops after the recipient.
    pub fn truncate() -> Self {
        Self::new(RelayCommand::Truncate, 0, vec![0])
    }
}

/// A link specifier for EXTEND2 (tor-spec §5.1.2).
#[derive(Debug, Clone)]
pub enum LinkSpecifier {
    /// IPv4 address and OR port.
    Ipv4(std::net::Ipv4Addr, u16),
    /// Legacy RSA identity fingerprint.
    RsaId([u8; 20]),
    /// Ed25519 identity.
    Ed25519Id([u8; 32]),
}

impl LinkSpecifier {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            LinkSpecifier::Ipv4(addr, port) => {
                out.push(0x00);
                out.push(6);
                out.extend_from_slice(&addr.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpecifier::RsaId(id) => {
                out.push(0x02);
                out.push(20);
                out.extend_from_slice(id);
            }
            LinkSpecifier::Ed25519Id(id) => {
                out.push(0x03);
                out.push(32);
                out.extend_from_slice(id);
            }
        }
    }
}

/// ntor handshake type for CREATE2/EXTEND2.
pub const HANDSHAKE_TYPE_NTOR: u16 = 0x0002;

/// Build a CREATE2 cell payload around an ntor onion skin.
pub fn encode_create2(onion_skin: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + onion_skin.len());
    out.extend_from_slice(&HANDSHAKE_TYPE_NTOR.to_be_bytes());
    out.extend_from_slice(&(onion_skin.len() as u16).to_be_bytes());
    out.extend_from_slice(onion_skin);
    out
}

/// Build an EXTEND2 relay body from link specifiers and an onion skin.
pub fn encode_extend2(specs: &[LinkSpecifier], onion_skin: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(specs.len() as u8);
    for spec in specs {
        spec.encode_into(&mut out);
    }
    out.extend_from_slice(&HANDSHAKE_TYPE_NTOR.to_be_bytes());
    out.extend_from_slice(&(onion_skin.len() as u16).to_be_bytes());
    out.extend_from_slice(onion_skin);
    out
}

/// Parse a CREATED2 payload or EXTENDED2 relay body: `HLEN || HDATA`.
pub fn decode_created2(data: &[u8]) -> Result<&[u8]> {
    if data.len() < 2 {
        return Err(TorError::ProtocolViolation("CREATED2 too short".into()));
    }
    let hlen = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + hlen {
        return Err(TorError::ProtocolViolation(format!(
            "CREATED2 truncated: want {hlen} bytes"
        )));
    }
    Ok(&data[2..2 + hlen])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_cell_round_trip() {
        let cell = RelayCell::new(RelayCommand::Data, 42, vec![9, 8, 7]);
        let payload = cell.to_payload().unwrap();
        assert_eq!(payload.len(), PAYLOAD_LEN);

        let parsed = RelayCell::from_payload(&payload).unwrap();
        assert_eq!(parsed.command, RelayCommand::Data);
        assert_eq!(parsed.stream_id, 42);
        assert_eq!(parsed.data, vec![9, 8, 7]);
        assert_eq!(parsed.recognized, 0);
    }

    #[test]
    fn begin_encodes_target_and_flags() {
        let cell = RelayCell::begin(1, "example.com", 443, 0b101);
        let text_end = cell.data.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&cell.data[..text_end], b"example.com:443");
        assert_eq!(&cell.data[text_end + 1..], &[0, 0, 0, 0b101]);
    }

    #[test]
    fn extend2_layout() {
        let specs = [
            LinkSpecifier::Ipv4("1.2.3.4".parse().unwrap(), 9001),
            LinkSpecifier::RsaId([0xAA; 20]),
            LinkSpecifier::Ed25519Id([0xBB; 32]),
        ];
        let skin = [0xCC; 84];
        let body = encode_extend2(&specs, &skin);

        assert_eq!(body[0], 3); // NSPEC
        assert_eq!(&body[1..3], &[0x00, 6]); // IPv4 spec header
        assert_eq!(&body[3..7], &[1, 2, 3, 4]);
        assert_eq!(&body[7..9], &9001u16.to_be_bytes());
        assert_eq!(&body[9..11], &[0x02, 20]);
        let after_specs = 11 + 20 + 2 + 32;
        assert_eq!(
            &body[after_specs..after_specs + 4],
            &[0x00, 0x02, 0x00, 84]
        );
        assert_eq!(&body[after_specs + 4..], &skin);
    }

    #[test]
    fn created2_decoding() {
        let mut data = vec![0x00, 64];
        data.extend_from_slice(&[7u8; 64]);
        assert_eq!(decode_created2(&data).unwrap(), &[7u8; 64][..]);

        assert!(decode_created2(&[0x00]).is_err());
        assert!(decode_created2(&[0x00, 64, 1, 2]).is_err());
    }

    #[test]
    fn oversized_length_field_rejected() {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0] = RelayCommand::Data as u8;
        payload[9] = 0xFF;
        payload[10] = 0xFF;
        assert!(RelayCell::from_payload(&payload).is_err());
    }
}

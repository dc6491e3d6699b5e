//! Tor cell framing.
//!
//! Cells are the basic unit on the link. Fixed-length cells carry a
//! 509-byte payload after the circuit id and command; variable-length
//! cells (VERSIONS and every command >= 128) carry an explicit 2-byte
//! length. The circuit-id width depends on the negotiated link protocol:
//! 2 bytes up to version 3, 4 bytes from version 4. Until the first
//! VERSIONS exchange completes the link speaks the v3 framing.

use crate::error::{Result, TorError};
use crate::transport::{read_exact, ByteStream};

/// Payload size of a fixed-length cell.
pub const PAYLOAD_LEN: usize = 509;

/// Cell command types (tor-spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Relay = 3,
    Destroy = 4,
    CreateFast = 5,
    CreatedFast = 6,
    Versions = 7,
    Netinfo = 8,
    RelayEarly = 9,
    Create2 = 10,
    Created2 = 11,
    Vpadding = 128,
    Certs = 129,
    AuthChallenge = 130,
    Authenticate = 131,
    Authorize = 132,
}

impl CellCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Variable-length cells carry an explicit length field.
    pub fn is_variable_length(self) -> bool {
        self == CellCommand::Versions || (self as u8) >= 128
    }
}

/// Link framing mode, selected by the negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFraming {
    /// Before VERSIONS completes: v3 framing, 2-byte circuit ids.
    Negotiating,
    /// Negotiated link protocol (3, 4 or 5).
    Version(u16),
}

impl LinkFraming {
    pub fn circ_id_len(self) -> usize {
        match self {
            LinkFraming::Negotiating => 2,
            LinkFraming::Version(v) if v <= 3 => 2,
            LinkFraming::Version(_) => 4,
        }
    }
}

/// One link cell, either framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub circ_id: u32,
    pub command: CellCommand,
    pub payload: Vec<u8>,
}

impl Cell {
    pub fn new(circ_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circ_id,
            command,
            payload,
        }
    }

    /// VERSIONS payload: one big-endian u16 per offered version.
    pub fn versions(offered: &[u16]) -> Self {
        let mut payload = Vec::with_capacity(offered.len() * 2);
        for v in offered {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        Self::new(0, CellCommand::Versions, payload)
    }
}

/// Read the next cell off the link.
///
/// Fails with `ShortRead` if the stream ends mid-cell and `UnknownCommand`
/// for command bytes outside the understood set.
pub async fn read_cell<S: ByteStream + ?Sized>(
    stream: &mut S,
    framing: LinkFraming,
) -> Result<Cell> {
    let circ_id = match framing.circ_id_len() {
        2 => {
            let mut buf = [0u8; 2];
            read_exact(stream, &mut buf).await?;
            u16::from_be_bytes(buf) as u32
        }
        _ => {
            let mut buf = [0u8; 4];
            read_exact(stream, &mut buf).await?;
            u32::from_be_bytes(buf)
        }
    };

    let mut cmd = [0u8; 1];
    read_exact(stream, &mut cmd).await?;
    let command = CellCommand::from_u8(cmd[0]).ok_or(TorError::UnknownCommand(cmd[0]))?;

    let payload = if command.is_variable_length() {
        let mut len = [0u8; 2];
        read_exact(stream, &mut len).await?;
        let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
        read_exact(stream, &mut payload).await?;
        payload
    } else {
        let mut payload = vec![0u8; PAYLOAD_LEN];
        read_exact(stream, &mut payload).await?;
        payload
    };

    Ok(Cell {
        circ_id,
        command,
        payload,
    })
}

/// Serialize a cell for the given framing. Fixed-length payloads are
/// zero-padded to 509 bytes.
pub fn encode_cell(cell: &Cell, framing: LinkFraming) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(framing.circ_id_len() + 3 + cell.payload.len());
    match framing.circ_id_len() {
        2 => out.extend_from_slice(&(cell.circ_id as u16).to_be_bytes()),
        _ => out.extend_from_slice(&cell.circ_id.to_be_bytes()),
    }
    out.push(cell.command as u8);

    if cell.command.is_variable_length() {
        if cell.payload.len() > u16::MAX as usize {
            return Err(TorError::Internal("variable cell payload too long".into()));
        }
        out.extend_from_slice(&(cell.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&cell.payload);
    } else {
        if cell.payload.len() > PAYLOAD_LEN {
            return Err(TorError::Internal("fixed cell payload too long".into()));
        }
        out.extend_from_slice(&cell.payload);
        out.resize(out.len() + PAYLOAD_LEN - cell.payload.len(), 0);
    }
    Ok(out)
}

/// Write a cell to the link.
pub async fn write_cell<S: ByteStream + ?Sized>(
    stream: &mut S,
    framing: LinkFraming,
    cell: &Cell,
) -> Result<()> {
    let bytes = encode_cell(cell, framing)?;
    stream.write_all(&bytes).await
}

/// Incremental cell parser for the channel pump: bytes go in as they
/// arrive off TLS, whole cells come out.
#[derive(Default)]
pub struct CellBuffer {
    buf: Vec<u8>,
}

impl CellBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Parse one cell if the buffer holds a complete one.
    pub fn next_cell(&mut self, framing: LinkFraming) -> Result<Option<Cell>> {
        let id_len = framing.circ_id_len();
        if self.buf.len() < id_len + 1 {
            return Ok(None);
        }
        let circ_id = match id_len {
            2 => u16::from_be_bytes([self.buf[0], self.buf[1]]) as u32,
            _ => u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]),
        };
        let command =
            CellCommand::from_u8(self.buf[id_len]).ok_or(TorError::UnknownCommand(self.buf[id_len]))?;

        let (payload_start, payload_len) = if command.is_variable_length() {
            if self.buf.len() < id_len + 3 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([self.buf[id_len + 1], self.buf[id_len + 2]]) as usize;
            (id_len + 3, len)
        } else {
            (id_len + 1, PAYLOAD_LEN)
        };
        if self.buf.len() < payload_start + payload_len {
            return Ok(None);
        }

        let payload = self.buf[payload_start..payload_start + payload_len].to_vec();
        self.buf.drain(..payload_start + payload_len);
        Ok(Some(Cell {
            circ_id,
            command,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pipe::pipe;
    use futures::executor::block_on;

    #[test]
    fn fixed_cell_round_trip_v4() {
        let (mut a, mut b) = pipe();
        block_on(async {
            let cell = Cell::new(0x8000_0001, CellCommand::Create2, vec![1, 2, 3]);
            write_cell(&mut a, LinkFraming::Version(4), &cell).await.unwrap();

            let parsed = read_cell(&mut b, LinkFraming::Version(4)).await.unwrap();
            assert_eq!(parsed.circ_id, 0x8000_0001);
            assert_eq!(parsed.command, CellCommand::Create2);
            assert_eq!(parsed.payload.len(), PAYLOAD_LEN);
            assert_eq!(&parsed.payload[..3], &[1, 2, 3]);
            assert!(parsed.payload[3..].iter().all(|&b| b == 0));
        });
    }

    #[test]
    fn fixed_cell_sizes_by_version() {
        let cell = Cell::new(7, CellCommand::Padding, vec![]);
        // 2 + 1 + 509 under v3 framing, 4 + 1 + 509 under v4.
        assert_eq!(encode_cell(&cell, LinkFraming::Version(3)).unwrap().len(), 512);
        assert_eq!(encode_cell(&cell, LinkFraming::Version(4)).unwrap().len(), 514);
    }

    #[test]
    fn versions_cell_uses_negotiating_framing() {
        let (mut a, mut b) = pipe();
        block_on(async {
            let cell = Cell::versions(&[4, 5]);
            write_cell(&mut a, LinkFraming::Negotiating, &cell).await.unwrap();

            let parsed = read_cell(&mut b, LinkFraming::Negotiating).await.unwrap();
            assert_eq!(parsed.command, CellCommand::Versions);
            assert_eq!(parsed.payload, vec![0, 4, 0, 5]);
        });
    }

    #[test]
    fn unknown_command_is_rejected() {
        let (mut a, mut b) = pipe();
        block_on(async {
            a.write_all(&[0, 0, 99]).await.unwrap();
            a.write_all(&[0u8; 509]).await.unwrap();
            match read_cell(&mut b, LinkFraming::Negotiating).await {
                Err(TorError::UnknownCommand(99)) => {}
                other => panic!("expected UnknownCommand, got {other:?}"),
            }
        });
    }

    #[test]
    fn cell_buffer_reassembles_split_input() {
        let cell = Cell::new(0x8000_0002, CellCommand::Relay, vec![7; PAYLOAD_LEN]);
        let bytes = encode_cell(&cell, LinkFraming::Version(4)).unwrap();

        let mut buffer = CellBuffer::new();
        let (head, tail) = bytes.split_at(100);
        buffer.push(head);
        assert!(buffer.next_cell(LinkFraming::Version(4)).unwrap().is_none());
        buffer.push(tail);
        let parsed = buffer.next_cell(LinkFraming::Version(4)).unwrap().unwrap();
        assert_eq!(parsed, cell);
        assert!(buffer.next_cell(LinkFraming::Version(4)).unwrap().is_none());
    }

    #[test]
    fn cell_buffer_yields_back_to_back_cells() {
        let a = Cell::new(1, CellCommand::Padding, vec![]);
        let b = Cell::versions(&[4]);
        let mut bytes = encode_cell(&a, LinkFraming::Version(4)).unwrap();
        bytes.extend(encode_cell(&b, LinkFraming::Version(4)).unwrap());

        let mut buffer = CellBuffer::new();
        buffer.push(&bytes);
        assert_eq!(
            buffer.next_cell(LinkFraming::Version(4)).unwrap().unwrap().command,
            CellCommand::Padding
        );
        assert_eq!(
            buffer.next_cell(LinkFraming::Version(4)).unwrap().unwrap().payload,
            vec![0, 4]
        );
    }

    #[test]
    fn truncated_cell_is_short_read() {
        let (mut a, mut b) = pipe();
        block_on(async {
            a.write_all(&[0, 0, CellCommand::Netinfo as u8, 1, 2, 3]).await.unwrap();
            a.close().await.unwrap();
            match read_cell(&mut b, LinkFraming::Negotiating).await {
                Err(TorError::ShortRead(_)) => {}
                other => panic!("expected ShortRead, got {other:?}"),
            }
        });
    }
}

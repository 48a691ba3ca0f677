//! Chunked packet transfer
//!
//! Payloads larger than one packet are split into a run of packets sharing a
//! packet id and a caller-defined prefix, each tagged with a position flag:
//!
//! ```text
//! offset 0        u16  packet id
//! offset 2        u16  total packet length (header + slice)
//! offset 4        P    caller prefix (e.g. a correlation id)
//! offset 4+P::LEN u8   flag: 0 = first, 1 = middle, 2 = final/only
//! offset 5+P::LEN ..   payload slice
//! ```
//!
//! Every transfer ends with exactly one flag-2 packet, which may carry zero
//! bytes. Ordering and delivery come from the connection; there is no
//! sequence numbering.

pub mod rfifo;
pub mod wfifo;

use serde::{Deserialize, Serialize};

pub use rfifo::{ChunkPacket, ChunkReassembler, ChunkStatus, CompletedTransfer, FifoChunkBuf, TransferState};
pub use wfifo::{ChunkFrame, ChunkedWriter, WriteFifo};

/// Slice size for server-to-server transfers.
pub const WFIFO_CHUNK_SIZE: usize = 65_500;

/// Slice size for client-facing transfers (clients have smaller buffers).
pub const WFIFO_CLIENT_CHUNK_SIZE: usize = 32_000;

/// Packet id + packet length.
pub const BASE_HEADER_LEN: usize = 4;

/// Error types for chunk encoding and reassembly
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("Chunk size must be positive")]
    ZeroChunkSize,

    #[error("Packet length {len} does not fit the 16-bit length field")]
    PacketTooLarge { len: usize },

    #[error("Truncated chunk packet: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Chunk packet length {packet_len} shorter than header {fixed_len}")]
    BadLength { packet_len: usize, fixed_len: usize },

    #[error("Invalid chunk flag {0}")]
    InvalidFlag(u8),

    #[error("Wrong chunk order: flag {flag:?} while transfer is {state:?}")]
    OutOfOrder {
        flag: ChunkFlag,
        state: TransferState,
    },

    #[error("Assembled payload too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Closing chunk of an aborted transfer dropped")]
    Aborted,

    #[error("Too many transfers in progress (limit {limit})")]
    TooManyTransfers { limit: usize },
}

/// Position of a packet within its transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkFlag {
    First = 0,
    Middle = 1,
    Final = 2,
}

impl ChunkFlag {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ChunkFlag {
    type Error = ChunkError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(ChunkFlag::First),
            1 => Ok(ChunkFlag::Middle),
            2 => Ok(ChunkFlag::Final),
            other => Err(ChunkError::InvalidFlag(other)),
        }
    }
}

/// Which peer a transfer goes to; decides the slice size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkTarget {
    InterServer,
    Client,
}

impl ChunkTarget {
    pub fn default_chunk_size(self) -> usize {
        match self {
            ChunkTarget::InterServer => WFIFO_CHUNK_SIZE,
            ChunkTarget::Client => WFIFO_CLIENT_CHUNK_SIZE,
        }
    }
}

/// Fixed fields a packet type places between the base header and the flag.
///
/// Every chunk of a transfer repeats the same prefix.
pub trait ChunkPrefix: Sized {
    const LEN: usize;

    /// Write exactly `LEN` bytes.
    fn write(&self, out: &mut [u8]);

    /// Read from exactly `LEN` bytes.
    fn read(buf: &[u8]) -> Self;
}

impl ChunkPrefix for () {
    const LEN: usize = 0;

    fn write(&self, _out: &mut [u8]) {}

    fn read(_buf: &[u8]) -> Self {}
}

/// Persistent 16-bit id (message id, session id...) carried by every chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub u16);

impl ChunkPrefix for CorrelationId {
    const LEN: usize = 2;

    fn write(&self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.0.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Self {
        CorrelationId(u16::from_le_bytes([buf[0], buf[1]]))
    }
}

/// Header size for prefix `P`: base header, prefix, flag byte.
pub fn fixed_len<P: ChunkPrefix>() -> usize {
    BASE_HEADER_LEN + P::LEN + 1
}

/// Largest slice that still fits the 16-bit packet length with prefix `P`.
pub fn max_chunk_size<P: ChunkPrefix>() -> usize {
    u16::MAX as usize - fixed_len::<P>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_conversion() {
        assert_eq!(ChunkFlag::try_from(0), Ok(ChunkFlag::First));
        assert_eq!(ChunkFlag::try_from(1), Ok(ChunkFlag::Middle));
        assert_eq!(ChunkFlag::try_from(2), Ok(ChunkFlag::Final));
        assert_eq!(ChunkFlag::try_from(3), Err(ChunkError::InvalidFlag(3)));
        assert_eq!(ChunkFlag::Final.as_u8(), 2);
    }

    #[test]
    fn test_fixed_len_matches_reference_layout() {
        // id(2) len(2) msg_id(2) flag(1)
        assert_eq!(fixed_len::<CorrelationId>(), 7);
        assert_eq!(fixed_len::<()>(), 5);
    }

    #[test]
    fn test_default_chunk_sizes_fit_length_field() {
        assert!(WFIFO_CHUNK_SIZE <= max_chunk_size::<CorrelationId>());
        assert!(WFIFO_CLIENT_CHUNK_SIZE < WFIFO_CHUNK_SIZE);
        assert_eq!(ChunkTarget::InterServer.default_chunk_size(), 65_500);
        assert_eq!(ChunkTarget::Client.default_chunk_size(), 32_000);
    }

    #[test]
    fn test_correlation_id_le() {
        let mut buf = [0u8; 2];
        CorrelationId(0x1234).write(&mut buf);
        assert_eq!(buf, [0x34, 0x12]);
        assert_eq!(CorrelationId::read(&buf), CorrelationId(0x1234));
    }
}

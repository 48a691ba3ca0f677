//! Receiving side: parse chunk packets and reassemble transfers.

use std::collections::HashMap;
use std::hash::Hash;

use tracing::{debug, trace, warn};

use super::{fixed_len, ChunkError, ChunkFlag, ChunkPrefix, BASE_HEADER_LEN};

/// Payload bytes carried by a chunk packet of length `packet_len`.
pub fn chunk_data_size<P: ChunkPrefix>(packet_len: usize) -> Result<usize, ChunkError> {
    packet_len
        .checked_sub(fixed_len::<P>())
        .ok_or(ChunkError::BadLength {
            packet_len,
            fixed_len: fixed_len::<P>(),
        })
}

/// A borrowed view of one received chunk packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPacket<'a, P> {
    pub packet_id: u16,
    pub packet_len: usize,
    pub prefix: P,
    /// Raw flag byte; validated by the accumulator, not the parser.
    pub flag: u8,
    pub data: &'a [u8],
}

impl<'a, P: ChunkPrefix> ChunkPacket<'a, P> {
    /// Parse the packet at the start of `buf`. Trailing bytes past the
    /// declared length are ignored.
    pub fn parse(buf: &'a [u8]) -> Result<Self, ChunkError> {
        if buf.len() < BASE_HEADER_LEN {
            return Err(ChunkError::Truncated {
                needed: BASE_HEADER_LEN,
                available: buf.len(),
            });
        }

        let packet_id = u16::from_le_bytes([buf[0], buf[1]]);
        let packet_len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        let data_len = chunk_data_size::<P>(packet_len)?;
        if buf.len() < packet_len {
            return Err(ChunkError::Truncated {
                needed: packet_len,
                available: buf.len(),
            });
        }

        let flag_pos = BASE_HEADER_LEN + P::LEN;
        let prefix = P::read(&buf[BASE_HEADER_LEN..flag_pos]);
        let data = &buf[flag_pos + 1..flag_pos + 1 + data_len];

        Ok(Self {
            packet_id,
            packet_len,
            prefix,
            flag: buf[flag_pos],
            data,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Empty,
    Partial,
    Complete,
    /// A chunk was rejected mid-transfer; the rest of it is discarded up to
    /// its closing packet.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    Complete,
    /// Belongs to an aborted transfer and was dropped.
    Discarded,
}

/// Accumulator for one transfer (fifo_chunk_buf).
///
/// A completed payload must be taken with [`FifoChunkBuf::take`] before the
/// next transfer can start. A chunk rejected while a transfer is under way
/// moves the buffer to [`TransferState::Aborted`]: the remaining chunks of
/// that transfer are discarded and its flag-2 packet is reported as
/// [`ChunkError::Aborted`], so the tail is never delivered as a payload.
#[derive(Debug, Default)]
pub struct FifoChunkBuf {
    data: Option<Vec<u8>>,
    complete: bool,
    aborted: bool,
    limit: Option<usize>,
}

impl FifoChunkBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulator that rejects payloads over `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: None,
            complete: false,
            aborted: false,
            limit: Some(limit),
        }
    }

    pub fn state(&self) -> TransferState {
        if self.aborted {
            return TransferState::Aborted;
        }
        match (&self.data, self.complete) {
            (None, _) => TransferState::Empty,
            (Some(_), false) => TransferState::Partial,
            (Some(_), true) => TransferState::Complete,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state() == TransferState::Empty
    }

    pub fn data_size(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Drop any buffered bytes and forget an aborted transfer.
    pub fn clear(&mut self) {
        self.data = None;
        self.complete = false;
        self.aborted = false;
    }

    /// Move a completed payload out, leaving the buffer empty.
    /// Returns `None` while the transfer is still in progress.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        if !self.complete {
            return None;
        }
        self.complete = false;
        self.data.take()
    }

    pub fn push(&mut self, packet: &ChunkPacket<'_, impl ChunkPrefix>) -> Result<ChunkStatus, ChunkError> {
        self.push_chunk(packet.flag, packet.data)
    }

    /// Apply one chunk with raw flag `flag` carrying `slice`.
    pub fn push_chunk(&mut self, flag: u8, slice: &[u8]) -> Result<ChunkStatus, ChunkError> {
        let parsed = ChunkFlag::try_from(flag);

        if self.aborted {
            return match parsed? {
                ChunkFlag::Final => {
                    debug!("[chunked] [rfifo] Aborted transfer closed");
                    self.aborted = false;
                    Err(ChunkError::Aborted)
                }
                _ => {
                    trace!("[chunked] [rfifo] Discarding {} bytes of aborted transfer", slice.len());
                    Ok(ChunkStatus::Discarded)
                }
            };
        }

        let prior = self.state();
        let result = parsed.clone().and_then(|flag| self.apply(flag, slice));
        if let Err(e) = &result {
            warn!(
                "[chunked] [rfifo] Transfer aborted: {} (dropped {} bytes)",
                e,
                self.data_size()
            );
            self.clear();
            // Only a flag-2 packet ends the rejected transfer
            self.aborted = match parsed {
                Ok(ChunkFlag::Final) => false,
                Ok(_) => true,
                Err(_) => prior == TransferState::Partial,
            };
        }
        result
    }

    fn apply(&mut self, flag: ChunkFlag, slice: &[u8]) -> Result<ChunkStatus, ChunkError> {
        let state = self.state();

        match (flag, state) {
            (_, TransferState::Complete)
            | (ChunkFlag::First, TransferState::Partial)
            | (ChunkFlag::Middle, TransferState::Empty) => {
                return Err(ChunkError::OutOfOrder { flag, state });
            }
            _ => {}
        }

        let size = self.data_size() + slice.len();
        if let Some(limit) = self.limit {
            if size > limit {
                return Err(ChunkError::TooLarge { size, limit });
            }
        }

        self.data.get_or_insert_with(Vec::new).extend_from_slice(slice);

        if flag == ChunkFlag::Final {
            self.complete = true;
            Ok(ChunkStatus::Complete)
        } else {
            Ok(ChunkStatus::Pending)
        }
    }
}

impl Drop for FifoChunkBuf {
    fn drop(&mut self) {
        if self.state() == TransferState::Partial {
            debug!(
                "[chunked] [rfifo] Dropping unfinished transfer ({} bytes)",
                self.data_size()
            );
        }
    }
}

/// A payload reassembled by [`ChunkReassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer<P> {
    pub packet_id: u16,
    pub prefix: P,
    pub data: Vec<u8>,
}

/// Per-connection set of accumulators, one per `(packet_id, prefix)`.
///
/// An aborted transfer keeps its entry until its flag-2 packet arrives, and
/// counts towards `max_pending` meanwhile.
pub struct ChunkReassembler<P> {
    pending: HashMap<(u16, P), FifoChunkBuf>,
    limit: Option<usize>,
    max_pending: Option<usize>,
}

impl<P> Default for ChunkReassembler<P> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            limit: None,
            max_pending: None,
        }
    }
}

impl<P: ChunkPrefix + Copy + Eq + Hash> ChunkReassembler<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self::with_limits(Some(limit), None)
    }

    /// Reassembler with an optional per-transfer size cap and an optional
    /// cap on transfers open at once.
    pub fn with_limits(max_size: Option<usize>, max_pending: Option<usize>) -> Self {
        Self {
            pending: HashMap::new(),
            limit: max_size,
            max_pending,
        }
    }

    /// Number of transfers in progress.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Parse and apply the packet at the start of `buf`.
    pub fn push(&mut self, buf: &[u8]) -> Result<Option<CompletedTransfer<P>>, ChunkError> {
        let packet = ChunkPacket::<P>::parse(buf)?;
        self.push_packet(&packet)
    }

    pub fn push_packet(&mut self, packet: &ChunkPacket<'_, P>) -> Result<Option<CompletedTransfer<P>>, ChunkError> {
        let key = (packet.packet_id, packet.prefix);

        // A lone flag-2 packet completes at once and never occupies a slot
        if let Some(max) = self.max_pending {
            if self.pending.len() >= max
                && packet.flag != ChunkFlag::Final.as_u8()
                && !self.pending.contains_key(&key)
            {
                warn!(
                    "[chunked] [rfifo] Rejecting transfer for packet {:#06x}: {} transfers pending",
                    packet.packet_id,
                    self.pending.len()
                );
                return Err(ChunkError::TooManyTransfers { limit: max });
            }
        }

        let limit = self.limit;
        let acc = self.pending.entry(key).or_insert_with(|| match limit {
            Some(limit) => FifoChunkBuf::with_limit(limit),
            None => FifoChunkBuf::new(),
        });

        match acc.push(packet) {
            Ok(ChunkStatus::Pending) | Ok(ChunkStatus::Discarded) => Ok(None),
            Ok(ChunkStatus::Complete) => {
                let data = acc.take().unwrap_or_default();
                self.pending.remove(&key);
                Ok(Some(CompletedTransfer {
                    packet_id: packet.packet_id,
                    prefix: packet.prefix,
                    data,
                }))
            }
            Err(e) => {
                if acc.state() != TransferState::Aborted {
                    self.pending.remove(&key);
                }
                Err(e)
            }
        }
    }

    /// Drop the transfer for `(packet_id, prefix)`, if any.
    pub fn abort(&mut self, packet_id: u16, prefix: P) -> bool {
        self.pending.remove(&(packet_id, prefix)).is_some()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

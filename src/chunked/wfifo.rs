//! Sending side: split a payload into flagged packets.
//!
//! `L / C` full packets are emitted (flag 0 then 1), followed by one final
//! packet carrying the remaining `L % C` bytes with flag 2, even when the
//! remainder is empty.

use std::iter;

use super::{fixed_len, ChunkError, ChunkFlag, ChunkPrefix, ChunkTarget};

/// Outbound socket buffer, as used by the chunk writer.
pub trait WriteFifo {
    type Error: From<ChunkError>;

    /// Make room for a `len` byte packet (WFIFOHEAD).
    fn reserve(&mut self, len: usize) -> Result<(), Self::Error>;

    /// Writable view of the next `len` uncommitted bytes (WFIFOP).
    fn wfifo_mut(&mut self, len: usize) -> Result<&mut [u8], Self::Error>;

    /// Queue `len` written bytes for sending (WFIFOSET).
    fn commit(&mut self, len: usize) -> Result<(), Self::Error>;
}

/// One packet of a transfer: its flag and the slice of the payload it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFrame {
    pub flag: ChunkFlag,
    pub offset: usize,
    pub len: usize,
}

pub struct ChunkedWriter<'a, P> {
    packet_id: u16,
    prefix: P,
    data: &'a [u8],
    chunk_size: usize,
}

impl<'a, P: ChunkPrefix> ChunkedWriter<'a, P> {
    pub fn new(packet_id: u16, prefix: P, data: &'a [u8], chunk_size: usize) -> Result<Self, ChunkError> {
        if chunk_size == 0 {
            return Err(ChunkError::ZeroChunkSize);
        }
        let max_len = fixed_len::<P>() + chunk_size;
        if max_len > u16::MAX as usize {
            return Err(ChunkError::PacketTooLarge { len: max_len });
        }

        Ok(Self {
            packet_id,
            prefix,
            data,
            chunk_size,
        })
    }

    /// Writer using the default slice size for `target`.
    pub fn for_target(packet_id: u16, prefix: P, data: &'a [u8], target: ChunkTarget) -> Result<Self, ChunkError> {
        Self::new(packet_id, prefix, data, target.default_chunk_size())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn full_chunks(&self) -> usize {
        self.data.len() / self.chunk_size
    }

    /// Full packets plus the mandatory final packet.
    pub fn packet_count(&self) -> usize {
        self.full_chunks() + 1
    }

    pub fn frames(&self) -> impl Iterator<Item = ChunkFrame> + '_ {
        let full = self.full_chunks();
        let chunk_size = self.chunk_size;
        let left_offset = full * chunk_size;

        (0..full)
            .map(move |i| ChunkFrame {
                flag: if i == 0 {
                    ChunkFlag::First
                } else {
                    ChunkFlag::Middle
                },
                offset: i * chunk_size,
                len: chunk_size,
            })
            .chain(iter::once(ChunkFrame {
                flag: ChunkFlag::Final,
                offset: left_offset,
                len: self.data.len() - left_offset,
            }))
    }

    pub fn packet_len(&self, frame: &ChunkFrame) -> usize {
        fixed_len::<P>() + frame.len
    }

    /// Encode `frame` into `out`, which must be exactly `packet_len(frame)` long.
    pub fn encode_frame(&self, frame: &ChunkFrame, out: &mut [u8]) {
        let len = self.packet_len(frame);
        debug_assert_eq!(out.len(), len);

        out[0..2].copy_from_slice(&self.packet_id.to_le_bytes());
        out[2..4].copy_from_slice(&(len as u16).to_le_bytes());
        self.prefix.write(&mut out[4..4 + P::LEN]);
        let flag_pos = 4 + P::LEN;
        out[flag_pos] = frame.flag.as_u8();
        out[flag_pos + 1..].copy_from_slice(&self.data[frame.offset..frame.offset + frame.len]);
    }

    /// Owned packets, one per frame.
    pub fn packets(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.frames().map(move |frame| {
            let mut buf = vec![0u8; self.packet_len(&frame)];
            self.encode_frame(&frame, &mut buf);
            buf
        })
    }

    /// Write every packet to `fifo`, committing each before preparing the
    /// next. Returns the number of packets written.
    pub fn write_to<W: WriteFifo>(&self, fifo: &mut W) -> Result<usize, W::Error> {
        let mut count = 0;
        for frame in self.frames() {
            let len = self.packet_len(&frame);
            fifo.reserve(len)?;
            let buf = fifo.wfifo_mut(len)?;
            self.encode_frame(&frame, buf);
            fifo.commit(len)?;
            count += 1;
        }

        tracing::trace!(
            "[chunked] [wfifo] packet_id={:04X} size={} packets={}",
            self.packet_id,
            self.data.len(),
            count
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::CorrelationId;

    /// Records each committed packet separately.
    #[derive(Default)]
    struct PacketLog {
        pending: Vec<u8>,
        packets: Vec<Vec<u8>>,
    }

    impl WriteFifo for PacketLog {
        type Error = ChunkError;

        fn reserve(&mut self, len: usize) -> Result<(), ChunkError> {
            assert!(self.pending.is_empty(), "previous packet not committed");
            self.pending = vec![0u8; len];
            Ok(())
        }

        fn wfifo_mut(&mut self, len: usize) -> Result<&mut [u8], ChunkError> {
            Ok(&mut self.pending[..len])
        }

        fn commit(&mut self, len: usize) -> Result<(), ChunkError> {
            assert_eq!(self.pending.len(), len);
            self.packets.push(std::mem::take(&mut self.pending));
            Ok(())
        }
    }

    fn flags(packets: &[Vec<u8>]) -> Vec<u8> {
        packets.iter().map(|p| p[6]).collect()
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let r = ChunkedWriter::new(1, CorrelationId(0), b"abc", 0);
        assert_eq!(r.err(), Some(ChunkError::ZeroChunkSize));
    }

    #[test]
    fn test_rejects_oversized_chunk() {
        let r = ChunkedWriter::new(1, CorrelationId(0), b"abc", 65_530);
        assert!(matches!(r, Err(ChunkError::PacketTooLarge { len: 65_537 })));
    }

    #[test]
    fn test_empty_payload_single_final_packet() {
        let w = ChunkedWriter::new(0x1234, CorrelationId(10), b"", 5).unwrap();
        let mut log = PacketLog::default();
        assert_eq!(w.write_to(&mut log).unwrap(), 1);

        assert_eq!(log.packets.len(), 1);
        assert_eq!(log.packets[0], vec![0x34, 0x12, 7, 0, 10, 0, 2]);
    }

    #[test]
    fn test_short_payload_single_final_packet() {
        let w = ChunkedWriter::new(0x1234, CorrelationId(10), b"test", 5).unwrap();
        let packets: Vec<_> = w.packets().collect();
        assert_eq!(packets.len(), 1);
        assert_eq!(flags(&packets), vec![2]);
        assert_eq!(&packets[0][7..], b"test");
        assert_eq!(u16::from_le_bytes([packets[0][2], packets[0][3]]), 11);
    }

    #[test]
    fn test_exact_multiple_ends_with_empty_final() {
        let w = ChunkedWriter::new(1, CorrelationId(0), b"abcdef", 3).unwrap();
        let frames: Vec<_> = w.frames().collect();
        assert_eq!(
            frames,
            vec![
                ChunkFrame { flag: ChunkFlag::First, offset: 0, len: 3 },
                ChunkFrame { flag: ChunkFlag::Middle, offset: 3, len: 3 },
                ChunkFrame { flag: ChunkFlag::Final, offset: 6, len: 0 },
            ]
        );
    }

    #[test]
    fn test_long_line_flags() {
        let data = b"this is very long data line for chunked packets data.";
        let w = ChunkedWriter::new(0x1234, CorrelationId(10), data, 5).unwrap();
        let mut log = PacketLog::default();
        let n = w.write_to(&mut log).unwrap();

        assert_eq!(n, data.len() / 5 + 1);
        let f = flags(&log.packets);
        assert_eq!(f[0], 0);
        assert!(f[1..f.len() - 1].iter().all(|&x| x == 1));
        assert_eq!(*f.last().unwrap(), 2);

        // Every packet repeats id and prefix
        for p in &log.packets {
            assert_eq!(&p[0..2], &[0x34, 0x12]);
            assert_eq!(&p[4..6], &[10, 0]);
        }

        let joined: Vec<u8> = log.packets.iter().flat_map(|p| p[7..].to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_unit_prefix_layout() {
        let w = ChunkedWriter::new(0x00FF, (), b"xy", 1).unwrap();
        let packets: Vec<_> = w.packets().collect();
        assert_eq!(packets[0], vec![0xFF, 0x00, 6, 0, 0, b'x']);
        assert_eq!(packets[1], vec![0xFF, 0x00, 6, 0, 1, b'y']);
        assert_eq!(packets[2], vec![0xFF, 0x00, 5, 0, 2]);
    }
}

//! Per-connection FIFO buffers
//!
//! The RFIFO/WFIFO pair behind every connection: received bytes are appended
//! to `rdata` and consumed from `rdata_pos`; outgoing packets are written past
//! `wdata_size` and become sendable once committed.

use crate::chunked::{ChunkError, WriteFifo};

/// Buffer size constants
pub const RFIFO_SIZE: usize = 16 * 1024;
pub const WFIFO_SIZE: usize = 16 * 1024;

/// Maximum write buffer size (256KB)
pub const MAX_WDATA_SIZE: usize = 256 * 1024;

/// Error types for session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Read out of bounds: fd={fd}, pos={pos}, size={size}")]
    ReadOutOfBounds { fd: i32, pos: usize, size: usize },

    #[error("Skip out of bounds: fd={fd}, skip={skip_len}, available={available}")]
    SkipOutOfBounds {
        fd: i32,
        skip_len: usize,
        available: usize,
    },

    #[error("Write commit too large: fd={fd}, requested={requested}, available={available}")]
    WriteCommitTooLarge {
        fd: i32,
        requested: usize,
        available: usize,
    },

    #[error("Write position overflow: fd={fd}, wdata_size={wdata_size}, pos={pos}")]
    WritePositionOverflow {
        fd: i32,
        wdata_size: usize,
        pos: usize,
    },

    #[error("Write buffer too large: fd={fd}, requested_pos={requested_pos}, max=262144")]
    WriteBufferTooLarge { fd: i32, requested_pos: usize },

    #[error("Chunked transfer error: {0}")]
    Chunk(#[from] ChunkError),
}

/// Buffer state for a single connection
pub struct Session {
    pub fd: i32,

    /// Read buffer (FIFO)
    pub rdata: Vec<u8>,
    pub rdata_pos: usize,
    pub rdata_size: usize,

    /// Write buffer (FIFO)
    pub wdata: Vec<u8>,
    pub wdata_size: usize,

    /// Connection state (0=ok, 1=eof, 2=write error, 3=read error)
    pub eof: i32,
}

impl Session {
    /// Create a new session with the given file descriptor
    pub fn new(fd: i32) -> Self {
        Self {
            fd,
            rdata: Vec::with_capacity(RFIFO_SIZE),
            rdata_pos: 0,
            rdata_size: 0,
            wdata: Vec::with_capacity(WFIFO_SIZE),
            wdata_size: 0,
            eof: 0,
        }
    }

    /// Append received bytes to the read buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.rdata.truncate(self.rdata_size);
        self.rdata.extend_from_slice(bytes);
        self.rdata_size += bytes.len();
    }

    fn read_pos(&self, pos: usize, len: usize) -> Result<usize, SessionError> {
        let actual_pos = self.rdata_pos + pos;

        if actual_pos + len > self.rdata_size {
            return Err(SessionError::ReadOutOfBounds {
                fd: self.fd,
                pos: actual_pos,
                size: self.rdata_size,
            });
        }

        Ok(actual_pos)
    }

    /// Read u8 with bounds checking
    pub fn read_u8(&self, pos: usize) -> Result<u8, SessionError> {
        let p = self.read_pos(pos, 1)?;
        Ok(self.rdata[p])
    }

    /// Read u16 (little-endian) with bounds checking
    pub fn read_u16(&self, pos: usize) -> Result<u16, SessionError> {
        let p = self.read_pos(pos, 2)?;
        Ok(u16::from_le_bytes([self.rdata[p], self.rdata[p + 1]]))
    }

    /// Read u32 (little-endian) with bounds checking
    pub fn read_u32(&self, pos: usize) -> Result<u32, SessionError> {
        let p = self.read_pos(pos, 4)?;
        Ok(u32::from_le_bytes([
            self.rdata[p],
            self.rdata[p + 1],
            self.rdata[p + 2],
            self.rdata[p + 3],
        ]))
    }

    /// Borrow `len` unread bytes starting at `pos` (like RFIFOP)
    pub fn rfifo(&self, pos: usize, len: usize) -> Result<&[u8], SessionError> {
        let p = self.read_pos(pos, len)?;
        Ok(&self.rdata[p..p + len])
    }

    /// Get available bytes to read (like RFIFOREST)
    pub fn available(&self) -> usize {
        self.rdata_size - self.rdata_pos
    }

    fn write_pos(&self, pos: usize, len: usize) -> Result<usize, SessionError> {
        let actual_pos = self
            .wdata_size
            .checked_add(pos)
            .ok_or(SessionError::WritePositionOverflow {
                fd: self.fd,
                wdata_size: self.wdata_size,
                pos,
            })?;

        if actual_pos + len > MAX_WDATA_SIZE {
            return Err(SessionError::WriteBufferTooLarge {
                fd: self.fd,
                requested_pos: actual_pos,
            });
        }

        Ok(actual_pos)
    }

    /// Ensure `len` writable bytes past the committed data (like WFIFOHEAD)
    pub fn reserve(&mut self, len: usize) -> Result<(), SessionError> {
        let p = self.write_pos(0, len)?;
        if p + len > self.wdata.len() {
            self.wdata.resize(p + len, 0);
        }
        Ok(())
    }

    /// Writable slice at `pos` past the committed data (like WFIFOP)
    pub fn wfifo_mut(&mut self, pos: usize, len: usize) -> Result<&mut [u8], SessionError> {
        let p = self.write_pos(pos, len)?;
        // Auto-grow in 1KB chunks
        if p + len > self.wdata.len() {
            self.wdata.resize(p + len + 1024, 0);
        }
        Ok(&mut self.wdata[p..p + len])
    }

    /// Write u8 with automatic buffer growth
    pub fn write_u8(&mut self, pos: usize, val: u8) -> Result<(), SessionError> {
        self.wfifo_mut(pos, 1)?[0] = val;
        Ok(())
    }

    /// Write u16 (little-endian) with automatic buffer growth
    pub fn write_u16(&mut self, pos: usize, val: u16) -> Result<(), SessionError> {
        self.wfifo_mut(pos, 2)?.copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    /// Write u32 (little-endian) with automatic buffer growth
    pub fn write_u32(&mut self, pos: usize, val: u32) -> Result<(), SessionError> {
        self.wfifo_mut(pos, 4)?.copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    /// Commit write buffer (like WFIFOSET)
    pub fn commit_write(&mut self, len: usize) -> Result<(), SessionError> {
        let new_size = self.wdata_size + len;

        if new_size > self.wdata.len() {
            return Err(SessionError::WriteCommitTooLarge {
                fd: self.fd,
                requested: len,
                available: self.wdata.len() - self.wdata_size,
            });
        }

        self.wdata_size = new_size;
        Ok(())
    }

    /// Committed bytes waiting to be sent.
    pub fn pending_write(&self) -> &[u8] {
        &self.wdata[..self.wdata_size]
    }

    /// Drop `len` sent bytes from the front of the write buffer.
    pub fn consume_written(&mut self, len: usize) {
        let len = len.min(self.wdata_size);
        self.wdata.drain(..len);
        self.wdata_size -= len;
    }

    /// Skip N bytes in read buffer (like RFIFOSKIP)
    pub fn skip(&mut self, len: usize) -> Result<(), SessionError> {
        let new_pos = self.rdata_pos.saturating_add(len);

        if new_pos > self.rdata_size {
            return Err(SessionError::SkipOutOfBounds {
                fd: self.fd,
                skip_len: len,
                available: self.rdata_size - self.rdata_pos,
            });
        }

        self.rdata_pos = new_pos;

        // Auto-compact when fully read
        if self.rdata_pos == self.rdata_size {
            self.rdata_pos = 0;
            self.rdata_size = 0;
            self.rdata.clear();
        }

        Ok(())
    }

    /// Moves unread data to the front of the read buffer (RFIFOFLUSH).
    pub fn flush_read_buffer(&mut self) {
        if self.rdata_pos == self.rdata_size {
            self.rdata_pos = 0;
            self.rdata_size = 0;
            self.rdata.clear();
        } else if self.rdata_pos > 0 {
            self.rdata.copy_within(self.rdata_pos..self.rdata_size, 0);
            self.rdata_size -= self.rdata_pos;
            self.rdata_pos = 0;
            self.rdata.truncate(self.rdata_size);
        }
    }
}

impl WriteFifo for Session {
    type Error = SessionError;

    fn reserve(&mut self, len: usize) -> Result<(), SessionError> {
        Session::reserve(self, len)
    }

    fn wfifo_mut(&mut self, len: usize) -> Result<&mut [u8], SessionError> {
        Session::wfifo_mut(self, 0, len)
    }

    fn commit(&mut self, len: usize) -> Result<(), SessionError> {
        self.commit_write(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::{ChunkReassembler, ChunkedWriter, CorrelationId};

    #[test]
    fn test_session_new() {
        let session = Session::new(1);
        assert_eq!(session.fd, 1);
        assert_eq!(session.eof, 0);
        assert_eq!(session.rdata_pos, 0);
        assert_eq!(session.rdata_size, 0);
        assert_eq!(session.wdata_size, 0);
    }

    #[test]
    fn test_read_u8_bounds_check() {
        let mut session = Session::new(1);
        session.feed(&[0x12, 0x34, 0x56]);

        assert_eq!(session.read_u8(0).unwrap(), 0x12);
        assert_eq!(session.read_u8(2).unwrap(), 0x56);

        assert!(session.read_u8(3).is_err());
        assert!(session.read_u8(100).is_err());
    }

    #[test]
    fn test_read_u16_little_endian() {
        let mut session = Session::new(1);
        session.feed(&[0x34, 0x12, 0x78, 0x56]);

        assert_eq!(session.read_u16(0).unwrap(), 0x1234);
        assert_eq!(session.read_u16(2).unwrap(), 0x5678);

        // Not enough bytes
        assert!(session.read_u16(3).is_err());
    }

    #[test]
    fn test_read_u32_little_endian() {
        let mut session = Session::new(1);
        session.feed(&[0x78, 0x56, 0x34, 0x12]);

        assert_eq!(session.read_u32(0).unwrap(), 0x12345678);
        assert!(session.read_u32(1).is_err());
    }

    #[test]
    fn test_rfifo_slice() {
        let mut session = Session::new(1);
        session.feed(b"abcdef");
        session.skip(1).unwrap();
        assert_eq!(session.rfifo(1, 3).unwrap(), b"cde");
        assert!(session.rfifo(3, 3).is_err());
    }

    #[test]
    fn test_feed_after_partial_read() {
        let mut session = Session::new(1);
        session.feed(b"ab");
        session.skip(1).unwrap();
        session.feed(b"cd");
        assert_eq!(session.available(), 3);
        assert_eq!(session.rfifo(0, 3).unwrap(), b"bcd");
    }

    #[test]
    fn test_write_u8_auto_grow() {
        let mut session = Session::new(1);

        assert!(session.write_u8(0, 0xAA).is_ok());
        assert!(session.write_u8(100, 0xBB).is_ok());
        assert!(session.wdata.len() >= 101);
    }

    #[test]
    fn test_write_u16_little_endian() {
        let mut session = Session::new(1);

        assert!(session.write_u16(0, 0x1234).is_ok());
        assert_eq!(session.wdata[0], 0x34);
        assert_eq!(session.wdata[1], 0x12);
    }

    #[test]
    fn test_write_u32_little_endian() {
        let mut session = Session::new(1);

        assert!(session.write_u32(0, 0x12345678).is_ok());
        assert_eq!(&session.wdata[..4], &[0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_commit_write() {
        let mut session = Session::new(1);

        session.write_u8(0, 0xAA).unwrap();
        session.write_u8(1, 0xBB).unwrap();

        assert!(session.commit_write(2).is_ok());
        assert_eq!(session.wdata_size, 2);
        assert_eq!(session.pending_write(), &[0xAA, 0xBB]);

        // Can't commit more than buffer has
        assert!(session.commit_write(session.wdata.len()).is_err());
    }

    #[test]
    fn test_consume_written() {
        let mut session = Session::new(1);
        session.wfifo_mut(0, 3).unwrap().copy_from_slice(b"xyz");
        session.commit_write(3).unwrap();
        session.consume_written(2);
        assert_eq!(session.pending_write(), b"z");
        session.consume_written(10);
        assert!(session.pending_write().is_empty());
    }

    #[test]
    fn test_write_buffer_size_limit() {
        let mut session = Session::new(1);

        let result = session.write_u8(300_000, 0xFF);
        assert!(matches!(
            result,
            Err(SessionError::WriteBufferTooLarge { .. })
        ));
        assert!(session.reserve(MAX_WDATA_SIZE + 1).is_err());
        assert!(session.reserve(MAX_WDATA_SIZE).is_ok());
    }

    #[test]
    fn test_write_overflow_check() {
        let mut session = Session::new(1);
        session.wdata_size = usize::MAX - 10;

        let result = session.write_u8(100, 0xFF);
        assert!(matches!(
            result,
            Err(SessionError::WritePositionOverflow { .. })
        ));
    }

    #[test]
    fn test_skip_bounds_check() {
        let mut session = Session::new(1);
        session.feed(&[1, 2, 3, 4, 5]);

        assert!(session.skip(2).is_ok());
        assert_eq!(session.rdata_pos, 2);
        assert_eq!(session.read_u8(0).unwrap(), 3);

        assert!(session.skip(10).is_err());
    }

    #[test]
    fn test_skip_auto_compact() {
        let mut session = Session::new(1);
        session.feed(&[1, 2, 3, 4, 5]);

        assert!(session.skip(5).is_ok());
        assert_eq!(session.rdata_pos, 0);
        assert_eq!(session.rdata_size, 0);
        assert_eq!(session.rdata.len(), 0);
    }

    #[test]
    fn test_flush_read_buffer() {
        let mut session = Session::new(1);
        session.feed(&[1, 2, 3, 4, 5, 6]);

        session.skip(2).unwrap();
        session.flush_read_buffer();

        assert_eq!(session.rdata_pos, 0);
        assert_eq!(session.rdata_size, 4);
        assert_eq!(session.rdata[0], 3);
    }

    #[test]
    fn test_skip_rejects_overflow() {
        let mut session = Session::new(1);
        session.feed(&[0u8; 100]);
        session.skip(50).unwrap();

        match session.skip(usize::MAX) {
            Err(SessionError::SkipOutOfBounds {
                skip_len, available, ..
            }) => {
                assert_eq!(skip_len, usize::MAX);
                assert_eq!(available, 50);
            }
            _ => panic!("Expected SkipOutOfBounds error"),
        }
    }

    #[test]
    fn test_chunked_write_into_session() {
        let mut session = Session::new(3);
        let payload: Vec<u8> = (0..50u8).collect();
        let writer = ChunkedWriter::new(0x3800, CorrelationId(7), &payload, 16).unwrap();

        let n = writer.write_to(&mut session).unwrap();
        assert_eq!(n, 4);
        // 3 full packets of 23 bytes, final packet 7 + 2
        assert_eq!(session.wdata_size, 3 * 23 + 9);

        // Loop the committed bytes back through the read side
        let sent = session.pending_write().to_vec();
        session.feed(&sent);
        let mut reassembler = ChunkReassembler::<CorrelationId>::new();
        let mut done = None;
        while session.available() > 0 {
            let len = session.read_u16(2).unwrap() as usize;
            done = reassembler.push(session.rfifo(0, len).unwrap()).unwrap();
            session.skip(len).unwrap();
        }
        assert_eq!(done.unwrap().data, payload);
    }

    #[test]
    fn test_chunked_write_hits_ceiling() {
        let mut session = Session::new(3);
        let payload = vec![0u8; MAX_WDATA_SIZE + 1];
        let writer = ChunkedWriter::new(1, (), &payload, 60_000).unwrap();
        assert!(matches!(
            writer.write_to(&mut session),
            Err(SessionError::WriteBufferTooLarge { .. })
        ));
    }
}

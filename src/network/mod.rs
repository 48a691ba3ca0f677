//! Async transport for chunked transfers over `[id u16][len u16]` framed
//! connections.

use std::hash::Hash;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chunked::{ChunkError, ChunkPrefix, ChunkReassembler, ChunkedWriter, CompletedTransfer};
use crate::session::Session;

/// Read one length-framed packet from `stream`.
/// Returns the full buffer including the 4-byte header.
pub async fn read_packet<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let total = u16::from_le_bytes([header[2], header[3]]) as usize;
    if total < header.len() {
        bail!(
            "packet {:04X} declares length {} shorter than its header",
            u16::from_le_bytes([header[0], header[1]]),
            total
        );
    }
    let mut buf = vec![0u8; total];
    buf[..4].copy_from_slice(&header);
    stream.read_exact(&mut buf[4..]).await?;
    Ok(buf)
}

/// Send everything committed to `session`'s write buffer.
pub async fn flush_session<W: AsyncWrite + Unpin>(stream: &mut W, session: &mut Session) -> Result<usize> {
    let len = session.wdata_size;
    if len == 0 {
        return Ok(0);
    }
    let written = stream.write_all(session.pending_write()).await;
    if let Err(e) = written {
        session.eof = 2;
        return Err(e).with_context(|| format!("flush fd={}", session.fd));
    }
    session.consume_written(len);
    Ok(len)
}

/// Write every packet of `writer` to `stream` in order.
pub async fn send_chunked<W, P>(stream: &mut W, writer: &ChunkedWriter<'_, P>) -> Result<usize>
where
    W: AsyncWrite + Unpin,
    P: ChunkPrefix,
{
    let mut count = 0;
    for packet in writer.packets() {
        stream
            .write_all(&packet)
            .await
            .with_context(|| format!("sending chunk {} of {}", count + 1, writer.packet_count()))?;
        count += 1;
    }
    stream.flush().await?;
    Ok(count)
}

/// Read chunk packets until one transfer completes.
///
/// A protocol error aborts only that transfer; it is logged and reading
/// continues. A peer that opens more transfers than the reassembler allows
/// is an error for the whole connection.
pub async fn recv_chunked<R, P>(stream: &mut R, reassembler: &mut ChunkReassembler<P>) -> Result<CompletedTransfer<P>>
where
    R: AsyncRead + Unpin,
    P: ChunkPrefix + Copy + Eq + Hash,
{
    loop {
        let packet = read_packet(stream).await.context("reading chunk packet")?;
        match reassembler.push(&packet) {
            Ok(Some(done)) => {
                tracing::debug!(
                    "[chunked] [recv] packet_id={:04X} complete, {} bytes",
                    done.packet_id,
                    done.data.len()
                );
                return Ok(done);
            }
            Ok(None) => {}
            Err(e @ ChunkError::TooManyTransfers { .. }) => {
                bail!("chunk transfer rejected: {}", e);
            }
            Err(e) => {
                tracing::warn!("[chunked] [recv] Dropped chunk packet: {}", e);
            }
        }
    }
}

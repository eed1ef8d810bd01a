//! Abridged MTProto framing.
//!
//! Frames carry their length in 4-byte words: one marker byte for lengths
//! below 127 words, otherwise `0x7f` followed by three little-endian length
//! bytes. A plain TCP connection additionally announces the codec with a
//! single `0xef` byte before the first frame.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec announcement byte sent once per plain TCP connection.
pub const INIT_BYTE: u8 = 0xef;

/// Word count at which the length marker switches from 1 byte to 4.
const EXTENDED_MARKER: usize = 0x7f;

/// Frame `data` with the abridged length marker.
///
/// `data.len()` must be a multiple of 4, which every MTProto message is.
pub fn encode_packet(data: &[u8]) -> Vec<u8> {
    debug_assert_eq!(data.len() % 4, 0);
    let words = data.len() / 4;
    let mut out = Vec::with_capacity(4 + data.len());
    if words < EXTENDED_MARKER {
        out.push(words as u8);
    } else {
        out.push(EXTENDED_MARKER as u8);
        out.push(words as u8);
        out.push((words >> 8) as u8);
        out.push((words >> 16) as u8);
    }
    out.extend_from_slice(data);
    out
}

/// Parse one frame from the front of `buf`.
///
/// Returns the payload and the number of bytes consumed, or `None` when the
/// buffer does not yet hold a complete frame.
pub fn read_packet(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    let first = *buf.first()? as usize;
    let (words, header) = if first < EXTENDED_MARKER {
        (first, 1)
    } else {
        if buf.len() < 4 {
            return None;
        }
        (
            buf[1] as usize | (buf[2] as usize) << 8 | (buf[3] as usize) << 16,
            4,
        )
    };
    let total = header + words * 4;
    if buf.len() < total {
        return None;
    }
    Some((buf[header..total].to_vec(), total))
}

/// Write one abridged frame to an async sink.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    writer.write_all(&encode_packet(data)).await?;
    writer.flush().await
}

/// Read one abridged frame from an async source.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut marker = [0u8; 1];
    reader.read_exact(&mut marker).await?;
    let words = if (marker[0] as usize) < EXTENDED_MARKER {
        marker[0] as usize
    } else {
        let mut ext = [0u8; 3];
        reader.read_exact(&mut ext).await?;
        ext[0] as usize | (ext[1] as usize) << 8 | (ext[2] as usize) << 16
    };
    let mut frame = vec![0u8; words * 4];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

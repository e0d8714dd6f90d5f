//! Framed packet reader and writer.
//!
//! A frame is an 8-byte header (little-endian `u32` payload length, then
//! little-endian `u32` packet id) followed by the payload bytes. The reader
//! tolerates arbitrary re-chunking of the underlying stream: it buffers,
//! compacts, and reads ahead exactly as far as the next frame requires.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{DEFAULT_BUF_SIZE, HEADER_SIZE, MAX_PACKET_SIZE};
use crate::error::CodecError;
use crate::protocol::packet::Packet;
use crate::Result;

/// Reads framed Hytale packets from a byte stream.
pub struct PacketReader<R> {
    r: R,
    buf: Vec<u8>,
    buffered: usize,
    offset: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(r: R) -> Self {
        Self::with_capacity(r, DEFAULT_BUF_SIZE)
    }

    /// Creates a reader with a custom initial buffer size.
    pub fn with_capacity(r: R, size: usize) -> Self {
        let size = if size < HEADER_SIZE {
            DEFAULT_BUF_SIZE
        } else {
            size
        };
        Self {
            r,
            buf: vec![0; size],
            buffered: 0,
            offset: 0,
        }
    }

    /// Reads and returns the next complete packet.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a frame boundary. A
    /// stream ending mid-frame yields [`CodecError::UnexpectedEof`].
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        match self.read_packet_ref().await? {
            Some((id, data)) => Ok(Some(Packet::new(id, data.to_vec()))),
            None => Ok(None),
        }
    }

    /// Reads the next packet without copying the payload.
    ///
    /// The returned slice borrows the internal buffer and is valid only until
    /// the next read call.
    pub async fn read_packet_ref(&mut self) -> Result<Option<(u32, &[u8])>> {
        if !self.ensure(HEADER_SIZE).await? {
            return Ok(None);
        }

        let header = &self.buf[self.offset..self.offset + HEADER_SIZE];
        let length = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let id = u32::from_le_bytes(header[4..8].try_into().unwrap());

        if length > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge {
                size: length,
                limit: MAX_PACKET_SIZE,
            }
            .into());
        }

        let total = HEADER_SIZE + length;
        if !self.ensure(total).await? {
            return Err(CodecError::UnexpectedEof.into());
        }

        let start = self.offset + HEADER_SIZE;
        self.offset += total;
        Ok(Some((id, &self.buf[start..start + length])))
    }

    /// Ensures at least `n` bytes are buffered past the read offset,
    /// compacting and growing the buffer as needed.
    ///
    /// Returns `Ok(false)` only on a clean end of stream with an empty
    /// buffer; end of stream mid-value is an error.
    async fn ensure(&mut self, n: usize) -> Result<bool> {
        let available = self.buffered - self.offset;
        if available >= n {
            return Ok(true);
        }

        // Compact: move unread bytes to the front
        if self.offset > 0 {
            self.buf.copy_within(self.offset..self.buffered, 0);
            self.buffered = available;
            self.offset = 0;
        }

        if n > self.buf.len() {
            let new_size = (self.buf.len() * 2)
                .max(n)
                .min(MAX_PACKET_SIZE + HEADER_SIZE);
            self.buf.resize(new_size, 0);
        }

        while self.buffered < n {
            let nr = self.r.read(&mut self.buf[self.buffered..]).await?;
            if nr == 0 {
                if self.buffered == 0 {
                    return Ok(false);
                }
                return Err(CodecError::UnexpectedEof.into());
            }
            self.buffered += nr;
        }

        Ok(true)
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffered - self.offset
    }

    /// Resets the reader onto a new stream, reusing the buffer allocation.
    pub fn reset(&mut self, r: R) {
        self.r = r;
        self.buffered = 0;
        self.offset = 0;
    }
}

/// Writes framed Hytale packets to a byte stream.
pub struct PacketWriter<W> {
    w: W,
    header: [u8; HEADER_SIZE],
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            header: [0; HEADER_SIZE],
        }
    }

    /// Writes a complete packet.
    pub async fn write_packet(&mut self, p: &Packet) -> Result<()> {
        self.write(p.id, &p.data).await
    }

    /// Writes a packet with the given id and payload. An empty payload is
    /// permitted.
    pub async fn write(&mut self, id: u32, data: &[u8]) -> Result<()> {
        self.header[0..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
        self.header[4..8].copy_from_slice(&id.to_le_bytes());

        self.w.write_all(&self.header).await?;
        if !data.is_empty() {
            self.w.write_all(data).await?;
        }
        self.w.flush().await?;
        Ok(())
    }

    /// Resets the writer onto a new stream.
    pub fn reset(&mut self, w: W) {
        self.w = w;
    }

    /// Consumes the writer, returning the underlying stream.
    pub fn into_inner(self) -> W {
        self.w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HyproxyError;

    async fn encode(frames: &[(u32, &[u8])]) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        let mut w = PacketWriter::new(&mut out);
        for (id, data) in frames {
            w.write(*id, data).await.unwrap();
        }
        out.into_inner()
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let bytes = encode(&[(0x10, b"hello"), (0x20, b""), (0x30, &[0xFF; 300])]).await;
        let mut r = PacketReader::new(bytes.as_slice());

        let p = r.read_packet().await.unwrap().unwrap();
        assert_eq!((p.id, p.data.as_slice()), (0x10, b"hello".as_slice()));
        let p = r.read_packet().await.unwrap().unwrap();
        assert_eq!((p.id, p.data.len()), (0x20, 0));
        let p = r.read_packet().await.unwrap().unwrap();
        assert_eq!((p.id, p.data.len()), (0x30, 300));
        assert!(r.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn split_resilience() {
        // The reader must produce identical frames regardless of how the
        // byte stream is chunked.
        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let bytes = encode(&[(1, b"abc"), (2, &payload), (3, b"xyz")]).await;

        for chunk_size in [1, 2, 3, 7, 8, 9, 64, 1024] {
            let (client, server) = tokio::io::duplex(64);
            let data = bytes.clone();
            let writer = tokio::spawn(async move {
                let mut client = client;
                for chunk in data.chunks(chunk_size) {
                    client.write_all(chunk).await.unwrap();
                }
            });

            let mut r = PacketReader::with_capacity(server, 16);
            let mut ids = Vec::new();
            while let Some(p) = r.read_packet().await.unwrap() {
                ids.push(p.id);
                if p.id == 2 {
                    assert_eq!(p.data, payload);
                }
            }
            assert_eq!(ids, vec![1, 2, 3], "chunk size {chunk_size}");
            writer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((MAX_PACKET_SIZE as u32) + 1).to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());

        let mut r = PacketReader::new(bytes.as_slice());
        match r.read_packet().await {
            Err(HyproxyError::Codec(CodecError::PacketTooLarge { size, .. })) => {
                assert_eq!(size, MAX_PACKET_SIZE + 1);
            }
            other => panic!("expected PacketTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn max_size_frame_header_accepted() {
        // A frame of exactly MAX_PACKET_SIZE passes the length check; the
        // truncated body then reports UnexpectedEof rather than TooLarge.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(MAX_PACKET_SIZE as u32).to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());

        let mut r = PacketReader::new(bytes.as_slice());
        match r.read_packet().await {
            Err(HyproxyError::Codec(CodecError::UnexpectedEof)) => {}
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_eof_is_end_of_stream() {
        let mut r = PacketReader::new(&[][..]);
        assert!(r.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_header_is_error() {
        let bytes = [0x05, 0x00, 0x00];
        let mut r = PacketReader::new(&bytes[..]);
        match r.read_packet().await {
            Err(HyproxyError::Codec(CodecError::UnexpectedEof)) => {}
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_copy_read() {
        let bytes = encode(&[(9, b"zero-copy")]).await;
        let mut r = PacketReader::new(bytes.as_slice());
        let (id, data) = r.read_packet_ref().await.unwrap().unwrap();
        assert_eq!(id, 9);
        assert_eq!(data, b"zero-copy");
    }

    #[tokio::test]
    async fn reset_reuses_buffer() {
        let first = encode(&[(1, b"one")]).await;
        let second = encode(&[(2, b"two")]).await;

        let mut r = PacketReader::new(first.as_slice());
        assert_eq!(r.read_packet().await.unwrap().unwrap().id, 1);

        r.reset(second.as_slice());
        assert_eq!(r.read_packet().await.unwrap().unwrap().id, 2);
        assert!(r.read_packet().await.unwrap().is_none());
    }
}

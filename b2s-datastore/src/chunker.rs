//! Splits a readable byte stream into fixed-size logical chunks while
//! computing a running SHA-256 per chunk (§4.6).
//!
//! The chunker never materializes a full chunk in memory: each chunk is
//! exposed as a [`ChunkCursor`] that yields bounded-size buffers one read at a
//! time, and only at the cursor's end does the caller learn the exact byte
//! length and digest. This mirrors the "wrap the reader, hash as you go,
//! `finish()` returns what you accumulated" shape of this codebase's
//! [`crate::checksum_reader`]-style readers, generalized from a CRC32 over a
//! whole file to a SHA-256 over one fixed-size slice of a much larger stream.

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default size of the bounded buffers handed out by [`ChunkCursor::next_buf`].
pub const DEFAULT_READ_BUF_SIZE: usize = 4 * 1024 * 1024;

pub struct Chunker<R> {
    inner: R,
    chunk_size: u64,
    read_buf_size: usize,
    /// Set once the underlying stream has returned EOF; no further chunk exists.
    stream_eof: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    pub fn new(inner: R, chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        Chunker {
            inner,
            chunk_size,
            read_buf_size: DEFAULT_READ_BUF_SIZE,
            stream_eof: false,
        }
    }

    pub fn with_read_buf_size(mut self, size: usize) -> Self {
        self.read_buf_size = size.max(1);
        self
    }

    /// Returns a cursor over the next chunk, or `None` once the underlying
    /// stream has been fully drained (§4.6: "terminates the outer sequence at
    /// stream EOF").
    ///
    /// Calling this again before the previous cursor has been driven to
    /// completion is a logic error; the borrow checker enforces it (the
    /// cursor holds `&mut self`).
    pub fn next_chunk(&mut self) -> Option<ChunkCursor<'_, R>> {
        if self.stream_eof {
            return None;
        }
        Some(ChunkCursor {
            chunker: self,
            remaining: self.chunk_size,
            hasher: Sha256::new(),
            total: 0,
        })
    }
}

/// A bounded-size sub-stream over exactly one chunk's worth of the source.
pub struct ChunkCursor<'a, R> {
    chunker: &'a mut Chunker<R>,
    remaining: u64,
    hasher: Sha256,
    total: u64,
}

impl<'a, R: AsyncRead + Unpin> ChunkCursor<'a, R> {
    /// Reads the next bounded buffer (1 byte..=`read_buf_size`) of this
    /// chunk. Returns `None` when the chunk boundary or the underlying
    /// stream's EOF is reached, whichever comes first.
    pub async fn next_buf(&mut self) -> std::io::Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let want = self.remaining.min(self.chunker.read_buf_size as u64) as usize;
        let mut buf = BytesMut::zeroed(want);
        let n = self.chunker.inner.read(&mut buf).await?;
        if n == 0 {
            self.chunker.stream_eof = true;
            return Ok(None);
        }
        buf.truncate(n);
        self.hasher.update(&buf);
        self.remaining -= n as u64;
        self.total += n as u64;
        Ok(Some(buf.freeze()))
    }

    /// Consumes the cursor, returning `(byte_length, hex SHA-256)`.
    ///
    /// Call only after [`Self::next_buf`] has returned `None`. A
    /// `byte_length` of zero means the stream ended exactly on the previous
    /// chunk boundary; per §3/§4.6 the caller must not emit a chunk record
    /// for it.
    pub fn finish(self) -> (u64, String) {
        let digest = self.hasher.finalize();
        (self.total, hex::encode(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn collect_chunks(data: &[u8], chunk_size: u64) -> Vec<(u64, String)> {
        let mut chunker = Chunker::new(Cursor::new(data.to_vec()), chunk_size);
        let mut chunks = Vec::new();
        loop {
            let Some(mut cursor) = chunker.next_chunk() else {
                break;
            };
            while cursor.next_buf().await.unwrap().is_some() {}
            let (len, digest) = cursor.finish();
            if len == 0 {
                break;
            }
            chunks.push((len, digest));
        }
        chunks
    }

    #[tokio::test]
    async fn exact_multiple_yields_no_trailing_empty_chunk() {
        let data = vec![7u8; 30];
        let chunks = collect_chunks(&data, 10).await;
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|(len, _)| *len == 10));
    }

    #[tokio::test]
    async fn trailing_partial_chunk_is_smaller() {
        let data = vec![3u8; 25];
        let chunks = collect_chunks(&data, 10).await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].0, 10);
        assert_eq!(chunks[1].0, 10);
        assert_eq!(chunks[2].0, 5);
    }

    #[tokio::test]
    async fn empty_stream_yields_no_chunks() {
        let chunks = collect_chunks(&[], 10).await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn digest_matches_sha256_of_chunk_bytes() {
        let data: Vec<u8> = (0..16u8).collect();
        let mut chunker = Chunker::new(Cursor::new(data.clone()), 16);
        let mut cursor = chunker.next_chunk().unwrap();
        let mut collected = Vec::new();
        while let Some(buf) = cursor.next_buf().await.unwrap() {
            collected.extend_from_slice(&buf);
        }
        let (len, digest) = cursor.finish();
        assert_eq!(len, 16);
        assert_eq!(collected, data);

        let mut expected = Sha256::new();
        expected.update(&data);
        assert_eq!(digest, hex::encode(expected.finalize()));
    }

    #[tokio::test]
    async fn never_buffers_more_than_read_buf_size_at_once() {
        let data = vec![1u8; 1024];
        let mut chunker = Chunker::new(Cursor::new(data), 1024).with_read_buf_size(64);
        let mut cursor = chunker.next_chunk().unwrap();
        let mut max_seen = 0;
        while let Some(buf) = cursor.next_buf().await.unwrap() {
            max_seen = max_seen.max(buf.len());
        }
        assert!(max_seen <= 64);
    }
}

//! Streaming SHA-256 hashing

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use cloudmirror_core::domain::{ContentHash, HashAlgorithm};

use crate::SyncError;

/// Read size used when hashing a stream
pub const HASH_BLOCK_SIZE: usize = 64 * 1024;

#[derive(Clone, Default)]
struct DigestState {
    hasher: Sha256,
    bytes: u64,
}

/// Read side of a [`HashingReader`]'s digest, usable after the reader
/// has been handed away
#[derive(Clone, Default)]
pub struct DigestHandle {
    state: Arc<Mutex<DigestState>>,
}

impl DigestHandle {
    /// Bytes that have streamed past so far
    pub fn bytes(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).bytes
    }

    /// Independent copy of the digest as it stands now
    pub fn checkpoint(&self) -> Self {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Digest of everything read so far
    pub fn hash(&self) -> Result<ContentHash, SyncError> {
        let digest = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .hasher
            .clone()
            .finalize();
        sha256_hash(&digest)
    }
}

/// Feeds every byte read through it into a SHA-256 digest
pub struct HashingReader<R> {
    inner: R,
    digest: DigestHandle,
}

impl<R: AsyncRead + Unpin> HashingReader<R> {
    pub fn new(inner: R) -> (Self, DigestHandle) {
        Self::resume(inner, DigestHandle::default())
    }

    /// Continue `digest` with the bytes read from `inner`
    pub fn resume(inner: R, digest: DigestHandle) -> (Self, DigestHandle) {
        (
            Self {
                inner,
                digest: digest.clone(),
            },
            digest,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let fresh = &buf.filled()[before..];
            let mut state = self
                .digest
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.hasher.update(fresh);
            state.bytes += fresh.len() as u64;
        }
        poll
    }
}

fn sha256_hash(digest: &[u8]) -> Result<ContentHash, SyncError> {
    Ok(ContentHash::new(HashAlgorithm::Sha256, hex::encode(digest))?)
}

/// Consume `reader` and return its SHA-256 and length
pub async fn hash_stream<R: AsyncRead + Unpin>(
    mut reader: R,
) -> Result<(ContentHash, u64), SyncError> {
    let mut hasher = Sha256::new();
    let mut total = 0u64;
    let mut block = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let n = reader.read(&mut block).await?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
        total += n as u64;
    }
    Ok((sha256_hash(&hasher.finalize())?, total))
}

/// SHA-256 of an in-memory buffer
pub fn hash_bytes(data: &[u8]) -> Result<ContentHash, SyncError> {
    sha256_hash(&Sha256::digest(data))
}

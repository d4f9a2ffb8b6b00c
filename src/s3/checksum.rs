//! Trailer checksums
//!
//! [`HashReader`] hashes a body while it streams and publishes the digest
//! into a [`TrailerMap`] once the body hits EOF. Rewinding the reader to
//! offset 0 starts the hash over, so a retried upload publishes the digest
//! of exactly one pass.

use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use pin_project_lite::pin_project;
use sha1::Digest;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

use crate::signer::TrailerMap;

/// Checksum algorithms that can be sent as a trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    Crc32,
    Crc32c,
    Sha1,
    Sha256,
}

impl ChecksumType {
    /// Header (and trailer) name carrying the checksum.
    pub fn key(&self) -> &'static str {
        match self {
            ChecksumType::Crc32 => "x-amz-checksum-crc32",
            ChecksumType::Crc32c => "x-amz-checksum-crc32c",
            ChecksumType::Sha1 => "x-amz-checksum-sha1",
            ChecksumType::Sha256 => "x-amz-checksum-sha256",
        }
    }

    /// Algorithm name as sent in `x-amz-checksum-algorithm`.
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumType::Crc32 => "CRC32",
            ChecksumType::Crc32c => "CRC32C",
            ChecksumType::Sha1 => "SHA1",
            ChecksumType::Sha256 => "SHA256",
        }
    }

    pub fn hasher(&self) -> ChecksumHasher {
        match self {
            ChecksumType::Crc32 => ChecksumHasher::Crc32(crc32fast::Hasher::new()),
            ChecksumType::Crc32c => ChecksumHasher::Crc32c(0),
            ChecksumType::Sha1 => ChecksumHasher::Sha1(sha1::Sha1::new()),
            ChecksumType::Sha256 => ChecksumHasher::Sha256(sha2::Sha256::new()),
        }
    }

    /// Base64 checksum of `data` in one shot.
    pub fn encode(&self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        STANDARD.encode(hasher.finalize_reset())
    }
}

impl std::str::FromStr for ChecksumType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crc32" => Ok(ChecksumType::Crc32),
            "crc32c" => Ok(ChecksumType::Crc32c),
            "sha1" => Ok(ChecksumType::Sha1),
            "sha256" => Ok(ChecksumType::Sha256),
            other => Err(format!("unknown checksum algorithm: {other}")),
        }
    }
}

/// Rolling state for one [`ChecksumType`].
pub enum ChecksumHasher {
    Crc32(crc32fast::Hasher),
    Crc32c(u32),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl ChecksumHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ChecksumHasher::Crc32(h) => h.update(data),
            ChecksumHasher::Crc32c(crc) => *crc = crc32c::crc32c_append(*crc, data),
            ChecksumHasher::Sha1(h) => Digest::update(h, data),
            ChecksumHasher::Sha256(h) => Digest::update(h, data),
        }
    }

    /// Digest bytes (big-endian for CRCs); the state starts over.
    pub fn finalize_reset(&mut self) -> Vec<u8> {
        match self {
            ChecksumHasher::Crc32(h) => {
                let sum = std::mem::take(h).finalize();
                sum.to_be_bytes().to_vec()
            }
            ChecksumHasher::Crc32c(crc) => std::mem::take(crc).to_be_bytes().to_vec(),
            ChecksumHasher::Sha1(h) => h.finalize_reset().to_vec(),
            ChecksumHasher::Sha256(h) => h.finalize_reset().to_vec(),
        }
    }

    pub fn reset(&mut self) {
        let _ = self.finalize_reset();
    }
}

pin_project! {
    /// Pass-through reader that hashes what it reads.
    pub struct HashReader<R> {
        #[pin]
        inner: R,
        hasher: ChecksumHasher,
        checksum: ChecksumType,
        trailer: TrailerMap,
        published: bool,
    }
}

impl<R> HashReader<R> {
    /// Wrap `inner`; the trailer entry is seeded with the empty digest so its
    /// encoded length is known before the body is read.
    pub fn new(inner: R, checksum: ChecksumType, trailer: TrailerMap) -> Self {
        trailer.set(checksum.key(), checksum.encode(&[]));
        Self {
            inner,
            hasher: checksum.hasher(),
            checksum,
            trailer,
            published: false,
        }
    }
}

impl<R: AsyncRead> AsyncRead for HashReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = &buf.filled()[before..];
                if read.is_empty() {
                    if buf.remaining() > 0 && !*this.published {
                        let digest = this.hasher.finalize_reset();
                        this.trailer.set(this.checksum.key(), STANDARD.encode(digest));
                        *this.published = true;
                    }
                } else {
                    this.hasher.update(read);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<R: AsyncSeek> AsyncSeek for HashReader<R> {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.project();
        if position == SeekFrom::Start(0) {
            this.hasher.reset();
            *this.published = false;
        }
        this.inner.start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        self.project().inner.poll_complete(cx)
    }
}

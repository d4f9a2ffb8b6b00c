//! Request bodies
//!
//! Only bodies that can be rewound are replayed across retry attempts. The
//! distinction is made by type: a [`RequestBody::Stream`] has no seek
//! capability, so the retry engine collapses its budget to one attempt.

use std::io::{self, Cursor, SeekFrom};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::sync::Mutex;

use super::checksum::{ChecksumType, HashReader};
use crate::signer::{ByteStream, Payload, TrailerMap};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A readable body that can seek back to its start.
pub trait SeekableRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableRead for T {}

/// Body handed to [`crate::s3::Client::execute_method`].
#[derive(Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// In-memory body, replayed by cloning.
    Bytes(Bytes),
    /// Rewound to offset 0 before every attempt.
    Seekable(Box<dyn SeekableRead>),
    /// Read once; never retried.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => write!(f, "Empty"),
            RequestBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            RequestBody::Seekable(_) => write!(f, "Seekable(..)"),
            RequestBody::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        RequestBody::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl RequestBody {
    pub fn seekable<R: SeekableRead + 'static>(reader: R) -> Self {
        RequestBody::Seekable(Box::new(reader))
    }

    pub fn stream<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> Self {
        RequestBody::Stream(Box::new(reader))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }

    /// Whether the body can be sent again after a failed attempt.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, RequestBody::Stream(_))
    }

    /// Wrap the body so its checksum lands in `trailer` once fully read.
    pub fn with_checksum(self, checksum: ChecksumType, trailer: TrailerMap) -> Self {
        match self {
            RequestBody::Empty => RequestBody::Empty,
            RequestBody::Bytes(b) => {
                RequestBody::Seekable(Box::new(HashReader::new(Cursor::new(b), checksum, trailer)))
            }
            RequestBody::Seekable(r) => {
                RequestBody::Seekable(Box::new(HashReader::new(r, checksum, trailer)))
            }
            RequestBody::Stream(r) => RequestBody::Stream(Box::new(HashReader::new(r, checksum, trailer))),
        }
    }

    pub(crate) fn into_shared(self) -> SharedBody {
        match self {
            RequestBody::Empty => SharedBody::Empty,
            RequestBody::Bytes(b) => SharedBody::Bytes(b),
            RequestBody::Seekable(r) => SharedBody::Seekable(Arc::new(Mutex::new(r))),
            RequestBody::Stream(r) => SharedBody::Stream(Arc::new(Mutex::new(r))),
        }
    }
}

/// Body owned by one execution and borrowed by each attempt.
#[derive(Clone)]
pub(crate) enum SharedBody {
    Empty,
    Bytes(Bytes),
    Seekable(Arc<Mutex<Box<dyn SeekableRead>>>),
    Stream(Arc<Mutex<Box<dyn AsyncRead + Send + Unpin>>>),
}

impl SharedBody {
    /// Seek back to the start; a no-op for bodies without a cursor.
    pub(crate) async fn rewind(&self) -> io::Result<()> {
        if let SharedBody::Seekable(reader) = self {
            reader.lock().await.seek(SeekFrom::Start(0)).await?;
        }
        Ok(())
    }

    /// Payload for one attempt, reading from the current position.
    pub(crate) fn payload(&self) -> Payload {
        match self {
            SharedBody::Empty => Payload::Empty,
            SharedBody::Bytes(b) => Payload::Bytes(b.clone()),
            SharedBody::Seekable(reader) => Payload::Stream(reader_stream(reader.clone())),
            SharedBody::Stream(reader) => Payload::Stream(reader_stream(reader.clone())),
        }
    }
}

fn reader_stream<T>(reader: Arc<Mutex<T>>) -> ByteStream
where
    T: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(reader), |state| async move {
        let reader = state?;
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let read = {
            let mut guard = reader.lock().await;
            guard.read_buf(&mut buf).await
        };
        match read {
            Ok(0) => None,
            Ok(_) => Some((Ok(buf.freeze()), Some(reader))),
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

//! `aws-chunked` payload framing.
//!
//! Signed framing (`STREAMING-AWS4-HMAC-SHA256-PAYLOAD`):
//!
//! ```text
//! <hex size>;chunk-signature=<sig>\r\n<data>\r\n
//! ...
//! 0;chunk-signature=<sig>\r\n\r\n
//! ```
//!
//! Each chunk signature chains the previous one, starting from the seed
//! signature of the request headers. With a trailer, the final chunk is
//! followed by `name:value\n` lines and `x-amz-trailer-signature`.
//!
//! Unsigned framing drops the `;chunk-signature=` extension and the
//! trailer signature.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use sha2::digest::DynDigest;

use super::canonical::sha256_hex;
use super::request::{ByteStream, Payload, PreparedRequest, TrailerMap};
use super::v4::{self, credential_scope, signature, signing_key, ISO8601_FORMAT};
use super::{HasherFactory, ServiceType, SignerError, SigningKeys, EMPTY_SHA256};

/// Payload bytes per signed chunk.
pub const PAYLOAD_CHUNK_SIZE: usize = 64 * 1024;

pub const STREAMING_SIGN_ALGORITHM: &str = "STREAMING-AWS4-HMAC-SHA256-PAYLOAD";
pub const STREAMING_SIGN_TRAILER_ALGORITHM: &str = "STREAMING-AWS4-HMAC-SHA256-PAYLOAD-TRAILER";

const STREAMING_PAYLOAD_HDR: &str = "AWS4-HMAC-SHA256-PAYLOAD";
const STREAMING_TRAILER_HDR: &str = "AWS4-HMAC-SHA256-TRAILER";
const CHUNK_SIGNATURE: &str = ";chunk-signature=";
const TRAILER_SIGNATURE: &str = "x-amz-trailer-signature";
const SIGNATURE_LEN: i64 = 64;
const CRLF_LEN: i64 = 2;

fn hex_len(size: i64) -> i64 {
    format!("{size:x}").len() as i64
}

/// Encoded length of one signed chunk carrying `size` payload bytes.
pub fn signed_chunk_length(size: i64) -> i64 {
    hex_len(size) + CHUNK_SIGNATURE.len() as i64 + SIGNATURE_LEN + CRLF_LEN + size + CRLF_LEN
}

/// Encoded length of one unsigned chunk carrying `size` payload bytes.
pub fn unsigned_chunk_length(size: i64) -> i64 {
    hex_len(size) + CRLF_LEN + size + CRLF_LEN
}

fn trailer_lines_length(trailer: Option<&TrailerMap>) -> i64 {
    trailer.map(|t| t.to_wire().len() as i64).unwrap_or(0)
}

/// Total length of a signed `aws-chunked` body.
pub fn signed_stream_length(data_len: i64, chunk_size: i64, trailer: Option<&TrailerMap>) -> i64 {
    let full = data_len / chunk_size;
    let remaining = data_len % chunk_size;
    let mut len = full * signed_chunk_length(chunk_size);
    if remaining > 0 {
        len += signed_chunk_length(remaining);
    }
    len += signed_chunk_length(0);
    if let Some(trailer) = trailer.filter(|t| !t.is_empty()) {
        len += trailer_lines_length(Some(trailer));
        len += TRAILER_SIGNATURE.len() as i64 + 1 + SIGNATURE_LEN + CRLF_LEN + CRLF_LEN;
    }
    len
}

/// Total length of an unsigned `aws-chunked` body.
pub fn unsigned_stream_length(data_len: i64, chunk_size: i64, trailer: Option<&TrailerMap>) -> i64 {
    let full = data_len / chunk_size;
    let remaining = data_len % chunk_size;
    let mut len = full * unsigned_chunk_length(chunk_size);
    if remaining > 0 {
        len += unsigned_chunk_length(remaining);
    }
    len += unsigned_chunk_length(0);
    if let Some(trailer) = trailer.filter(|t| !t.is_empty()) {
        len += trailer_lines_length(Some(trailer)) + CRLF_LEN;
    }
    len
}

/// Regroup a stream into `chunk_size` pieces; only the last may be shorter.
pub fn rechunk(inner: ByteStream, chunk_size: usize) -> ByteStream {
    stream::unfold(
        (inner, BytesMut::new(), false),
        move |(mut inner, mut buf, mut eof)| async move {
            loop {
                if buf.len() >= chunk_size {
                    let chunk = buf.split_to(chunk_size).freeze();
                    return Some((Ok(chunk), (inner, buf, eof)));
                }
                if eof {
                    if buf.is_empty() {
                        return None;
                    }
                    let chunk = buf.split().freeze();
                    return Some((Ok(chunk), (inner, buf, eof)));
                }
                match inner.next().await {
                    Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                    Some(Err(e)) => return Some((Err(e), (inner, BytesMut::new(), true))),
                    None => eof = true,
                }
            }
        },
    )
    .boxed()
}

/// Signing state for one chunk-signed body.
pub struct ChunkSigner {
    signing_key: Vec<u8>,
    scope: String,
    amz_date: String,
    prev_signature: String,
    hasher: Box<dyn DynDigest + Send>,
    trailer: Option<TrailerMap>,
}

impl ChunkSigner {
    pub fn new(
        seed_signature: &str,
        secret: &str,
        region: &str,
        service: ServiceType,
        t: DateTime<Utc>,
        hasher: Box<dyn DynDigest + Send>,
        trailer: Option<TrailerMap>,
    ) -> Self {
        Self {
            signing_key: signing_key(secret, region, t, service),
            scope: credential_scope(t, region, service),
            amz_date: t.format(ISO8601_FORMAT).to_string(),
            prev_signature: seed_signature.to_string(),
            hasher,
            trailer: trailer.filter(|t| !t.is_empty()),
        }
    }

    fn chunk_signature(&mut self, data: &[u8]) -> String {
        self.hasher.update(data);
        let digest = hex::encode(self.hasher.finalize_reset());
        let to_sign = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            STREAMING_PAYLOAD_HDR, self.amz_date, self.scope, self.prev_signature, EMPTY_SHA256, digest
        );
        let sig = signature(&self.signing_key, &to_sign);
        self.prev_signature = sig.clone();
        sig
    }

    fn frame(&mut self, data: &[u8], add_crlf: bool) -> Bytes {
        let sig = self.chunk_signature(data);
        let mut out = BytesMut::with_capacity(data.len() + 96);
        out.extend_from_slice(format!("{:x}{}{}\r\n", data.len(), CHUNK_SIGNATURE, sig).as_bytes());
        out.extend_from_slice(data);
        if add_crlf {
            out.extend_from_slice(b"\r\n");
        }
        out.freeze()
    }

    fn trailer_block(&mut self, trailer: &TrailerMap) -> Bytes {
        let lines = trailer.to_wire();
        let to_sign = format!(
            "{}\n{}\n{}\n{}\n{}",
            STREAMING_TRAILER_HDR,
            self.amz_date,
            self.scope,
            self.prev_signature,
            sha256_hex(lines.as_bytes())
        );
        let sig = signature(&self.signing_key, &to_sign);
        self.prev_signature = sig.clone();
        Bytes::from(format!("{lines}\r\n{TRAILER_SIGNATURE}:{sig}\r\n\r\n"))
    }

    /// Frame `inner` (already split into [`PAYLOAD_CHUNK_SIZE`] pieces).
    pub fn encode(self, inner: ByteStream) -> ByteStream {
        stream::unfold((Some(self), inner), |(state, mut inner)| async move {
            let mut signer = state?;
            match inner.next().await {
                Some(Ok(chunk)) => {
                    let framed = signer.frame(&chunk, true);
                    Some((Ok(framed), (Some(signer), inner)))
                }
                Some(Err(e)) => Some((Err(e), (None, inner))),
                None => {
                    let trailer = signer.trailer.clone();
                    let mut out = BytesMut::new();
                    out.extend_from_slice(&signer.frame(&[], trailer.is_none()));
                    if let Some(trailer) = trailer {
                        out.extend_from_slice(&signer.trailer_block(&trailer));
                    }
                    Some((Ok(out.freeze()), (None, inner)))
                }
            }
        })
        .boxed()
    }
}

/// Frame `inner` as unsigned `aws-chunked`, appending the trailer at the end.
pub fn encode_unsigned(inner: ByteStream, trailer: Option<TrailerMap>) -> ByteStream {
    let trailer = trailer.filter(|t| !t.is_empty());
    stream::unfold((Some(trailer), inner), |(state, mut inner)| async move {
        let trailer = state?;
        match inner.next().await {
            Some(Ok(chunk)) => {
                let mut out = BytesMut::with_capacity(chunk.len() + 16);
                out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                out.extend_from_slice(&chunk);
                out.extend_from_slice(b"\r\n");
                Some((Ok(out.freeze()), (Some(trailer), inner)))
            }
            Some(Err(e)) => Some((Err(e), (None, inner))),
            None => {
                let tail = match &trailer {
                    Some(t) => format!("0\r\n{}\r\n\r\n", t.to_wire()),
                    None => "0\r\n\r\n".to_string(),
                };
                Some((Ok(Bytes::from(tail)), (None, inner)))
            }
        }
    })
    .boxed()
}

/// Re-frame the payload as unsigned `aws-chunked` carrying `trailer`.
pub fn frame_unsigned(req: &mut PreparedRequest, trailer: TrailerMap) {
    let payload = std::mem::replace(&mut req.payload, Payload::Empty);
    if req.content_length >= 0 {
        req.content_length =
            unsigned_stream_length(req.content_length, PAYLOAD_CHUNK_SIZE as i64, Some(&trailer));
    }
    let chunks = rechunk(payload.into_stream(), PAYLOAD_CHUNK_SIZE);
    req.payload = Payload::Stream(encode_unsigned(chunks, Some(trailer.clone())));
    req.trailer = Some(trailer);
}

/// Unsigned request carrying a trailer (anonymous uploads).
pub fn unsigned_trailer(
    req: &mut PreparedRequest,
    trailer: TrailerMap,
    t: DateTime<Utc>,
) -> Result<(), SignerError> {
    if trailer.is_empty() {
        return Ok(());
    }
    for name in trailer.names() {
        req.append_header("x-amz-trailer", &name)?;
    }
    req.set_header("content-encoding", "aws-chunked")?;
    let decoded = req.content_length.to_string();
    req.set_header("x-amz-decoded-content-length", &decoded)?;
    req.set_header("x-amz-date", &t.format(ISO8601_FORMAT).to_string())?;
    frame_unsigned(req, trailer);
    Ok(())
}

/// Chunk-sign the payload.
///
/// The request must carry a payload of exactly `data_len` bytes. Headers are
/// signed first; the resulting seed signature starts the chunk chain.
pub fn streaming_sign_v4(
    req: &mut PreparedRequest,
    keys: SigningKeys<'_>,
    region: &str,
    data_len: i64,
    t: DateTime<Utc>,
    hasher: &HasherFactory,
    service: ServiceType,
) -> Result<(), SignerError> {
    if keys.is_anonymous() || req.payload.is_empty() {
        return Ok(());
    }

    let trailer = req.trailer.clone().filter(|t| !t.is_empty());
    match &trailer {
        None => req.set_header("x-amz-content-sha256", STREAMING_SIGN_ALGORITHM)?,
        Some(trailer) => {
            req.set_header("x-amz-content-sha256", STREAMING_SIGN_TRAILER_ALGORITHM)?;
            for name in trailer.names() {
                req.append_header("x-amz-trailer", &name)?;
            }
        }
    }
    req.set_header("content-encoding", "aws-chunked")?;
    req.set_header("x-amz-decoded-content-length", &data_len.to_string())?;

    let seed = v4::sign_headers(req, keys, region, service, t)?;

    req.content_length =
        signed_stream_length(data_len, PAYLOAD_CHUNK_SIZE as i64, trailer.as_ref());
    let signer = ChunkSigner::new(
        &seed,
        keys.secret_access_key,
        region,
        service,
        t,
        hasher(),
        trailer,
    );
    let payload = std::mem::replace(&mut req.payload, Payload::Empty);
    req.payload = Payload::Stream(signer.encode(rechunk(payload.into_stream(), PAYLOAD_CHUNK_SIZE)));
    Ok(())
}

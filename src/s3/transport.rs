//! Pluggable HTTP exchange.
//!
//! The client only needs one capability from the network: send a signed
//! request and get back status, headers and a body. [`ReqwestTransport`] is
//! the default; tests and embedders can supply their own [`Transport`].

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

use super::error::{S3ClientError, TransportError};
use crate::signer::{ByteStream, PreparedRequest};

/// Sends one signed request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: PreparedRequest) -> Result<S3Response, TransportError>;
}

enum ResponseBody {
    Streaming(ByteStream),
    Buffered(Bytes),
}

/// Response returned by a [`Transport`].
pub struct S3Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: ResponseBody,
}

impl std::fmt::Debug for S3Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl S3Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ByteStream) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Streaming(body),
        }
    }

    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Buffered(body.into()),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Read at most `limit` bytes into memory and keep them for later reads.
    pub(crate) async fn buffer(&mut self, limit: u64) -> Result<Bytes, TransportError> {
        let stream = match std::mem::replace(&mut self.body, ResponseBody::Buffered(Bytes::new())) {
            ResponseBody::Buffered(b) => {
                self.body = ResponseBody::Buffered(b.clone());
                return Ok(b);
            }
            ResponseBody::Streaming(s) => s,
        };

        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let mut buf = BytesMut::new();
        let mut stream = stream;
        while buf.len() < limit {
            match stream.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    let take = chunk.len().min(limit - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
                None => break,
            }
        }
        let bytes = buf.freeze();
        self.body = ResponseBody::Buffered(bytes.clone());
        Ok(bytes)
    }

    /// Whole body in memory.
    pub async fn bytes(self) -> Result<Bytes, S3ClientError> {
        match self.body {
            ResponseBody::Buffered(b) => Ok(b),
            ResponseBody::Streaming(mut s) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = s.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    pub async fn text(self) -> Result<String, S3ClientError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn into_stream(self) -> ByteStream {
        match self.body {
            ResponseBody::Buffered(b) => stream::once(async move { Ok(b) }).boxed(),
            ResponseBody::Streaming(s) => s,
        }
    }
}

/// Default transport backed by `reqwest`.
///
/// Redirects are never followed: a redirected signed request would carry a
/// signature for the wrong host.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, S3ClientError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| S3ClientError::ConfigError(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing client; the caller owns its redirect policy.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Abrupt connection closes surface as EOF so they classify as host-down.
fn normalize_send_error(err: reqwest::Error) -> TransportError {
    let mut text = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(e) = source {
        text.push_str(": ");
        text.push_str(&e.to_string());
        source = e.source();
    }
    let text = text.to_lowercase();
    if text.contains("connection closed before message completed") || text.contains("unexpected eof") {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        return TransportError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("Connection closed by foreign host {url}. Retry again."),
        ));
    }
    TransportError::Http(err)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, req: PreparedRequest) -> Result<S3Response, TransportError> {
        let response = self
            .client
            .execute(req.into_reqwest())
            .await
            .map_err(normalize_send_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(io::Error::other))
            .boxed();
        Ok(S3Response::new(status, headers, body))
    }
}

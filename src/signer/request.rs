//! Prepared (unsent) HTTP request model the signers operate on.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use reqwest::{Method, Url};

use super::SignerError;

/// Boxed body stream.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Request payload.
pub enum Payload {
    Empty,
    Bytes(Bytes),
    Stream(ByteStream),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }

    /// Turn any payload into a stream of chunks.
    pub fn into_stream(self) -> ByteStream {
        match self {
            Payload::Empty => stream::empty().boxed(),
            Payload::Bytes(b) => stream::once(async move { Ok(b) }).boxed(),
            Payload::Stream(s) => s,
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Empty => write!(f, "Payload::Empty"),
            Payload::Bytes(b) => write!(f, "Payload::Bytes({} bytes)", b.len()),
            Payload::Stream(_) => write!(f, "Payload::Stream"),
        }
    }
}

/// Trailing headers sent after an `aws-chunked` body.
///
/// Values may be filled in while the body streams; clones share state.
#[derive(Debug, Clone, Default)]
pub struct TrailerMap {
    entries: Arc<Mutex<Vec<(String, String)>>>,
}

impl TrailerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a trailer. Names are stored lower-cased.
    pub fn set(&self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        self.entries
            .lock()
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.entries.lock().clone()
    }

    /// `name:value\n` for each entry, in insertion order.
    pub fn to_wire(&self) -> String {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect()
    }
}

/// An assembled request ready to be signed and sent.
#[derive(Debug)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub payload: Payload,
    /// `-1` when unknown.
    pub content_length: i64,
    pub trailer: Option<TrailerMap>,
}

impl PreparedRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            payload: Payload::Empty,
            content_length: 0,
            trailer: None,
        }
    }

    /// `host[:port]` as it goes on the wire; default ports are omitted.
    pub fn host(&self) -> String {
        match (self.url.host_str(), self.url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), SignerError> {
        let (name, value) = header_pair(name, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn append_header(&mut self, name: &str, value: &str) -> Result<(), SignerError> {
        let (name, value) = header_pair(name, value)?;
        self.headers.append(name, value);
        Ok(())
    }

    /// URL with any `X-Amz-Signature`/`Signature` value masked, for logs.
    pub fn redacted_url(&self) -> String {
        let mut url = self.url.clone();
        if url.query().is_none() {
            return url.to_string();
        }
        let pairs: Vec<(String, String)> = self
            .url
            .query_pairs()
            .map(|(k, v)| {
                let masked = matches!(k.as_ref(), "X-Amz-Signature" | "Signature");
                let v = if masked { "**REDACTED**".to_string() } else { v.into_owned() };
                (k.into_owned(), v)
            })
            .collect();
        url.query_pairs_mut().clear().extend_pairs(pairs);
        url.to_string()
    }

    /// Convert into a `reqwest::Request`.
    pub fn into_reqwest(self) -> reqwest::Request {
        let PreparedRequest {
            method,
            url,
            mut headers,
            payload,
            content_length,
            ..
        } = self;

        let mut request = reqwest::Request::new(method, url);
        let body = match payload {
            Payload::Empty => None,
            Payload::Bytes(b) => Some(reqwest::Body::from(b)),
            Payload::Stream(s) => {
                if content_length >= 0 {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
                }
                Some(reqwest::Body::wrap_stream(s))
            }
        };
        *request.headers_mut() = headers;
        *request.body_mut() = body;
        request
    }
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), SignerError> {
    let header_name =
        HeaderName::from_bytes(name.as_bytes()).map_err(|e| SignerError::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
    let header_value = HeaderValue::from_str(value).map_err(|e| SignerError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    Ok((header_name, header_value))
}

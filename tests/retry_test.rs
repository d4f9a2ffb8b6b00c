//! Retry Engine Integration Tests
//!
//! Replayable bodies are retried from offset 0; one-shot bodies get exactly
//! one attempt; cancellation wins over any in-flight failure.

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use mizuchi_s3::s3::{
        Client, ClientOptions, Context, RequestBody, RequestMetadata, S3ClientError, S3Response,
        StaticCredentials, Transport, TransportError,
    };
    use mizuchi_s3::signer::PreparedRequest;
    use parking_lot::Mutex;
    use reqwest::header::HeaderMap;
    use reqwest::{Method, StatusCode};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAYLOAD: &[u8] = b"the quick brown fox jumps over the lazy dog";

    /// Drains every request body, fails the first `failures` with a reset.
    struct ResettingTransport {
        failures: usize,
        calls: AtomicUsize,
        bodies: Mutex<Vec<Vec<u8>>>,
    }

    impl ResettingTransport {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
                bodies: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for ResettingTransport {
        async fn send(&self, req: PreparedRequest) -> Result<S3Response, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut body = Vec::new();
            let mut stream = req.payload.into_stream();
            while let Some(chunk) = stream.next().await {
                body.extend_from_slice(&chunk?);
            }
            self.bodies.lock().push(body);

            if call < self.failures {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )));
            }
            Ok(S3Response::from_bytes(StatusCode::OK, HeaderMap::new(), Bytes::new()))
        }
    }

    fn client_with(transport: Arc<dyn Transport>, max_retries: usize) -> Client {
        Client::new(
            "localhost:9000",
            ClientOptions {
                credentials: Some(Arc::new(StaticCredentials::new("minio", "minio123"))),
                transport: Some(transport),
                region: "us-east-1".into(),
                max_retries,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn client_for(server: &MockServer, max_retries: usize) -> Client {
        Client::new(
            &server.address().to_string(),
            ClientOptions {
                credentials: Some(Arc::new(StaticCredentials::new("minio", "minio123"))),
                region: "us-east-1".into(),
                max_retries,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn put(body: RequestBody) -> RequestMetadata {
        RequestMetadata::new("bucket", "object.txt").with_body(body, PAYLOAD.len() as i64)
    }

    // ========================================================================
    // Network failures
    // ========================================================================

    #[tokio::test]
    async fn test_seekable_body_rewound_on_every_attempt() {
        let transport = ResettingTransport::new(2);
        let client = client_with(transport.clone(), 5);

        client
            .execute_method(
                &Context::background(),
                Method::PUT,
                put(RequestBody::seekable(Cursor::new(PAYLOAD.to_vec()))),
            )
            .await
            .unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        let bodies = transport.bodies.lock();
        assert_eq!(bodies.len(), 3);
        for body in bodies.iter() {
            assert_eq!(body.as_slice(), PAYLOAD);
        }
    }

    #[tokio::test]
    async fn test_network_failure_exhausts_budget() {
        let transport = ResettingTransport::new(usize::MAX);
        let client = client_with(transport.clone(), 3);

        let err = client
            .execute_method(
                &Context::background(),
                Method::PUT,
                put(RequestBody::from(PAYLOAD.to_vec())),
            )
            .await
            .unwrap_err();

        assert!(err.is_network_or_host_down(false));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stream_body_gets_one_attempt() {
        let transport = ResettingTransport::new(usize::MAX);
        let client = client_with(transport.clone(), 10);

        let err = client
            .execute_method(
                &Context::background(),
                Method::PUT,
                put(RequestBody::stream(Cursor::new(PAYLOAD.to_vec()))),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, S3ClientError::Transport(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.bodies.lock()[0].as_slice(), PAYLOAD);
    }

    // ========================================================================
    // Retryable responses
    // ========================================================================

    #[tokio::test]
    async fn test_503_retried_with_full_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/object.txt"))
            .respond_with(ResponseTemplate::new(503).set_body_string(
                "<Error><Code>SlowDown</Code><Message>Reduce your request rate.</Message></Error>",
            ))
            .expect(3)
            .mount(&server)
            .await;

        let client = client_for(&server, 3);
        let err = client
            .execute_method(
                &Context::background(),
                Method::PUT,
                put(RequestBody::seekable(Cursor::new(PAYLOAD.to_vec()))),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SlowDown");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
        for request in &requests {
            assert_eq!(request.body.as_slice(), PAYLOAD);
        }
    }

    #[tokio::test]
    async fn test_503_stream_body_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/object.txt"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 5);
        let err = client
            .execute_method(
                &Context::background(),
                Method::PUT,
                put(RequestBody::stream(Cursor::new(PAYLOAD.to_vec()))),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_response().unwrap().status_code, 503);
    }

    #[tokio::test]
    async fn test_recovers_after_internal_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/object.txt"))
            .respond_with(ResponseTemplate::new(500).set_body_string(
                "<Error><Code>InternalError</Code><Message>try again</Message></Error>",
            ))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bucket/object.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("content"))
            .mount(&server)
            .await;

        let client = client_for(&server, 5);
        let resp = client
            .execute_method(
                &Context::background(),
                Method::GET,
                RequestMetadata::new("bucket", "object.txt"),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), "content");
    }

    #[tokio::test]
    async fn test_not_found_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/missing.txt"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 5);
        let err = client
            .execute_method(
                &Context::background(),
                Method::GET,
                RequestMetadata::new("bucket", "missing.txt"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NoSuchKey");
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    #[tokio::test]
    async fn test_deadline_wins_over_slow_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/slow.txt"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let client = client_for(&server, 5);
        let ctx = Context::background().with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = client
            .execute_method(&ctx, Method::GET, RequestMetadata::new("bucket", "slow.txt"))
            .await
            .unwrap_err();

        assert!(matches!(err, S3ClientError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(3));
        // a deadline says nothing about the endpoint
        assert!(!client.is_offline());
    }
}

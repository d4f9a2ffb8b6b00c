//! Health Monitor Integration Tests
//!
//! Probe results against a mock server, the start guards, the offline
//! fast-fail gate and demotion on network failures.

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use mizuchi_s3::s3::{
        Client, ClientOptions, Context, HealthStatus, RequestMetadata, S3ClientError, S3Response,
        StaticCredentials, Transport, TransportError,
    };
    use mizuchi_s3::signer::PreparedRequest;
    use reqwest::header::HeaderMap;
    use reqwest::{Method, StatusCode};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Answers 403 until switched down, then refuses connections.
    struct FlakyTransport {
        down: AtomicBool,
    }

    impl FlakyTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                down: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&self, _req: PreparedRequest) -> Result<S3Response, TransportError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
            Ok(S3Response::from_bytes(
                StatusCode::FORBIDDEN,
                HeaderMap::new(),
                "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
            ))
        }
    }

    fn client_for(endpoint: &str) -> Client {
        Client::new(
            endpoint,
            ClientOptions {
                credentials: Some(Arc::new(StaticCredentials::new("minio", "minio123"))),
                region: "us-east-1".into(),
                max_retries: 1,
                ..Default::default()
            },
        )
        .unwrap()
    }

    /// An address nothing listens on.
    fn closed_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    async fn forbidden_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
            ))
            .mount(&server)
            .await;
        server
    }

    // ========================================================================
    // Start guards
    // ========================================================================

    #[tokio::test]
    async fn test_interval_too_short() {
        let server = forbidden_server().await;
        let client = client_for(&server.address().to_string());
        let err = client
            .health_check(Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, S3ClientError::HealthCheckInterval));
        assert_eq!(client.health_status(), HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let server = forbidden_server().await;
        let client = client_for(&server.address().to_string());
        let handle = client.health_check(Duration::from_secs(1)).await.unwrap();

        let err = client
            .health_check(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, S3ClientError::HealthCheckRunning));
        assert!(err.to_string().contains("already running"));

        handle.stop().await;
        assert_eq!(client.health_status(), HealthStatus::Unknown);
        // restartable once stopped
        let handle = client.health_check(Duration::from_secs(1)).await.unwrap();
        handle.stop().await;
    }

    // ========================================================================
    // Probe outcomes
    // ========================================================================

    #[tokio::test]
    async fn test_forbidden_probe_means_online() {
        let server = forbidden_server().await;
        let client = client_for(&server.address().to_string());

        let handle = client.health_check(Duration::from_secs(1)).await.unwrap();
        assert_eq!(client.health_status(), HealthStatus::Online);
        assert!(client.is_online());

        let probes = server.received_requests().await.unwrap();
        assert_eq!(probes.len(), 1);
        assert!(probes[0].url.path().starts_with("/probe-health-"));
        assert_eq!(probes[0].url.query(), Some("location="));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_fast() {
        let client = client_for(&closed_endpoint());
        let handle = client.health_check(Duration::from_secs(1)).await.unwrap();
        assert_eq!(client.health_status(), HealthStatus::Offline);

        let err = client
            .execute_method(
                &Context::background(),
                Method::GET,
                RequestMetadata::new("bucket", "key"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, S3ClientError::Offline(_)));
        assert!(err.to_string().ends_with("is offline."));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_network_failure_demotes_immediately() {
        let transport = FlakyTransport::new();
        let client = Client::new(
            "localhost:9000",
            ClientOptions {
                credentials: Some(Arc::new(StaticCredentials::new("minio", "minio123"))),
                transport: Some(transport.clone()),
                region: "us-east-1".into(),
                max_retries: 1,
                ..Default::default()
            },
        )
        .unwrap();

        // hour-long interval: only the request path can demote
        let handle = client.health_check(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(client.health_status(), HealthStatus::Online);

        transport.down.store(true, Ordering::SeqCst);
        let err = client
            .execute_method(
                &Context::background(),
                Method::GET,
                RequestMetadata::new("bucket", "key"),
            )
            .await
            .unwrap_err();
        assert!(err.is_network_or_host_down(false));
        assert_eq!(client.health_status(), HealthStatus::Offline);
        assert!(client.is_offline());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_no_monitor_no_gate() {
        let client = client_for(&closed_endpoint());
        let err = client
            .execute_method(
                &Context::background(),
                Method::GET,
                RequestMetadata::new("bucket", "key"),
            )
            .await
            .unwrap_err();
        // network errors never demote an unmonitored endpoint
        assert!(err.is_network_or_host_down(false));
        assert_eq!(client.health_status(), HealthStatus::Unknown);
        assert!(client.is_online());
    }
}

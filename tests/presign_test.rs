//! Presigned URL Integration Tests

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use mizuchi_s3::s3::{
        Client, ClientOptions, Context, Credentials, RequestMetadata, S3ClientError,
        StaticCredentials,
    };
    use mizuchi_s3::signer::SignatureType;
    use reqwest::header::{HeaderMap, HeaderValue};
    use reqwest::{Method, Url};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(endpoint: &str, credentials: Credentials) -> Client {
        Client::new(
            endpoint,
            ClientOptions {
                credentials: Some(Arc::new(StaticCredentials::from_credentials(credentials))),
                region: "us-east-1".into(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn query_map(url: &Url) -> BTreeMap<String, String> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    // ========================================================================
    // Rejections
    // ========================================================================

    #[tokio::test]
    async fn test_anonymous_presign_rejected_without_io() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client(&server.address().to_string(), Credentials::anonymous());
        let err = client
            .presign(
                &Context::background(),
                Method::GET,
                "bucket",
                "key",
                Duration::from_secs(60),
                BTreeMap::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, S3ClientError::InvalidArgument(_)));
        assert!(err.to_string().contains("anonymous"));
    }

    #[tokio::test]
    async fn test_legacy_presign_rejects_extra_headers() {
        let client = client(
            "localhost:9000",
            Credentials::new("minio", "minio123").with_signature(SignatureType::V2),
        );
        let mut extra = HeaderMap::new();
        extra.insert("x-amz-meta-owner", HeaderValue::from_static("alice"));
        let err = client
            .presign(
                &Context::background(),
                Method::PUT,
                "bucket",
                "key",
                Duration::from_secs(60),
                BTreeMap::new(),
                Some(extra),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, S3ClientError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_presign_validates_names() {
        let client = client("localhost:9000", Credentials::new("minio", "minio123"));
        let ctx = Context::background();
        let expires = Duration::from_secs(60);
        assert!(client
            .presign(&ctx, Method::GET, "", "key", expires, BTreeMap::new(), None)
            .await
            .is_err());
        assert!(client
            .presign(&ctx, Method::GET, "bucket", "", expires, BTreeMap::new(), None)
            .await
            .is_err());
    }

    // ========================================================================
    // Signed URLs
    // ========================================================================

    #[tokio::test]
    async fn test_v4_presigned_url_parameters() {
        let client = client("localhost:9000", Credentials::new("minio", "minio123"));
        let mut query = BTreeMap::new();
        query.insert("response-content-type".to_string(), "text/plain".to_string());
        let url = client
            .presign(
                &Context::background(),
                Method::GET,
                "bucket",
                "reports/q1 2025.csv",
                Duration::from_secs(900),
                query,
                None,
            )
            .await
            .unwrap();

        assert_eq!(url.path(), "/bucket/reports/q1%202025.csv");
        let params = query_map(&url);
        assert_eq!(params["X-Amz-Algorithm"], "AWS4-HMAC-SHA256");
        assert!(params["X-Amz-Credential"].starts_with("minio/"));
        assert!(params["X-Amz-Credential"].ends_with("/us-east-1/s3/aws4_request"));
        assert_eq!(params["X-Amz-Expires"], "900");
        assert_eq!(params["X-Amz-SignedHeaders"], "host");
        assert_eq!(params["X-Amz-Signature"].len(), 64);
        assert_eq!(params["response-content-type"], "text/plain");
    }

    #[tokio::test]
    async fn test_v4_presign_signs_extra_headers() {
        let client = client("localhost:9000", Credentials::new("minio", "minio123"));
        let mut extra = HeaderMap::new();
        extra.insert("x-amz-meta-owner", HeaderValue::from_static("alice"));
        let url = client
            .presign(
                &Context::background(),
                Method::PUT,
                "bucket",
                "key",
                Duration::from_secs(60),
                BTreeMap::new(),
                Some(extra),
            )
            .await
            .unwrap();
        assert_eq!(query_map(&url)["X-Amz-SignedHeaders"], "host;x-amz-meta-owner");
    }

    #[tokio::test]
    async fn test_session_token_in_presigned_url() {
        let client = client(
            "localhost:9000",
            Credentials::with_session_token("minio", "minio123", "session-token"),
        );
        let url = client
            .presign(
                &Context::background(),
                Method::GET,
                "bucket",
                "key",
                Duration::from_secs(60),
                BTreeMap::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(query_map(&url)["X-Amz-Security-Token"], "session-token");
    }

    #[tokio::test]
    async fn test_legacy_presigned_url_parameters() {
        let client = client(
            "localhost:9000",
            Credentials::new("minio", "minio123").with_signature(SignatureType::V2),
        );
        let url = client
            .presign(
                &Context::background(),
                Method::GET,
                "bucket",
                "key",
                Duration::from_secs(60),
                BTreeMap::new(),
                None,
            )
            .await
            .unwrap();
        let params = query_map(&url);
        assert_eq!(params["AWSAccessKeyId"], "minio");
        assert!(params.contains_key("Expires"));
        assert!(params.contains_key("Signature"));
        assert!(!params.contains_key("X-Amz-Signature"));
    }

    #[tokio::test]
    async fn test_presigned_request_carries_no_body() {
        let client = client("localhost:9000", Credentials::new("minio", "minio123"));
        let metadata = RequestMetadata {
            presign_url: true,
            expires: 60,
            ..RequestMetadata::new("bucket", "key")
        }
        .with_body(b"payload".to_vec(), 7);

        let req = client
            .new_request(&Context::background(), Method::PUT, metadata)
            .await
            .unwrap();
        assert!(req.payload.is_empty());
        assert!(req.header("user-agent").is_none());
        assert!(req.header("authorization").is_none());
        assert!(req.url.query().unwrap().contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn test_presigned_url_is_usable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/key.txt"))
            .and(query_param("X-Amz-Algorithm", "AWS4-HMAC-SHA256"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server.address().to_string(), Credentials::new("minio", "minio123"));
        let url = client
            .presign(
                &Context::background(),
                Method::GET,
                "bucket",
                "key.txt",
                Duration::from_secs(60),
                BTreeMap::new(),
                None,
            )
            .await
            .unwrap();

        let body = reqwest::get(url).await.unwrap().text().await.unwrap();
        assert_eq!(body, "hello");
    }
}

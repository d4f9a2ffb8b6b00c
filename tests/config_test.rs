//! Configuration Integration Tests
//!
//! YAML files on disk, environment expansion and the client they build.

#[cfg(test)]
mod tests {
    use std::io::Write;

    use mizuchi_s3::config::{ClientConfig, ConfigError, SignatureKind};
    use mizuchi_s3::s3::{BucketLookup, Client, Context, CredentialsProvider};
    use mizuchi_s3::signer::SignatureType;
    use reqwest::Method;
    use serial_test::serial;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    // ========================================================================
    // Loading
    // ========================================================================

    #[test]
    fn test_minimal_config_defaults() {
        let file = write_config("client:\n  endpoint: localhost:9000\n");
        let config = ClientConfig::load(file.path()).unwrap();

        assert_eq!(config.client.endpoint, "localhost:9000");
        assert!(config.client.secure);
        assert!(config.client.region.is_empty());
        assert_eq!(config.client.bucket_lookup, BucketLookup::Auto);
        assert_eq!(config.credentials.signature, SignatureKind::V4);
        assert!(!config.health_check.enabled);
        assert_eq!(config.health_check.interval_seconds, 5);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"
client:
  endpoint: minio.internal:9000
  secure: false
  region: eu-central-1
  bucket_lookup: path
  max_retries: 3
  trailing_headers: true
  app_name: uploader
  app_version: "2.1"
credentials:
  access_key: minio
  secret_key: minio123
  signature: v2
health_check:
  enabled: true
  interval_seconds: 2
logging:
  level: debug
  format: json
"#,
        );
        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.client.bucket_lookup, BucketLookup::Path);
        assert_eq!(config.client.max_retries, 3);
        assert_eq!(config.credentials.signature, SignatureKind::V2);
        assert_eq!(SignatureType::from(config.credentials.signature), SignatureType::V2);
        assert_eq!(config.logging.format, "json");

        let client = Client::from_config(&config).unwrap();
        assert_eq!(client.endpoint_url().as_str(), "http://minio.internal:9000/");
        assert_eq!(client.region(), "eu-central-1");
        assert_eq!(client.max_retries(), 3);
        // trailers need a V4 signature
        assert!(!client.trailing_header_support());
        assert!(client.user_agent().ends_with("uploader/2.1"));
    }

    #[test]
    #[serial]
    fn test_env_expansion() {
        std::env::set_var("MIZUCHI_S3_TEST_ENDPOINT", "s3.example.net");
        std::env::set_var("MIZUCHI_S3_TEST_SECRET", "from-env");
        std::env::remove_var("MIZUCHI_S3_TEST_REGION");

        let file = write_config(
            r#"
client:
  endpoint: "${MIZUCHI_S3_TEST_ENDPOINT}"
  region: "${MIZUCHI_S3_TEST_REGION:-ap-southeast-2}"
credentials:
  access_key: key
  secret_key: "${MIZUCHI_S3_TEST_SECRET}"
"#,
        );
        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.client.endpoint, "s3.example.net");
        assert_eq!(config.client.region, "ap-southeast-2");
        assert_eq!(config.credentials.secret_key.as_deref(), Some("from-env"));

        std::env::remove_var("MIZUCHI_S3_TEST_ENDPOINT");
        std::env::remove_var("MIZUCHI_S3_TEST_SECRET");
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn test_validation_errors() {
        let cases = [
            "client:\n  endpoint: \"\"\n",
            "client:\n  endpoint: https://s3.amazonaws.com\n",
            "client:\n  endpoint: localhost:9000\ncredentials:\n  access_key: only-half\n",
            "client:\n  endpoint: localhost:9000\nhealth_check:\n  enabled: true\n  interval_seconds: 0\n",
            "client:\n  endpoint: localhost:9000\nlogging:\n  format: xml\n",
        ];
        for yaml in cases {
            let result = ClientConfig::from_yaml(yaml);
            assert!(
                matches!(result, Err(ConfigError::ValidationError(_))),
                "expected validation error for {yaml:?}"
            );
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ClientConfig::from_yaml("client: [unclosed"),
            Err(ConfigError::ParseError(_))
        ));
        assert!(matches!(
            ClientConfig::from_yaml("client:\n  endpoint: localhost:9000\n  bucket_lookup: sideways\n"),
            Err(ConfigError::ParseError(_))
        ));
        assert!(matches!(
            ClientConfig::load("/nonexistent/mizuchi-s3.yaml"),
            Err(ConfigError::IoError(_))
        ));
    }

    // ========================================================================
    // Client construction
    // ========================================================================

    #[tokio::test]
    async fn test_configured_client_presigns() {
        let config = ClientConfig::from_yaml(
            r#"
client:
  endpoint: localhost:9000
  secure: false
  region: us-east-1
credentials:
  access_key: minio
  secret_key: minio123
"#,
        )
        .unwrap();
        let client = Client::from_config(&config).unwrap();
        let url = client
            .presign(
                &Context::background(),
                Method::GET,
                "bucket",
                "key",
                std::time::Duration::from_secs(60),
                Default::default(),
                None,
            )
            .await
            .unwrap();
        assert!(url.as_str().starts_with("http://localhost:9000/bucket/key?"));
        assert!(url.query().unwrap().contains("X-Amz-Credential=minio%2F"));
    }

    #[tokio::test]
    async fn test_anonymous_signature_config() {
        let config = ClientConfig::from_yaml(
            "client:\n  endpoint: localhost:9000\n  region: us-east-1\ncredentials:\n  signature: anonymous\n",
        )
        .unwrap();
        let creds = config
            .credentials_provider()
            .get(&Context::background())
            .await
            .unwrap();
        assert!(creds.signature_type().is_anonymous());
    }
}

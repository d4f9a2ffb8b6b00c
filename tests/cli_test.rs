//! CLI Integration Tests
//!
//! Runs the `mizuchi-s3` binary for the commands that need no network.

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_cmd::Command;
    use predicates::prelude::*;
    use tempfile::NamedTempFile;

    fn cli() -> Command {
        let mut cmd = Command::cargo_bin("mizuchi-s3").unwrap();
        cmd.env_remove("RUST_LOG");
        cmd
    }

    fn config_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "client:\n  endpoint: localhost:9000\n  secure: false\n  region: us-east-1\n\
             credentials:\n  access_key: minio\n  secret_key: minio123\n"
        )
        .unwrap();
        file
    }

    // ========================================================================
    // Help
    // ========================================================================

    #[test]
    fn test_help_lists_commands() {
        cli()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("presign"))
            .stdout(predicate::str::contains("location"))
            .stdout(predicate::str::contains("health"))
            .stdout(predicate::str::contains("policy"));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        cli().assert().failure();
    }

    // ========================================================================
    // Policy
    // ========================================================================

    #[test]
    fn test_policy_prints_document() {
        cli()
            .args([
                "policy",
                "--bucket",
                "mymusic",
                "--key-prefix",
                "uploads/",
                "--max-size",
                "1024",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains(r#"["eq","$bucket","mymusic"]"#))
            .stdout(predicate::str::contains(r#"["starts-with","$key","uploads/"]"#))
            .stdout(predicate::str::contains(r#"["content-length-range",0,1024]"#));
    }

    #[test]
    fn test_policy_rejects_bad_size() {
        cli()
            .args(["policy", "--bucket", "mymusic", "--max-size", "0"])
            .assert()
            .failure();
    }

    // ========================================================================
    // Presign
    // ========================================================================

    #[test]
    fn test_presign_with_config() {
        let config = config_file();
        cli()
            .arg("--config")
            .arg(config.path())
            .args(["presign", "--bucket", "photos", "--object", "cat.png", "--expires", "600"])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("http://localhost:9000/photos/cat.png?"))
            .stdout(predicate::str::contains("X-Amz-Expires=600"))
            .stdout(predicate::str::contains("X-Amz-Signature="));
    }

    #[test]
    fn test_presign_requires_config() {
        cli()
            .args(["presign", "--bucket", "photos", "--object", "cat.png"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--config is required"));
    }

    #[test]
    fn test_presign_rejects_long_expiry() {
        let config = config_file();
        cli()
            .arg("--config")
            .arg(config.path())
            .args(["presign", "--bucket", "photos", "--object", "cat.png", "--expires", "700000"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("7 days"));
    }

    #[test]
    fn test_unreadable_config_fails() {
        cli()
            .args(["--config", "/nonexistent/mizuchi-s3.yaml", "policy", "--bucket", "b"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to load configuration"));
    }
}

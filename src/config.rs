//! Construction-time configuration for the secrets backend.

use chrono::Duration;
use std::env;
use std::time::Duration as StdDuration;

use crate::errors::{Error, Result};

pub const DEFAULT_BUCKET_VAR: &str = "GCS_BUCKET";
pub const DEFAULT_CONNECTIONS_PREFIX: &str = "connections";
pub const DEFAULT_VARIABLES_PREFIX: &str = "variables";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;

/// Backend configuration, resolved once at construction.
///
/// The bucket environment variable is one injectable source rather than a
/// module-level global: an explicit bucket always wins, and the variable
/// name itself can be overridden.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    bucket: Option<String>,
    bucket_var: String,
    pub(crate) connections_prefix: String,
    pub(crate) variables_prefix: String,
    pub(crate) ignore_mac: bool,
    pub(crate) http_timeout: StdDuration,
    pub(crate) rotation_after: Duration,
}

impl BackendConfig {
    pub fn new() -> Self {
        Self {
            bucket: None,
            bucket_var: DEFAULT_BUCKET_VAR.to_string(),
            connections_prefix: DEFAULT_CONNECTIONS_PREFIX.to_string(),
            variables_prefix: DEFAULT_VARIABLES_PREFIX.to_string(),
            ignore_mac: true,
            http_timeout: StdDuration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            rotation_after: Duration::days(90),
        }
    }

    /// Set the bucket explicitly, bypassing the environment fallback.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        self.bucket = if bucket.trim().is_empty() {
            None
        } else {
            Some(bucket)
        };
        self
    }

    /// Override the environment variable consulted when no explicit bucket
    /// was provided.
    pub fn bucket_var(mut self, var: impl Into<String>) -> Self {
        self.bucket_var = var.into();
        self
    }

    /// Object-path prefix for connection secrets.
    pub fn connections_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.connections_prefix = prefix.into();
        self
    }

    /// Object-path prefix for variable secrets.
    pub fn variables_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.variables_prefix = prefix.into();
        self
    }

    /// Whether per-leaf integrity failures are tolerated (default: true).
    pub fn ignore_mac(mut self, ignore: bool) -> Self {
        self.ignore_mac = ignore;
        self
    }

    /// Bound for every storage/KMS network call.
    pub fn http_timeout(mut self, timeout: StdDuration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Age after which the rotation advisory fires.
    pub fn rotation_after(mut self, age: Duration) -> Self {
        self.rotation_after = age;
        self
    }

    /// Resolves the bucket name: explicit value first, then the configured
    /// environment variable. Fails fast when neither is set.
    pub fn resolve_bucket(&self) -> Result<String> {
        if let Some(bucket) = &self.bucket {
            return Ok(bucket.clone());
        }
        env::var(&self.bucket_var)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or(Error::MissingBucket)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_bucket_wins_over_environment() {
        let config = BackendConfig::new()
            .bucket("explicit-bucket")
            .bucket_var("GCS_BUCKET_TEST_UNSET");
        assert_eq!(config.resolve_bucket().expect("bucket"), "explicit-bucket");
    }

    #[test]
    fn env_fallback_is_used_when_no_explicit_bucket() {
        std::env::set_var("GCS_BUCKET_TEST_FALLBACK", "env-bucket");
        let config = BackendConfig::new().bucket_var("GCS_BUCKET_TEST_FALLBACK");
        assert_eq!(config.resolve_bucket().expect("bucket"), "env-bucket");
    }

    #[test]
    fn missing_bucket_fails_fast() {
        let config = BackendConfig::new().bucket_var("GCS_BUCKET_TEST_MISSING");
        assert_eq!(config.resolve_bucket().unwrap_err(), Error::MissingBucket);
    }

    #[test]
    fn blank_explicit_bucket_falls_through() {
        let config = BackendConfig::new()
            .bucket("  ")
            .bucket_var("GCS_BUCKET_TEST_MISSING_2");
        assert_eq!(config.resolve_bucket().unwrap_err(), Error::MissingBucket);
    }
}

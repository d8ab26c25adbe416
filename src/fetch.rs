//! Object-store collaborator: retrieves raw encrypted document bytes.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::env;
use std::sync::Arc;

use crate::errors::{Error, Result};

pub const STORAGE_ENDPOINT: &str = "https://storage.googleapis.com/storage/v1";
const TOKEN_VARS: [&str; 2] = ["GCS_ACCESS_TOKEN", "GOOGLE_OAUTH_ACCESS_TOKEN"];

/// Retrieves raw encrypted document bytes by logical object path.
pub trait DocumentFetcher: Send + Sync {
    /// Returns the object bytes, or [`Error::NotFound`] when the path does
    /// not exist in storage.
    fn fetch(&self, object_path: &str) -> Result<Vec<u8>>;
}

impl<T> DocumentFetcher for Arc<T>
where
    T: DocumentFetcher + ?Sized,
{
    fn fetch(&self, object_path: &str) -> Result<Vec<u8>> {
        (**self).fetch(object_path)
    }
}

/// Fetcher over the Cloud Storage JSON API.
///
/// The bearer token is read from the environment on every call, so a
/// missing or rotated credential surfaces as a per-lookup storage error
/// instead of poisoning the backend at construction.
#[derive(Clone)]
pub struct GcsFetcher {
    client: Client,
    endpoint: String,
    bucket: String,
}

impl GcsFetcher {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self::with_endpoint(client, bucket, STORAGE_ENDPOINT)
    }

    pub fn with_endpoint(
        client: Client,
        bucket: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            bucket: bucket.into(),
        }
    }

    fn bearer(&self) -> Result<String> {
        let token = TOKEN_VARS
            .iter()
            .find_map(|var| env::var(var).ok())
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                Error::Storage(format!(
                    "no access token available (set {} or {})",
                    TOKEN_VARS[0], TOKEN_VARS[1]
                ))
            })?;
        Ok(format!("Bearer {token}"))
    }

    fn object_url(&self, object_path: &str) -> String {
        format!(
            "{}/b/{}/o/{}?alt=media",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            utf8_percent_encode(object_path, NON_ALPHANUMERIC)
        )
    }
}

impl DocumentFetcher for GcsFetcher {
    fn fetch(&self, object_path: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.object_url(object_path))
            .header("Authorization", self.bearer()?)
            .send()
            .map_err(|err| Error::Storage(format!("download request failed: {err}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound {
                path: object_path.to_string(),
            }),
            status if status.is_success() => {
                let bytes = response
                    .bytes()
                    .map_err(|err| Error::Storage(format!("download read failed: {err}")))?;
                tracing::debug!(object = object_path, size = bytes.len(), "downloaded secret object");
                Ok(bytes.to_vec())
            }
            status => {
                let text = response.text().unwrap_or_default();
                Err(Error::Storage(format!(
                    "download of {object_path} failed: {status} {text}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_paths_are_percent_encoded() {
        let fetcher = GcsFetcher::new(Client::new(), "my-bucket");
        let url = fetcher.object_url("connections/pg main.enc.yaml");
        assert!(url.contains("/b/my-bucket/o/"));
        assert!(url.contains("connections%2Fpg%20main%2Eenc%2Eyaml"));
        assert!(url.ends_with("alt=media"));
    }

    #[test]
    fn missing_token_surfaces_per_call() {
        std::env::remove_var("GCS_ACCESS_TOKEN");
        std::env::remove_var("GOOGLE_OAUTH_ACCESS_TOKEN");
        let fetcher = GcsFetcher::new(Client::new(), "my-bucket");
        let err = fetcher.fetch("connections/pg.enc.yaml").unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }
}

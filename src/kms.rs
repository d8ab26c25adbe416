//! Managed key-management-service collaborator.
//!
//! The resolver obtains a client per candidate through [`KmsClientFactory`]
//! so a construction failure is recorded against that candidate and the
//! remaining grants are still tried.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::sync::Arc;

use crate::errors::{Error, Result};

pub const KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com/v1";
const TOKEN_VARS: [&str; 2] = ["GCP_KMS_ACCESS_TOKEN", "GOOGLE_OAUTH_ACCESS_TOKEN"];

/// Unwraps a wrapped data key through a managed key service.
pub trait KmsService: Send + Sync {
    fn decrypt(&self, resource_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Produces a [`KmsService`] handle for a single candidate attempt.
pub trait KmsClientFactory: Send + Sync {
    fn connect(&self) -> Result<Box<dyn KmsService>>;
}

impl<T> KmsClientFactory for Arc<T>
where
    T: KmsClientFactory + ?Sized,
{
    fn connect(&self) -> Result<Box<dyn KmsService>> {
        (**self).connect()
    }
}

/// Factory for clients talking to Cloud KMS over HTTPS.
///
/// The HTTP connection pool is shared; the bearer token is read lazily at
/// connect time so expired or missing credentials surface as per-candidate
/// diagnostics rather than construction failures of the whole backend.
#[derive(Clone)]
pub struct HttpKmsFactory {
    client: Client,
    endpoint: String,
}

impl HttpKmsFactory {
    pub fn new(client: Client) -> Self {
        Self::with_endpoint(client, KMS_ENDPOINT)
    }

    pub fn with_endpoint(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

impl KmsClientFactory for HttpKmsFactory {
    fn connect(&self) -> Result<Box<dyn KmsService>> {
        let token = TOKEN_VARS
            .iter()
            .find_map(|var| env::var(var).ok())
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                Error::Kms(format!(
                    "no access token available (set {} or {})",
                    TOKEN_VARS[0], TOKEN_VARS[1]
                ))
            })?;

        Ok(Box::new(HttpKmsClient {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            bearer: format!("Bearer {token}"),
        }))
    }
}

struct HttpKmsClient {
    client: Client,
    endpoint: String,
    bearer: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: Option<String>,
}

impl KmsService for HttpKmsClient {
    fn decrypt(&self, resource_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let url = format!(
            "{}/{}:decrypt",
            self.endpoint.trim_end_matches('/'),
            resource_id
        );
        let body = json!({ "ciphertext": STANDARD.encode(ciphertext) });

        let response = self
            .client
            .post(url)
            .header("Authorization", &self.bearer)
            .json(&body)
            .send()
            .map_err(|err| Error::Kms(format!("decrypt request failed: {err}")))?;

        let status = response.status();
        let text = response.text().unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::Kms(format!("key {resource_id} not found")));
        }
        if !status.is_success() {
            return Err(Error::Kms(format!("decrypt failed: {status} {text}")));
        }

        let parsed: DecryptResponse = serde_json::from_str(&text)
            .map_err(|err| Error::Kms(format!("failed to parse decrypt response: {err}")))?;
        let plaintext = parsed
            .plaintext
            .ok_or_else(|| Error::Kms("decrypt response missing plaintext".into()))?;
        STANDARD
            .decode(plaintext)
            .map_err(|err| Error::Kms(format!("plaintext decode failed: {err}")))
    }
}

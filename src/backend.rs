//! Secrets-backend entry points consumed by the orchestrator.

use reqwest::blocking::Client;
use std::sync::Arc;

use crate::config::BackendConfig;
use crate::decrypt::decrypt_tree;
use crate::document::Document;
use crate::errors::{Error, Result};
use crate::fetch::{DocumentFetcher, GcsFetcher};
use crate::keys::KeyResolver;
use crate::kms::{HttpKmsFactory, KmsClientFactory};
use crate::mapper::{self, Connection};
use crate::metadata::{Metadata, RotationPolicy};
use crate::pgp::{GnupgKeyStore, PgpKeyStore};

/// Read-through decryption proxy over encrypted secret documents.
///
/// Every lookup is an independent, stateless call: fetch, parse, resolve
/// the data key, decrypt, map. Nothing decrypted is retained. The only
/// shared state is the pooled HTTP client inside the collaborators, which
/// is safe for concurrent use.
pub struct SopsSecretsBackend {
    config: BackendConfig,
    fetcher: Arc<dyn DocumentFetcher>,
    kms: Arc<dyn KmsClientFactory>,
    pgp: Arc<dyn PgpKeyStore>,
    rotation: RotationPolicy,
}

impl SopsSecretsBackend {
    /// Builds the backend with the real collaborators: Cloud Storage
    /// fetcher, Cloud KMS client factory, and the local GnuPG keyring.
    ///
    /// Fails fast only when no bucket is configured. Credentials are read
    /// per call, so a missing or expired token fails the lookup that needs
    /// it rather than the whole backend.
    pub fn new(config: BackendConfig) -> Result<Self> {
        let bucket = config.resolve_bucket()?;
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|err| Error::Storage(format!("failed to build http client: {err}")))?;

        let fetcher = GcsFetcher::new(client.clone(), bucket);
        let kms = HttpKmsFactory::new(client);

        Ok(Self::with_components(
            config,
            Arc::new(fetcher),
            Arc::new(kms),
            Arc::new(GnupgKeyStore::new()),
        ))
    }

    /// Wires the backend from explicit collaborators.
    pub fn with_components(
        config: BackendConfig,
        fetcher: Arc<dyn DocumentFetcher>,
        kms: Arc<dyn KmsClientFactory>,
        pgp: Arc<dyn PgpKeyStore>,
    ) -> Self {
        let rotation = RotationPolicy::new(config.rotation_after);
        Self {
            config,
            fetcher,
            kms,
            pgp,
            rotation,
        }
    }

    /// Looks up a connection-shaped secret. Absence (missing object or a
    /// document that decrypts to nothing) is `Ok(None)`, never an error.
    pub fn get_connection(&self, conn_id: &str) -> Result<Option<Connection>> {
        let path = self.object_path(&self.config.connections_prefix, conn_id);
        match self.resolve_document(&path)? {
            Some(doc) => Ok(mapper::to_connection(conn_id, doc)),
            None => Ok(None),
        }
    }

    /// The connection rendered in the orchestrator URI form.
    pub fn get_conn_uri(&self, conn_id: &str) -> Result<Option<String>> {
        Ok(self.get_connection(conn_id)?.map(|conn| conn.uri()))
    }

    /// Looks up a variable-shaped secret: the scalar under the literal
    /// `value` key.
    pub fn get_variable(&self, key: &str) -> Result<Option<String>> {
        let path = self.object_path(&self.config.variables_prefix, key);
        match self.resolve_document(&path)? {
            Some(doc) => Ok(mapper::to_variable(doc)),
            None => Ok(None),
        }
    }

    fn object_path(&self, prefix: &str, secret_id: &str) -> String {
        format!("{prefix}/{secret_id}.enc.yaml")
    }

    /// Runs the resolution pipeline for one object path.
    fn resolve_document(&self, path: &str) -> Result<Option<Document>> {
        let bytes = match self.fetcher.fetch(path) {
            Ok(bytes) => bytes,
            Err(Error::NotFound { .. }) => {
                tracing::debug!(object = path, "secret object not present");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let doc = Document::parse(&bytes)?;
        let metadata = Metadata::from_document(&doc);

        // Advisory only; runs regardless of whether a key can be resolved.
        self.rotation.check(&metadata);

        let key = KeyResolver::new(&*self.kms, &*self.pgp).resolve(&metadata)?;
        let plain = decrypt_tree(&doc, &key, self.config.ignore_mac)?;

        if plain.is_empty() {
            tracing::debug!(object = path, "secret document decrypted to an empty result");
        }
        Ok(Some(plain))
    }
}

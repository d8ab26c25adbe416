//! Orchestrator secrets backend resolving SOPS-encrypted documents from
//! Google Cloud Storage.
//!
//! Each lookup fetches an encrypted YAML document, recovers its 256-bit
//! data key (Cloud KMS grants first, the local GnuPG keyring as fallback),
//! decrypts every leaf, and maps the result into a connection record or a
//! scalar variable. Lookups are stateless and independent; nothing
//! decrypted is cached.

pub mod backend;
pub mod config;
pub mod decrypt;
pub mod document;
pub mod errors;
pub mod fetch;
pub mod keys;
pub mod kms;
pub mod mapper;
pub mod metadata;
pub mod pgp;

pub use backend::SopsSecretsBackend;
pub use config::BackendConfig;
pub use decrypt::decrypt_tree;
pub use document::{Document, Node, Scalar};
pub use errors::{Error, Result};
pub use fetch::{DocumentFetcher, GcsFetcher};
pub use keys::{DataKey, KeyResolver};
pub use kms::{HttpKmsFactory, KmsClientFactory, KmsService};
pub use mapper::Connection;
pub use metadata::{Metadata, RotationPolicy};
pub use pgp::{GnupgKeyStore, PgpKeyStore};

//! Data-key resolution: managed KMS grants first, asymmetric fallback
//! second, with per-candidate failure isolation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use zeroize::Zeroizing;

use crate::errors::{Error, Result};
use crate::kms::KmsClientFactory;
use crate::metadata::Metadata;
use crate::pgp::PgpKeyStore;

pub const DATA_KEY_LEN: usize = 32;

/// The document's symmetric data key. Owned by the current resolution call
/// and wiped on drop; never persisted or reused across calls.
pub struct DataKey(Zeroizing<[u8; DATA_KEY_LEN]>);

impl DataKey {
    /// Accepts exactly 256 bits of key material.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let mut key = Zeroizing::new([0u8; DATA_KEY_LEN]);
        if bytes.len() != DATA_KEY_LEN {
            return None;
        }
        key.copy_from_slice(bytes);
        Some(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; DATA_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// Resolves the document data key from its metadata.
pub struct KeyResolver<'a> {
    kms: &'a dyn KmsClientFactory,
    pgp: &'a dyn PgpKeyStore,
}

impl<'a> KeyResolver<'a> {
    pub fn new(kms: &'a dyn KmsClientFactory, pgp: &'a dyn PgpKeyStore) -> Self {
        Self { kms, pgp }
    }

    /// Tries every managed candidate in document order, then the
    /// asymmetric fallback. The first unwrapped key wins; if both
    /// strategies are exhausted the error carries one diagnostic per
    /// attempted candidate.
    pub fn resolve(&self, metadata: &Metadata) -> Result<DataKey> {
        let mut attempts = Vec::new();

        if let Some(key) = self.try_kms(metadata, &mut attempts) {
            return Ok(key);
        }
        if !attempts.is_empty() {
            tracing::warn!("no managed key grant could be used:");
            for attempt in &attempts {
                tracing::warn!("* {attempt}");
            }
        }

        if let Some(key) = self.try_pgp(metadata, &mut attempts) {
            return Ok(key);
        }

        Err(Error::KeyResolution { attempts })
    }

    fn try_kms(&self, metadata: &Metadata, attempts: &mut Vec<String>) -> Option<DataKey> {
        for (index, candidate) in metadata.kms.iter().enumerate() {
            if candidate.is_empty() {
                continue;
            }
            let Some(enc) = candidate.enc.as_deref() else {
                continue;
            };
            let Some(resource_id) = candidate.resource_id.as_deref() else {
                tracing::warn!(entry = index, "kms resource id not found, skipping entry");
                continue;
            };

            let wrapped = match STANDARD.decode(enc) {
                Ok(bytes) => bytes,
                Err(err) => {
                    attempts.push(format!("kms {resource_id} has an undecodable wrapped key: {err}"));
                    continue;
                }
            };

            let client = match self.kms.connect() {
                Ok(client) => client,
                Err(err) => {
                    attempts.push(format!("no kms client could be obtained for {resource_id}: {err}"));
                    continue;
                }
            };

            match client.decrypt(resource_id, &wrapped) {
                Ok(plaintext) => match DataKey::from_slice(&plaintext) {
                    Some(key) => return Some(key),
                    None => {
                        attempts.push(format!(
                            "kms {resource_id} returned {} bytes instead of a 256-bit key",
                            plaintext.len()
                        ));
                    }
                },
                Err(err) => {
                    attempts.push(format!("kms {resource_id} failed: {err}"));
                }
            }
        }
        None
    }

    fn try_pgp(&self, metadata: &Metadata, attempts: &mut Vec<String>) -> Option<DataKey> {
        for candidate in &metadata.pgp {
            let (Some(fingerprint), Some(enc)) =
                (candidate.fingerprint.as_deref(), candidate.enc.as_deref())
            else {
                continue;
            };

            match self.pgp.unwrap_key(fingerprint, enc) {
                Ok(plaintext) => match DataKey::from_slice(&plaintext) {
                    Some(key) => return Some(key),
                    None => {
                        attempts.push(format!(
                            "pgp {fingerprint} returned {} bytes instead of a 256-bit key",
                            plaintext.len()
                        ));
                    }
                },
                Err(err) => {
                    attempts.push(format!("pgp {fingerprint} failed: {err}"));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::{KmsClientFactory, KmsService};
    use crate::metadata::{KmsCandidate, PgpCandidate};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedKms {
        accepted_resource: &'static str,
        key: [u8; 32],
        calls: Arc<AtomicUsize>,
    }

    impl KmsService for FixedKms {
        fn decrypt(&self, resource_id: &str, _ciphertext: &[u8]) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if resource_id == self.accepted_resource {
                Ok(self.key.to_vec())
            } else {
                Err(Error::Kms(format!("permission denied on {resource_id}")))
            }
        }
    }

    struct FixedKmsFactory {
        accepted_resource: &'static str,
        key: [u8; 32],
        calls: Arc<AtomicUsize>,
    }

    impl KmsClientFactory for FixedKmsFactory {
        fn connect(&self) -> Result<Box<dyn KmsService>> {
            Ok(Box::new(FixedKms {
                accepted_resource: self.accepted_resource,
                key: self.key,
                calls: self.calls.clone(),
            }))
        }
    }

    struct BrokenKmsFactory;

    impl KmsClientFactory for BrokenKmsFactory {
        fn connect(&self) -> Result<Box<dyn KmsService>> {
            Err(Error::Kms("credentials unavailable".into()))
        }
    }

    struct NoPgp;

    impl PgpKeyStore for NoPgp {
        fn unwrap_key(&self, fingerprint: &str, _armored: &str) -> Result<Vec<u8>> {
            Err(Error::Pgp(format!("no secret key for {fingerprint}")))
        }
    }

    struct StaticPgp([u8; 32]);

    impl PgpKeyStore for StaticPgp {
        fn unwrap_key(&self, _fingerprint: &str, _armored: &str) -> Result<Vec<u8>> {
            Ok(self.0.to_vec())
        }
    }

    fn candidate(resource_id: &str) -> KmsCandidate {
        KmsCandidate {
            resource_id: if resource_id.is_empty() {
                None
            } else {
                Some(resource_id.to_string())
            },
            enc: Some(STANDARD.encode(b"wrapped")),
        }
    }

    #[test]
    fn malformed_candidate_is_skipped_and_the_next_one_resolves() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = FixedKmsFactory {
            accepted_resource: "projects/p/keys/good",
            key: [7u8; 32],
            calls: calls.clone(),
        };
        let metadata = Metadata {
            kms: vec![candidate(""), candidate("projects/p/keys/good")],
            ..Metadata::default()
        };

        let key = KeyResolver::new(&factory, &NoPgp)
            .resolve(&metadata)
            .expect("resolve");
        assert_eq!(key.as_bytes(), &[7u8; 32]);
        // The blank-resource candidate never reaches the service.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_success_short_circuits_remaining_candidates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = FixedKmsFactory {
            accepted_resource: "projects/p/keys/first",
            key: [1u8; 32],
            calls: calls.clone(),
        };
        let metadata = Metadata {
            kms: vec![
                candidate("projects/p/keys/first"),
                candidate("projects/p/keys/second"),
            ],
            ..Metadata::default()
        };

        KeyResolver::new(&factory, &NoPgp)
            .resolve(&metadata)
            .expect("resolve");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_strategies_report_one_diagnostic_per_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = FixedKmsFactory {
            accepted_resource: "projects/p/keys/none",
            key: [0u8; 32],
            calls,
        };
        let metadata = Metadata {
            kms: vec![candidate("projects/p/keys/a"), candidate("projects/p/keys/b")],
            pgp: vec![PgpCandidate {
                fingerprint: Some("AB12".into()),
                enc: Some("-----BEGIN PGP MESSAGE-----".into()),
            }],
            ..Metadata::default()
        };

        let err = KeyResolver::new(&factory, &NoPgp)
            .resolve(&metadata)
            .unwrap_err();
        match err {
            Error::KeyResolution { attempts } => {
                assert_eq!(attempts.len(), 3);
                assert!(attempts[0].contains("projects/p/keys/a"));
                assert!(attempts[1].contains("projects/p/keys/b"));
                assert!(attempts[2].contains("AB12"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn client_construction_failure_does_not_abort_the_strategy() {
        let metadata = Metadata {
            kms: vec![candidate("projects/p/keys/a")],
            ..Metadata::default()
        };

        let err = KeyResolver::new(&BrokenKmsFactory, &StaticPgp([9u8; 32]))
            .resolve(&metadata)
            .map(|_| ())
            .unwrap_err();
        // No pgp candidates, so the recorded kms failure is surfaced.
        match err {
            Error::KeyResolution { attempts } => {
                assert_eq!(attempts.len(), 1);
                assert!(attempts[0].contains("no kms client could be obtained"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_pgp_when_managed_grants_fail() {
        let metadata = Metadata {
            kms: vec![candidate("projects/p/keys/a")],
            pgp: vec![PgpCandidate {
                fingerprint: Some("AB12".into()),
                enc: Some("-----BEGIN PGP MESSAGE-----".into()),
            }],
            ..Metadata::default()
        };

        let key = KeyResolver::new(&BrokenKmsFactory, &StaticPgp([9u8; 32]))
            .resolve(&metadata)
            .expect("fallback");
        assert_eq!(key.as_bytes(), &[9u8; 32]);
    }

    #[test]
    fn short_key_material_is_rejected() {
        assert!(DataKey::from_slice(&[0u8; 16]).is_none());
        assert!(DataKey::from_slice(&[0u8; 32]).is_some());
    }
}

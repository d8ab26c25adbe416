//! Encryption metadata carried under the document's reserved `sops` key.

use chrono::{DateTime, Duration, Utc};

use crate::document::{Document, Node};

/// One managed-KMS key grant. Fields are optional because malformed
/// candidates are skipped during resolution rather than rejected at parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KmsCandidate {
    pub resource_id: Option<String>,
    pub enc: Option<String>,
}

impl KmsCandidate {
    pub fn is_empty(&self) -> bool {
        self.resource_id.is_none() && self.enc.is_none()
    }
}

/// One asymmetric (PGP) key grant for the fallback strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PgpCandidate {
    pub fingerprint: Option<String>,
    pub enc: Option<String>,
}

/// Typed view of the metadata subtree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub kms: Vec<KmsCandidate>,
    pub pgp: Vec<PgpCandidate>,
    pub last_modified: Option<String>,
    pub version: Option<String>,
}

impl Metadata {
    /// Extracts metadata from a parsed document. A missing or malformed
    /// subtree yields an empty metadata record; the key resolver turns
    /// that into a resolution failure with its own diagnostics.
    pub fn from_document(doc: &Document) -> Self {
        let Some(node) = doc.metadata_node() else {
            return Self::default();
        };

        let kms = node
            .get("gcp_kms")
            .and_then(Node::as_sequence)
            .map(|items| items.iter().map(kms_candidate).collect())
            .unwrap_or_default();

        let pgp = node
            .get("pgp")
            .and_then(Node::as_sequence)
            .map(|items| items.iter().map(pgp_candidate).collect())
            .unwrap_or_default();

        Self {
            kms,
            pgp,
            last_modified: string_field(node, "lastmodified"),
            version: string_field(node, "version"),
        }
    }
}

fn kms_candidate(node: &Node) -> KmsCandidate {
    KmsCandidate {
        resource_id: string_field(node, "resource_id"),
        enc: string_field(node, "enc"),
    }
}

fn pgp_candidate(node: &Node) -> PgpCandidate {
    PgpCandidate {
        fingerprint: string_field(node, "fp"),
        enc: string_field(node, "enc"),
    }
}

fn string_field(node: &Node, key: &str) -> Option<String> {
    node.get(key)
        .and_then(Node::as_scalar)
        .map(|scalar| scalar.render())
        .filter(|value| !value.is_empty())
}

/// Advisory check for aging key material. Purely informational: it emits a
/// warning and never fails or blocks decryption.
#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    threshold: Duration,
}

impl RotationPolicy {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    pub fn check(&self, metadata: &Metadata) {
        self.check_at(metadata, Utc::now());
    }

    fn check_at(&self, metadata: &Metadata, now: DateTime<Utc>) {
        let Some(stamp) = metadata.last_modified.as_deref() else {
            return;
        };

        match DateTime::parse_from_rfc3339(stamp) {
            Ok(modified) => {
                let age = now.signed_duration_since(modified.with_timezone(&Utc));
                if age > self.threshold {
                    tracing::warn!(
                        last_modified = stamp,
                        age_days = age.num_days(),
                        version = metadata.version.as_deref().unwrap_or("unknown"),
                        "data key is older than the rotation policy allows; re-encrypt the document"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    last_modified = stamp,
                    error = %err,
                    "could not read the document's last-modified marker"
                );
            }
        }
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::new(Duration::days(90))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn parse(yaml: &str) -> Document {
        Document::parse(yaml.as_bytes()).expect("parse")
    }

    #[test]
    fn extracts_candidates_in_document_order() {
        let doc = parse(
            "sops:\n  gcp_kms:\n    - resource_id: projects/a/keys/k1\n      enc: QUFB\n    - resource_id: projects/b/keys/k2\n      enc: QkJC\n  lastmodified: '2024-01-01T00:00:00Z'\n  version: 3.7.3\n",
        );
        let meta = Metadata::from_document(&doc);
        assert_eq!(meta.kms.len(), 2);
        assert_eq!(meta.kms[0].resource_id.as_deref(), Some("projects/a/keys/k1"));
        assert_eq!(meta.kms[1].enc.as_deref(), Some("QkJC"));
        assert_eq!(meta.last_modified.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn malformed_candidates_become_empty_entries() {
        let doc = parse("sops:\n  gcp_kms:\n    - null\n    - {}\n    - enc: QUFB\n");
        let meta = Metadata::from_document(&doc);
        assert_eq!(meta.kms.len(), 3);
        assert!(meta.kms[0].is_empty());
        assert!(meta.kms[1].is_empty());
        assert_eq!(meta.kms[2].resource_id, None);
        assert_eq!(meta.kms[2].enc.as_deref(), Some("QUFB"));
    }

    #[test]
    fn missing_subtree_yields_default_metadata() {
        let doc = parse("host: db\n");
        assert_eq!(Metadata::from_document(&doc), Metadata::default());
    }

    #[test]
    fn rotation_check_tolerates_missing_and_bad_markers() {
        let policy = RotationPolicy::default();
        policy.check(&Metadata::default());
        policy.check(&Metadata {
            last_modified: Some("not-a-date".into()),
            ..Metadata::default()
        });
    }

    #[test]
    fn rotation_check_flags_old_documents_without_failing() {
        let policy = RotationPolicy::new(Duration::days(1));
        let meta = Metadata {
            last_modified: Some("2020-01-01T00:00:00Z".into()),
            version: Some("3.7.3".into()),
            ..Metadata::default()
        };
        // Advisory only: the call must not panic or return anything. The
        // warning carries the format version (or "unknown") alongside age.
        policy.check(&meta);
        policy.check(&Metadata {
            last_modified: Some("2020-01-01T00:00:00Z".into()),
            ..Metadata::default()
        });
    }
}

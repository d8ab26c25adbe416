//! Order-preserving document tree for encrypted secret files.
//!
//! Documents are parsed from YAML into an explicit tagged [`Node`] tree so
//! that decryption can be expressed as a pure transformation from one tree
//! to another rather than as in-place mutation of a deserialized value.

use crate::errors::{Error, Result};

/// Reserved top-level key holding the encryption metadata subtree.
pub const METADATA_KEY: &str = "sops";

/// Scalar leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Scalar {
    /// String view of the scalar, when it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(value) => Some(value),
            _ => None,
        }
    }

    /// Renders the scalar the way the orchestrator expects variable values.
    pub fn render(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Bool(value) => value.to_string(),
            Scalar::Int(value) => value.to_string(),
            Scalar::Float(value) => value.to_string(),
            Scalar::String(value) => value.clone(),
            Scalar::Bytes(value) => String::from_utf8_lossy(value).into_owned(),
        }
    }
}

/// One node of a secret document.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Key/value pairs in document order.
    Mapping(Vec<(String, Node)>),
    Sequence(Vec<Node>),
    Scalar(Scalar),
}

impl Node {
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Node::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_scalar().and_then(Scalar::as_str)
    }

    pub fn as_mapping(&self) -> Option<&[(String, Node)]> {
        match self {
            Node::Mapping(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Node]> {
        match self {
            Node::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// First value under `key` when this node is a mapping.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_mapping()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

/// A parsed secret document. The root is always a mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    entries: Vec<(String, Node)>,
}

impl Document {
    /// Parses raw bytes into a document tree.
    ///
    /// Fails with [`Error::Parse`] on malformed YAML or a non-mapping root;
    /// no partial document is ever produced.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: serde_yaml::Value =
            serde_yaml::from_slice(bytes).map_err(|err| Error::Parse(err.to_string()))?;
        match convert(value)? {
            Node::Mapping(entries) => Ok(Self { entries }),
            _ => Err(Error::Parse("document root must be a mapping".into())),
        }
    }

    pub fn from_entries(entries: Vec<(String, Node)>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[(String, Node)] {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// The reserved metadata subtree, when present.
    pub fn metadata_node(&self) -> Option<&Node> {
        self.get(METADATA_KEY)
    }

    /// Returns the document with the metadata subtree removed.
    pub fn without_metadata(mut self) -> Self {
        self.entries.retain(|(key, _)| key != METADATA_KEY);
        self
    }

    /// True when the document holds no user entries.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|(key, _)| key == METADATA_KEY)
    }
}

fn convert(value: serde_yaml::Value) -> Result<Node> {
    match value {
        serde_yaml::Value::Null => Ok(Node::Scalar(Scalar::Null)),
        serde_yaml::Value::Bool(b) => Ok(Node::Scalar(Scalar::Bool(b))),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Node::Scalar(Scalar::Int(i)))
            } else if let Some(f) = n.as_f64() {
                Ok(Node::Scalar(Scalar::Float(f)))
            } else {
                Err(Error::Parse(format!("unrepresentable number: {n}")))
            }
        }
        serde_yaml::Value::String(s) => Ok(Node::Scalar(Scalar::String(s))),
        serde_yaml::Value::Sequence(items) => {
            let mut nodes = Vec::with_capacity(items.len());
            for item in items {
                nodes.push(convert(item)?);
            }
            Ok(Node::Sequence(nodes))
        }
        serde_yaml::Value::Mapping(mapping) => {
            let mut entries = Vec::with_capacity(mapping.len());
            for (key, value) in mapping {
                entries.push((key_to_string(key)?, convert(value)?));
            }
            Ok(Node::Mapping(entries))
        }
        serde_yaml::Value::Tagged(tagged) => convert(tagged.value),
    }
}

fn key_to_string(key: serde_yaml::Value) -> Result<String> {
    match key {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        other => Err(Error::Parse(format!("unsupported mapping key: {other:?}"))),
    }
}

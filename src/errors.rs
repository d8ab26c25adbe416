use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("bucket name not configured: pass one explicitly or set the bucket environment variable")]
    MissingBucket,
    #[error("secret object not found: {path}")]
    NotFound { path: String },
    #[error("malformed secret document: {0}")]
    Parse(String),
    #[error("could not resolve a data key for the document: {}", format_attempts(.attempts))]
    KeyResolution { attempts: Vec<String> },
    #[error("integrity check failed for leaf at `{path}`")]
    Decrypt { path: String },
    #[error("invalid encrypted leaf at `{path}`: {reason}")]
    InvalidLeaf { path: String, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("kms error: {0}")]
    Kms(String),
    #[error("pgp error: {0}")]
    Pgp(String),
}

fn format_attempts(attempts: &[String]) -> String {
    if attempts.is_empty() {
        "no usable key candidate in the document metadata".to_string()
    } else {
        attempts.join("; ")
    }
}

//! Asymmetric-key fallback: unwraps the data key with a locally held
//! private key when no managed grant can be used.

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::errors::{Error, Result};

/// Looks up locally available private keys and unwraps armored payloads.
pub trait PgpKeyStore: Send + Sync {
    /// Unwraps `armored` using the private key identified by `fingerprint`.
    fn unwrap_key(&self, fingerprint: &str, armored: &str) -> Result<Vec<u8>>;
}

impl<T> PgpKeyStore for Arc<T>
where
    T: PgpKeyStore + ?Sized,
{
    fn unwrap_key(&self, fingerprint: &str, armored: &str) -> Result<Vec<u8>> {
        (**self).unwrap_key(fingerprint, armored)
    }
}

/// Key store backed by the local GnuPG keyring.
///
/// The armored wrapped key is piped through `gpg --decrypt`; gpg selects
/// the matching private key itself, the fingerprint is carried for
/// diagnostics only.
#[derive(Debug, Clone)]
pub struct GnupgKeyStore {
    binary: String,
}

impl GnupgKeyStore {
    pub fn new() -> Self {
        Self {
            binary: "gpg".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for GnupgKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PgpKeyStore for GnupgKeyStore {
    fn unwrap_key(&self, fingerprint: &str, armored: &str) -> Result<Vec<u8>> {
        let fingerprint = normalize_fingerprint(fingerprint);
        let mut child = Command::new(&self.binary)
            .args(["--quiet", "--batch", "--decrypt"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| Error::Pgp(format!("could not launch {}: {err}", self.binary)))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(armored.as_bytes())
                .map_err(|err| Error::Pgp(format!("could not write wrapped key: {err}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|err| Error::Pgp(format!("gpg did not finish: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Pgp(format!(
                "no private key for {fingerprint} could unwrap the payload: {}",
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}

fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

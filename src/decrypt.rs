//! Tree decryption: walks an encrypted document and produces a new tree
//! with every leaf decrypted.
//!
//! Each leaf carries its own AES-256-GCM envelope. The additional
//! authenticated data is the leaf's colon-joined key path, which binds a
//! ciphertext to its position: moving a value under a different key makes
//! the tag check fail. Sequence elements share their parent mapping's path,
//! matching the on-disk format.

use aes::cipher::{BlockEncrypt, KeyIvInit, StreamCipher};
use aes::{Aes256, Block};
use aes_gcm::aead::consts::U32;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, AesGcm};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ghash::universal_hash::UniversalHash;
use ghash::GHash;

use crate::document::{Document, Node, Scalar, METADATA_KEY};
use crate::errors::{Error, Result};
use crate::keys::DataKey;

/// AES-256-GCM with the 256-bit nonces the document format uses.
type Aes256GcmLongNonce = AesGcm<Aes256, U32>;

const ENVELOPE_PREFIX: &str = "ENC[AES256_GCM,";

/// Declared plaintext type of an encrypted leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafType {
    Str,
    Int,
    Float,
    Bool,
    Bytes,
}

impl LeafType {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "str" => Some(Self::Str),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "bool" => Some(Self::Bool),
            "bytes" => Some(Self::Bytes),
            _ => None,
        }
    }
}

/// Parsed per-leaf envelope.
#[derive(Debug)]
struct LeafEnvelope {
    data: Vec<u8>,
    iv: Vec<u8>,
    tag: Vec<u8>,
    value_type: LeafType,
}

/// Decrypts every leaf of `doc` with `key`, returning a new tree.
///
/// The reserved metadata subtree is carried through untouched. With
/// `ignore_mac` set, leaves whose authentication tag does not verify are
/// substituted with the raw keystream plaintext instead of failing; the
/// caller has explicitly accepted the reduced integrity guarantee.
pub fn decrypt_tree(doc: &Document, key: &DataKey, ignore_mac: bool) -> Result<Document> {
    let mut entries = Vec::with_capacity(doc.entries().len());
    for (name, node) in doc.entries() {
        if name == METADATA_KEY {
            entries.push((name.clone(), node.clone()));
            continue;
        }
        let aad = format!("{name}:");
        entries.push((name.clone(), walk(node, key, &aad, ignore_mac)?));
    }
    Ok(Document::from_entries(entries))
}

fn walk(node: &Node, key: &DataKey, aad: &str, ignore_mac: bool) -> Result<Node> {
    match node {
        Node::Mapping(children) => {
            let mut out = Vec::with_capacity(children.len());
            for (name, child) in children {
                let child_aad = format!("{aad}{name}:");
                out.push((name.clone(), walk(child, key, &child_aad, ignore_mac)?));
            }
            Ok(Node::Mapping(out))
        }
        Node::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(walk(item, key, aad, ignore_mac)?);
            }
            Ok(Node::Sequence(out))
        }
        Node::Scalar(Scalar::String(raw)) if raw.starts_with(ENVELOPE_PREFIX) => {
            let envelope = parse_envelope(raw).map_err(|reason| Error::InvalidLeaf {
                path: display_path(aad),
                reason,
            })?;
            decrypt_leaf(&envelope, key, aad, ignore_mac)
        }
        other => Ok(other.clone()),
    }
}

fn decrypt_leaf(
    envelope: &LeafEnvelope,
    key: &DataKey,
    aad: &str,
    ignore_mac: bool,
) -> Result<Node> {
    if envelope.iv.len() != 12 && envelope.iv.len() != 32 {
        return Err(Error::InvalidLeaf {
            path: display_path(aad),
            reason: format!("unsupported iv length {}", envelope.iv.len()),
        });
    }

    let plaintext = match verify_and_decrypt(envelope, key, aad.as_bytes()) {
        Ok(plaintext) => plaintext,
        Err(()) if ignore_mac => {
            tracing::warn!(
                path = %display_path(aad),
                "integrity tag mismatch tolerated, substituting best-effort plaintext"
            );
            keystream_decrypt(key, &envelope.iv, &envelope.data)
        }
        Err(()) => {
            return Err(Error::Decrypt {
                path: display_path(aad),
            })
        }
    };

    cast(plaintext, envelope.value_type, aad)
}

/// Authenticated decryption of one leaf; `Err(())` means the tag did not
/// verify for this ciphertext/key/path combination.
fn verify_and_decrypt(
    envelope: &LeafEnvelope,
    key: &DataKey,
    aad: &[u8],
) -> std::result::Result<Vec<u8>, ()> {
    let mut msg = Vec::with_capacity(envelope.data.len() + envelope.tag.len());
    msg.extend_from_slice(&envelope.data);
    msg.extend_from_slice(&envelope.tag);
    let payload = Payload { msg: &msg, aad };

    let key = GenericArray::from_slice(key.as_bytes());
    match envelope.iv.len() {
        12 => Aes256Gcm::new(key)
            .decrypt(GenericArray::from_slice(&envelope.iv), payload)
            .map_err(|_| ()),
        32 => Aes256GcmLongNonce::new(key)
            .decrypt(GenericArray::from_slice(&envelope.iv), payload)
            .map_err(|_| ()),
        _ => Err(()),
    }
}

/// Raw GCM keystream decryption, skipping tag verification entirely.
///
/// GCM is CTR underneath: the first counter block J0 authenticates the tag
/// and ciphertext blocks start at inc32(J0) (NIST SP 800-38D).
fn keystream_decrypt(key: &DataKey, iv: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let block_cipher = Aes256::new(GenericArray::from_slice(key.as_bytes()));
    let mut counter = initial_counter(&block_cipher, iv);
    inc32(&mut counter);

    let mut buffer = ciphertext.to_vec();
    let mut cipher = ctr::Ctr32BE::<Aes256>::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(&counter),
    );
    cipher.apply_keystream(&mut buffer);
    buffer
}

fn initial_counter(cipher: &Aes256, iv: &[u8]) -> [u8; 16] {
    let mut j0 = [0u8; 16];
    if iv.len() == 12 {
        j0[..12].copy_from_slice(iv);
        j0[15] = 1;
        return j0;
    }

    // Non-96-bit IV: J0 = GHASH_H(IV padded || 64-bit zero || len(IV) bits).
    let mut hash_key = Block::default();
    cipher.encrypt_block(&mut hash_key);
    let mut ghash = GHash::new(&hash_key);
    ghash.update_padded(iv);

    let mut length_block = [0u8; 16];
    length_block[8..].copy_from_slice(&((iv.len() as u64) * 8).to_be_bytes());
    ghash.update(&[*GenericArray::from_slice(&length_block)]);

    j0.copy_from_slice(&ghash.finalize());
    j0
}

fn inc32(counter: &mut [u8; 16]) {
    let mut word = [0u8; 4];
    word.copy_from_slice(&counter[12..]);
    let next = u32::from_be_bytes(word).wrapping_add(1);
    counter[12..].copy_from_slice(&next.to_be_bytes());
}

fn parse_envelope(raw: &str) -> std::result::Result<LeafEnvelope, String> {
    let inner = raw
        .strip_prefix(ENVELOPE_PREFIX)
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| "envelope is not ENC[AES256_GCM,...] shaped".to_string())?;

    let mut data = None;
    let mut iv = None;
    let mut tag = None;
    let mut value_type = None;
    for field in inner.split(',') {
        let (name, value) = field
            .split_once(':')
            .ok_or_else(|| format!("malformed envelope field `{field}`"))?;
        match name {
            "data" => data = Some(decode_field(name, value)?),
            "iv" => iv = Some(decode_field(name, value)?),
            "tag" => tag = Some(decode_field(name, value)?),
            "type" => {
                value_type = Some(
                    LeafType::from_tag(value)
                        .ok_or_else(|| format!("unknown leaf type `{value}`"))?,
                )
            }
            other => return Err(format!("unknown envelope field `{other}`")),
        }
    }

    Ok(LeafEnvelope {
        data: data.ok_or("envelope missing data")?,
        iv: iv.ok_or("envelope missing iv")?,
        tag: tag.ok_or("envelope missing tag")?,
        value_type: value_type.unwrap_or(LeafType::Str),
    })
}

fn decode_field(name: &str, value: &str) -> std::result::Result<Vec<u8>, String> {
    STANDARD
        .decode(value)
        .map_err(|err| format!("envelope field `{name}` is not base64: {err}"))
}

fn cast(plaintext: Vec<u8>, value_type: LeafType, aad: &str) -> Result<Node> {
    let as_text = |bytes: Vec<u8>| {
        String::from_utf8(bytes).map_err(|_| Error::InvalidLeaf {
            path: display_path(aad),
            reason: "plaintext is not valid utf-8".into(),
        })
    };

    let scalar = match value_type {
        LeafType::Bytes => Scalar::Bytes(plaintext),
        LeafType::Str => Scalar::String(as_text(plaintext)?),
        LeafType::Int => {
            let text = as_text(plaintext)?;
            Scalar::Int(text.trim().parse().map_err(|_| Error::InvalidLeaf {
                path: display_path(aad),
                reason: format!("`{text}` is not an integer"),
            })?)
        }
        LeafType::Float => {
            let text = as_text(plaintext)?;
            Scalar::Float(text.trim().parse().map_err(|_| Error::InvalidLeaf {
                path: display_path(aad),
                reason: format!("`{text}` is not a float"),
            })?)
        }
        LeafType::Bool => {
            let text = as_text(plaintext)?;
            match text.trim().to_ascii_lowercase().as_str() {
                "true" => Scalar::Bool(true),
                "false" => Scalar::Bool(false),
                _ => {
                    return Err(Error::InvalidLeaf {
                        path: display_path(aad),
                        reason: format!("`{text}` is not a boolean"),
                    })
                }
            }
        }
    };
    Ok(Node::Scalar(scalar))
}

fn display_path(aad: &str) -> String {
    aad.trim_end_matches(':').to_string()
}

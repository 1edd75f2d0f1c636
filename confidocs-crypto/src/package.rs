//! Self-describing encrypted packages.
//!
//! An [`EncryptedPackage`] bundles the wrapped data key, the IV and the
//! ciphertext of one document. The `algorithm` field is the only authority
//! on how `wrapped_key` must be unwrapped.
//!
//! # Binary layout
//!
//! ```text
//! [tag u8]                       absent in legacy records
//! [u32 be length][wrapped key]
//! [iv, 16 bytes]
//! [u32 be length][ciphertext]
//! [u16 be length][key id utf-8]  optional
//! ```
//!
//! Tags are non-zero. A legacy record starts with the high byte of the
//! wrapped-key length, which is zero for any real key, so a leading zero
//! byte means "untagged" and the algorithm is inferred as RSA-OAEP.
//!
//! # JSON record
//!
//! Records written by earlier deployments are base64 of a JSON object
//! `{encrypted_key, iv, encrypted_data, algorithm}` with base64 fields.
//! A missing `algorithm` parses as RSA-OAEP.

use crate::cipher::{BLOCK_SIZE, IV_SIZE};
use crate::error::{CryptoError, CryptoResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the data key inside a package was wrapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WrapAlgorithm {
    /// Direct RSA-OAEP wrapping with a key pair from the key store.
    #[serde(rename = "AES-256-CBC+RSA-OAEP")]
    RsaOaep,
    /// Wrapping through attestation-gated secure key release.
    #[serde(rename = "AES-256-CBC+SKR")]
    Skr,
}

impl WrapAlgorithm {
    pub fn tag(self) -> u8 {
        match self {
            Self::RsaOaep => 1,
            Self::Skr => 2,
        }
    }

    pub fn from_tag(tag: u8) -> CryptoResult<Self> {
        match tag {
            1 => Ok(Self::RsaOaep),
            2 => Ok(Self::Skr),
            other => Err(CryptoError::InvalidPackage(format!(
                "unknown algorithm tag {other}"
            ))),
        }
    }

    /// Label used in JSON records.
    pub fn label(self) -> &'static str {
        match self {
            Self::RsaOaep => "AES-256-CBC+RSA-OAEP",
            Self::Skr => "AES-256-CBC+SKR",
        }
    }
}

impl fmt::Display for WrapAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One encrypted document. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPackage {
    pub algorithm: WrapAlgorithm,
    pub wrapped_key: Vec<u8>,
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
    /// Identifier of the protecting key, `name/version`.
    pub key_id: Option<String>,
}

impl EncryptedPackage {
    /// Encodes the package in the tagged binary layout.
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        let mut out = Vec::with_capacity(
            1 + 4 + self.wrapped_key.len() + IV_SIZE + 4 + self.ciphertext.len() + 64,
        );
        out.push(self.algorithm.tag());
        put_long_field(&mut out, &self.wrapped_key)?;
        out.extend_from_slice(&self.iv);
        put_long_field(&mut out, &self.ciphertext)?;
        if let Some(key_id) = &self.key_id {
            put_short_field(&mut out, key_id.as_bytes())?;
        }
        Ok(out)
    }

    /// Decodes a tagged or legacy binary record.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let mut reader = Reader::new(bytes);
        let algorithm = read_algorithm(&mut reader)?;

        let wrapped_key = reader.long_field("wrapped key")?.to_vec();
        if wrapped_key.is_empty() {
            return Err(CryptoError::InvalidPackage("wrapped key is empty".to_string()));
        }

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(reader.take(IV_SIZE, "iv")?);

        let ciphertext = reader.long_field("ciphertext")?.to_vec();
        check_ciphertext_len(ciphertext.len())?;

        let key_id = read_key_id(&mut reader)?;

        Ok(Self {
            algorithm,
            wrapped_key,
            iv,
            ciphertext,
            key_id,
        })
    }

    /// Encodes the package as a base64 JSON record.
    pub fn to_json_record(&self) -> CryptoResult<String> {
        let record = JsonRecord {
            encrypted_key: STANDARD.encode(&self.wrapped_key),
            iv: STANDARD.encode(self.iv),
            encrypted_data: STANDARD.encode(&self.ciphertext),
            algorithm: Some(self.algorithm),
            key_id: self.key_id.clone(),
        };
        let json = serde_json::to_vec(&record)
            .map_err(|e| CryptoError::InvalidPackage(format!("record encoding failed: {e}")))?;
        Ok(STANDARD.encode(json))
    }

    /// Decodes a base64 JSON record, including ones without `algorithm`.
    pub fn from_json_record(record: &str) -> CryptoResult<Self> {
        let json = STANDARD
            .decode(record.trim())
            .map_err(|e| CryptoError::InvalidPackage(format!("record is not base64: {e}")))?;
        let record: JsonRecord = serde_json::from_slice(&json)
            .map_err(|e| CryptoError::InvalidPackage(format!("record is not valid JSON: {e}")))?;

        let wrapped_key = decode_b64(&record.encrypted_key, "encrypted_key")?;
        let iv_bytes = decode_b64(&record.iv, "iv")?;
        let ciphertext = decode_b64(&record.encrypted_data, "encrypted_data")?;

        if iv_bytes.len() != IV_SIZE {
            return Err(CryptoError::InvalidPackage(format!(
                "iv must be {IV_SIZE} bytes, got {}",
                iv_bytes.len()
            )));
        }
        check_ciphertext_len(ciphertext.len())?;

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&iv_bytes);

        Ok(Self {
            algorithm: record.algorithm.unwrap_or(WrapAlgorithm::RsaOaep),
            wrapped_key,
            iv,
            ciphertext,
            key_id: record.key_id,
        })
    }
}

/// A wrapped data key that travels separately from the ciphertexts it
/// protects (one key token for many blobs).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrappedKey {
    pub algorithm: WrapAlgorithm,
    pub wrapped_key: Vec<u8>,
    pub key_id: Option<String>,
}

impl WrappedKey {
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + 4 + self.wrapped_key.len() + 64);
        out.push(self.algorithm.tag());
        put_long_field(&mut out, &self.wrapped_key)?;
        if let Some(key_id) = &self.key_id {
            put_short_field(&mut out, key_id.as_bytes())?;
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let mut reader = Reader::new(bytes);
        let algorithm = read_algorithm(&mut reader)?;
        let wrapped_key = reader.long_field("wrapped key")?.to_vec();
        if wrapped_key.is_empty() {
            return Err(CryptoError::InvalidPackage("wrapped key is empty".to_string()));
        }
        let key_id = read_key_id(&mut reader)?;
        Ok(Self {
            algorithm,
            wrapped_key,
            key_id,
        })
    }

    /// Text form for storage as a key-store secret.
    pub fn to_base64(&self) -> CryptoResult<String> {
        Ok(STANDARD.encode(self.to_bytes()?))
    }

    pub fn from_base64(text: &str) -> CryptoResult<Self> {
        let bytes = decode_b64(text.trim(), "wrapped key token")?;
        Self::from_bytes(&bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct JsonRecord {
    encrypted_key: String,
    iv: String,
    encrypted_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    algorithm: Option<WrapAlgorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_id: Option<String>,
}

fn decode_b64(value: &str, field: &str) -> CryptoResult<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| CryptoError::InvalidPackage(format!("{field} is not base64: {e}")))
}

fn check_ciphertext_len(len: usize) -> CryptoResult<()> {
    if len == 0 || len % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidPackage(format!(
            "ciphertext length {len} is not a positive multiple of {BLOCK_SIZE}"
        )));
    }
    Ok(())
}

fn read_algorithm(reader: &mut Reader<'_>) -> CryptoResult<WrapAlgorithm> {
    match reader.peek() {
        None => Err(CryptoError::InvalidPackage("record is empty".to_string())),
        Some(0) => Ok(WrapAlgorithm::RsaOaep),
        Some(tag) => {
            reader.take(1, "algorithm tag")?;
            WrapAlgorithm::from_tag(tag)
        }
    }
}

fn read_key_id(reader: &mut Reader<'_>) -> CryptoResult<Option<String>> {
    if reader.is_empty() {
        return Ok(None);
    }
    let raw = reader.short_field("key id")?;
    let key_id = std::str::from_utf8(raw)
        .map_err(|_| CryptoError::InvalidPackage("key id is not UTF-8".to_string()))?
        .to_string();
    if !reader.is_empty() {
        return Err(CryptoError::InvalidPackage(format!(
            "{} trailing bytes after key id",
            reader.remaining()
        )));
    }
    Ok(Some(key_id))
}

fn put_long_field(out: &mut Vec<u8>, data: &[u8]) -> CryptoResult<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| CryptoError::InvalidPackage("field exceeds 4 GiB".to_string()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn put_short_field(out: &mut Vec<u8>, data: &[u8]) -> CryptoResult<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| CryptoError::InvalidPackage("key id exceeds 64 KiB".to_string()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize, what: &str) -> CryptoResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CryptoError::InvalidPackage(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn long_field(&mut self, what: &str) -> CryptoResult<&'a [u8]> {
        let len_bytes: [u8; 4] = self
            .take(4, what)?
            .try_into()
            .map_err(|_| CryptoError::InvalidPackage(format!("bad {what} length")))?;
        self.take(u32::from_be_bytes(len_bytes) as usize, what)
    }

    fn short_field(&mut self, what: &str) -> CryptoResult<&'a [u8]> {
        let len_bytes: [u8; 2] = self
            .take(2, what)?
            .try_into()
            .map_err(|_| CryptoError::InvalidPackage(format!("bad {what} length")))?;
        self.take(u16::from_be_bytes(len_bytes) as usize, what)
    }
}

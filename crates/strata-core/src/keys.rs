//! Public-key parsing, canonicalization and signature verification.
//!
//! Keys arrive from clients in whatever form their tooling produces: an
//! OpenSSH `authorized_keys` line, a hex or base64 string, or raw bytes.
//! Everything is normalized to the OpenSSH line form (without a comment),
//! which is what gets persisted and compared.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::Verifier as _;
use p256::ecdsa::signature::Verifier as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hashing::sha256;

const SSH_ED25519: &str = "ssh-ed25519";
const SSH_ECDSA_P256: &str = "ecdsa-sha2-nistp256";
const NISTP256: &str = "nistp256";

/// Supported public-key families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyType {
    Ed25519,
    EcdsaP256,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::EcdsaP256 => "ecdsa-p256",
        }
    }

    /// Name of the signature algorithm a client must use for this key type.
    pub fn signature_algorithm(&self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::EcdsaP256 => "ecdsa-p256-sha256",
        }
    }

    fn ssh_name(&self) -> &'static str {
        match self {
            Self::Ed25519 => SSH_ED25519,
            Self::EcdsaP256 => SSH_ECDSA_P256,
        }
    }
}

impl std::str::FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" | SSH_ED25519 => Ok(Self::Ed25519),
            "ecdsa-p256" | "p256" | SSH_ECDSA_P256 => Ok(Self::EcdsaP256),
            other => Err(Error::UnsupportedKeyType(other.to_string())),
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum KeyMaterial {
    Ed25519(ed25519_dalek::VerifyingKey),
    EcdsaP256(p256::ecdsa::VerifyingKey),
}

/// A parsed, validated public key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    material: KeyMaterial,
}

impl PublicKey {
    /// Parse a key in any accepted encoding.
    ///
    /// Accepted inputs, in detection order:
    /// - an OpenSSH line (`ssh-ed25519 AAAA... [comment]`, `ecdsa-sha2-nistp256 AAAA...`)
    /// - hex (optionally `0x`-prefixed) or base64 of the raw key bytes
    /// - the raw key bytes themselves (32-byte Ed25519, 33/65-byte SEC1 P-256)
    pub fn parse(input: &[u8]) -> Result<Self> {
        if input.is_empty() {
            return Err(Error::InvalidPublicKey("empty key".to_string()));
        }

        if let Ok(text) = std::str::from_utf8(input) {
            let text = text.trim();
            if text.starts_with(SSH_ED25519) || text.starts_with(SSH_ECDSA_P256) {
                return Self::from_ssh(text);
            }
            if let Some(bytes) = decode_text_bytes(text) {
                return Self::from_raw(&bytes);
            }
        }

        Self::from_raw(input)
    }

    /// Parse an OpenSSH `authorized_keys` style line.
    pub fn from_ssh(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let algo = parts
            .next()
            .ok_or_else(|| Error::InvalidPublicKey("empty ssh key line".to_string()))?;
        let body = parts
            .next()
            .ok_or_else(|| Error::InvalidPublicKey("missing ssh key body".to_string()))?;

        let blob = STANDARD
            .decode(body)
            .map_err(|e| Error::InvalidPublicKey(format!("invalid ssh key base64: {e}")))?;

        let mut reader = SshReader::new(&blob);
        let inner_algo = reader.read_str()?;
        if inner_algo != algo {
            return Err(Error::InvalidPublicKey(format!(
                "key type mismatch: line says {algo}, blob says {inner_algo}"
            )));
        }

        let key = match algo {
            SSH_ED25519 => {
                let raw = reader.read_bytes()?;
                Self::ed25519_from_slice(raw)?
            }
            SSH_ECDSA_P256 => {
                let curve = reader.read_str()?;
                if curve != NISTP256 {
                    return Err(Error::UnsupportedKeyType(curve.to_string()));
                }
                let point = reader.read_bytes()?;
                Self::p256_from_sec1(point)?
            }
            other => return Err(Error::UnsupportedKeyType(other.to_string())),
        };

        if !reader.is_empty() {
            return Err(Error::InvalidPublicKey(
                "trailing bytes in ssh key blob".to_string(),
            ));
        }

        Ok(key)
    }

    /// Interpret raw key bytes by length.
    pub fn from_raw(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            32 => Self::ed25519_from_slice(bytes),
            33 | 65 => Self::p256_from_sec1(bytes),
            n => Err(Error::InvalidPublicKey(format!(
                "unrecognized raw key length {n}"
            ))),
        }
    }

    fn ed25519_from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::InvalidPublicKey(format!("ed25519 key must be 32 bytes, got {}", bytes.len()))
        })?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&arr)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
        Ok(Self {
            material: KeyMaterial::Ed25519(key),
        })
    }

    fn p256_from_sec1(bytes: &[u8]) -> Result<Self> {
        let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| Error::InvalidPublicKey(format!("invalid P-256 point: {e}")))?;
        Ok(Self {
            material: KeyMaterial::EcdsaP256(key),
        })
    }

    pub fn key_type(&self) -> KeyType {
        match self.material {
            KeyMaterial::Ed25519(_) => KeyType::Ed25519,
            KeyMaterial::EcdsaP256(_) => KeyType::EcdsaP256,
        }
    }

    /// OpenSSH wire-format blob for this key.
    pub fn ssh_blob(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_ssh_string(&mut out, self.key_type().ssh_name().as_bytes());
        match &self.material {
            KeyMaterial::Ed25519(key) => {
                write_ssh_string(&mut out, key.as_bytes());
            }
            KeyMaterial::EcdsaP256(key) => {
                write_ssh_string(&mut out, NISTP256.as_bytes());
                let point = key.to_encoded_point(false);
                write_ssh_string(&mut out, point.as_bytes());
            }
        }
        out
    }

    /// Canonical text form: the OpenSSH line without a comment.
    pub fn to_canonical(&self) -> String {
        format!(
            "{} {}",
            self.key_type().ssh_name(),
            STANDARD.encode(self.ssh_blob())
        )
    }

    /// `SHA256:<unpadded base64>` fingerprint, compatible with `ssh-keygen -l`.
    pub fn fingerprint(&self) -> String {
        let digest = sha256(&self.ssh_blob());
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest.as_bytes()))
    }

    /// Verify `signature` over `message`.
    ///
    /// Ed25519 signatures must be 64 bytes. P-256 signatures may be fixed-size
    /// `r || s` (64 bytes) or ASN.1 DER.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match &self.material {
            KeyMaterial::Ed25519(key) => {
                let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
                    return false;
                };
                let sig = ed25519_dalek::Signature::from_bytes(&bytes);
                key.verify(message, &sig).is_ok()
            }
            KeyMaterial::EcdsaP256(key) => {
                let sig = if signature.len() == 64 {
                    p256::ecdsa::Signature::from_slice(signature)
                } else {
                    p256::ecdsa::Signature::from_der(signature)
                };
                match sig {
                    Ok(sig) => key.verify(message, &sig).is_ok(),
                    Err(_) => false,
                }
            }
        }
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

/// Verify a signature against a stored (canonical) key of a known type.
///
/// Returns `Ok(false)` for a well-formed key whose signature does not check out;
/// `Err` only when the stored key itself cannot be decoded or its type differs.
pub fn verify_signature(
    public_key: &str,
    key_type: KeyType,
    message: &[u8],
    signature: &[u8],
) -> Result<bool> {
    let key = PublicKey::parse(public_key.as_bytes())?;
    if key.key_type() != key_type {
        return Err(Error::InvalidPublicKey(format!(
            "expected {key_type} key, found {}",
            key.key_type()
        )));
    }
    Ok(key.verify(message, signature))
}

/// Decode a signature transported as text (hex, base64 or base64url).
pub fn decode_signature(text: &str) -> Result<Vec<u8>> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::InvalidSignatureEncoding("empty signature".to_string()));
    }
    decode_text_bytes(text).ok_or_else(|| {
        Error::InvalidSignatureEncoding("expected hex or base64".to_string())
    })
}

fn decode_text_bytes(text: &str) -> Option<Vec<u8>> {
    let hex_candidate = text.strip_prefix("0x").unwrap_or(text);
    if hex_candidate.len() % 2 == 0 && hex_candidate.bytes().all(|b| b.is_ascii_hexdigit()) {
        if let Ok(bytes) = hex::decode(hex_candidate) {
            return Some(bytes);
        }
    }

    STANDARD
        .decode(text)
        .or_else(|_| STANDARD_NO_PAD.decode(text))
        .or_else(|_| URL_SAFE_NO_PAD.decode(text))
        .ok()
}

fn write_ssh_string(out: &mut Vec<u8>, data: &[u8]) {
    let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
}

struct SshReader<'a> {
    buf: &'a [u8],
}

impl<'a> SshReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn read_bytes(&mut self) -> Result<&'a [u8]> {
        if self.buf.len() < 4 {
            return Err(Error::InvalidPublicKey("truncated ssh key blob".to_string()));
        }
        let (len_bytes, rest) = self.buf.split_at(4);
        let mut len_arr = [0u8; 4];
        len_arr.copy_from_slice(len_bytes);
        let len = u32::from_be_bytes(len_arr) as usize;
        if rest.len() < len {
            return Err(Error::InvalidPublicKey("truncated ssh key blob".to_string()));
        }
        let (value, rest) = rest.split_at(len);
        self.buf = rest;
        Ok(value)
    }

    fn read_str(&mut self) -> Result<&'a str> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map_err(|_| Error::InvalidPublicKey("non-utf8 ssh key field".to_string()))
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

//! Cipher engine
//!
//! AES-256-GCM sealing of opaque payloads into a self-describing
//! [`SealedRecord`]. Every seal draws a fresh 96-bit nonce from the OS
//! random source; nothing counter-based is kept, so restarts cannot repeat
//! a nonce. Unsealing verifies the tag before any plaintext is released and
//! returns nothing on failure.
//!
//! On-disk layout (all integers little endian):
//!
//! ```text
//! magic       4   b"BTVS"
//! version     1
//! nonce       12
//! tag         16
//! header_len  4   u32
//! header      header_len bytes of JSON (dataset id, algorithm, key id, time)
//! ciphertext  remaining bytes
//! ```
//!
//! The version byte and the header bytes, exactly as stored, are bound into
//! the tag as associated data, so a sealed file cannot be relabelled as
//! another dataset and no header byte can change unnoticed.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::buffer::UnsealedBuffer;
use crate::error::{CipherError, CipherResult};
use crate::key_provider::EncryptionKey;

/// File magic of sealed records
pub const MAGIC: &[u8; 4] = b"BTVS";

/// Current sealed format version
pub const FORMAT_VERSION: u8 = 1;

/// Nonce length of AES-GCM
pub const NONCE_LEN: usize = 12;

/// Authentication tag length of AES-GCM
pub const TAG_LEN: usize = 16;

/// Algorithm label written into headers
pub const ALGORITHM: &str = "AES-256-GCM";

const FIXED_PREFIX_LEN: usize = MAGIC.len() + 1 + NONCE_LEN + TAG_LEN + 4;

/// Authenticated metadata of a sealed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedHeader {
    /// Dataset the payload belongs to
    pub dataset_id: String,

    /// Cipher used
    pub algorithm: String,

    /// Fingerprint of the sealing key
    pub key_id: String,

    /// When the record was sealed
    pub sealed_at: DateTime<Utc>,
}

/// One sealed payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedRecord {
    pub format_version: u8,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub header: SealedHeader,

    /// `header` as stored; these are the bytes the tag covers
    pub header_bytes: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl SealedRecord {
    pub fn dataset_id(&self) -> &str {
        &self.header.dataset_id
    }

    /// Bytes authenticated alongside the ciphertext
    fn associated_data(format_version: u8, header_bytes: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(MAGIC.len() + 1 + header_bytes.len());
        aad.extend_from_slice(MAGIC);
        aad.push(format_version);
        aad.extend_from_slice(header_bytes);
        aad
    }

    /// Serialize to the on-disk layout
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_PREFIX_LEN + self.header_bytes.len() + self.ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.push(self.format_version);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&(self.header_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.header_bytes);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the on-disk layout. The version is checked before anything
    /// past it is interpreted.
    pub fn decode(bytes: &[u8]) -> CipherResult<Self> {
        if bytes.len() < MAGIC.len() + 1 || &bytes[..MAGIC.len()] != MAGIC {
            return Err(CipherError::MalformedRecord { reason: "missing sealed-record magic".to_string() });
        }

        let format_version = bytes[MAGIC.len()];
        if format_version != FORMAT_VERSION {
            return Err(CipherError::UnsupportedFormatVersion { version: format_version });
        }

        if bytes.len() < FIXED_PREFIX_LEN {
            return Err(CipherError::MalformedRecord { reason: "truncated record".to_string() });
        }

        let mut offset = MAGIC.len() + 1;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[offset..offset + NONCE_LEN]);
        offset += NONCE_LEN;

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&bytes[offset..offset + TAG_LEN]);
        offset += TAG_LEN;

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[offset..offset + 4]);
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        offset += 4;

        if bytes.len() - offset < header_len {
            return Err(CipherError::MalformedRecord { reason: "truncated header".to_string() });
        }

        let header_bytes = bytes[offset..offset + header_len].to_vec();
        let header: SealedHeader = serde_json::from_slice(&header_bytes)
            .map_err(|_| CipherError::MalformedRecord { reason: "header unreadable".to_string() })?;
        offset += header_len;

        Ok(Self {
            format_version,
            nonce,
            tag,
            header,
            header_bytes,
            ciphertext: bytes[offset..].to_vec(),
        })
    }
}

/// AES-256-GCM seal/unseal
#[derive(Debug, Clone, Default)]
pub struct CipherEngine;

impl CipherEngine {
    pub fn new() -> Self {
        Self
    }

    /// Encrypt and authenticate `plaintext` for `dataset_id` under a fresh nonce
    pub fn seal(&self, key: &EncryptionKey, dataset_id: &str, plaintext: &[u8]) -> CipherResult<SealedRecord> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| CipherError::EncryptionFailed)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let header = SealedHeader {
            dataset_id: dataset_id.to_string(),
            algorithm: ALGORITHM.to_string(),
            key_id: key.key_id(),
            sealed_at: Utc::now(),
        };
        let header_bytes = serde_json::to_vec(&header)
            .map_err(|e| CipherError::MalformedRecord { reason: format!("header encoding: {}", e) })?;
        let aad = SealedRecord::associated_data(FORMAT_VERSION, &header_bytes);

        let mut ciphertext = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut ciphertext)
            .map_err(|_| CipherError::EncryptionFailed)?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag.as_slice());

        Ok(SealedRecord {
            format_version: FORMAT_VERSION,
            nonce,
            tag: tag_bytes,
            header,
            header_bytes,
            ciphertext,
        })
    }

    /// Verify and decrypt. Fails closed: on any mismatch no plaintext is
    /// returned and the scratch buffer is zeroized. The parsed header must
    /// match the authenticated header bytes.
    pub fn unseal(&self, key: &EncryptionKey, sealed: &SealedRecord) -> CipherResult<UnsealedBuffer> {
        if sealed.format_version != FORMAT_VERSION {
            return Err(CipherError::UnsupportedFormatVersion { version: sealed.format_version });
        }

        if sealed.header.key_id != key.key_id() {
            tracing::warn!(
                dataset = %sealed.header.dataset_id,
                sealed_key_id = %sealed.header.key_id,
                active_key_id = %key.key_id(),
                "Sealed record was produced under a different key"
            );
            return Err(CipherError::AuthenticationFailed);
        }

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| CipherError::AuthenticationFailed)?;
        let aad = SealedRecord::associated_data(sealed.format_version, &sealed.header_bytes);

        let mut plaintext = Zeroizing::new(sealed.ciphertext.clone());
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&sealed.nonce),
                &aad,
                plaintext.as_mut_slice(),
                Tag::from_slice(&sealed.tag),
            )
            .map_err(|_| CipherError::AuthenticationFailed)?;

        let authenticated: SealedHeader =
            serde_json::from_slice(&sealed.header_bytes).map_err(|_| CipherError::AuthenticationFailed)?;
        if authenticated != sealed.header {
            return Err(CipherError::AuthenticationFailed);
        }

        Ok(UnsealedBuffer::new(authenticated.dataset_id, plaintext))
    }
}

//! Snapshot encoding, fingerprinting and payload encryption.
//!
//! A snapshot is the full list of open tabs, canonicalized and encoded
//! with MessagePack. The fingerprint is computed over the canonical
//! encoding, so two captures of the same workspace always hash the same
//! regardless of enumeration order. The relay only ever sees the
//! encrypted blob.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use thiserror::Error;

use tabvault_types::{Fingerprint, TabRecord};

use crate::keys::{self, DataKey, KeyError, NONCE_SIZE};

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// MessagePack encoding failed.
    #[error("snapshot encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding failed.
    #[error("snapshot decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Encryption or decryption failed.
    #[error(transparent)]
    Crypto(#[from] KeyError),

    /// A wire field was not valid base64.
    #[error("invalid base64 in {field}: {source}")]
    Base64 {
        /// Which field failed to decode.
        field: &'static str,
        /// The underlying decode error.
        source: base64::DecodeError,
    },
}

/// An encrypted snapshot payload in wire form.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedSnapshot {
    /// AEAD nonce, base64.
    pub iv: String,
    /// Ciphertext, base64.
    pub blob: String,
}

impl std::fmt::Debug for EncryptedSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSnapshot")
            .field("iv", &self.iv)
            .field("blob_len", &self.blob.len())
            .finish()
    }
}

/// Canonicalize and encode a tab list.
///
/// The record order is normalized first, so the bytes (and therefore the
/// fingerprint) are stable across captures of an unchanged workspace.
pub fn encode_tabs(tabs: &mut [TabRecord]) -> Result<Vec<u8>, CodecError> {
    TabRecord::canonicalize(tabs);
    Ok(rmp_serde::to_vec(&tabs)?)
}

/// Decode an encoded tab list.
pub fn decode_tabs(bytes: &[u8]) -> Result<Vec<TabRecord>, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Fingerprint of an encoded snapshot.
pub fn fingerprint(encoded: &[u8]) -> Fingerprint {
    Fingerprint::of(encoded)
}

/// Encrypt an encoded snapshot with the account DataKey.
pub fn encrypt_snapshot(key: &DataKey, encoded: &[u8]) -> Result<EncryptedSnapshot, CodecError> {
    let (ciphertext, nonce) = keys::seal(key.as_bytes(), encoded)?;
    Ok(EncryptedSnapshot {
        iv: B64.encode(nonce),
        blob: B64.encode(ciphertext),
    })
}

/// Decrypt a downloaded snapshot blob back to its encoded form.
pub fn decrypt_snapshot(key: &DataKey, iv: &str, blob: &str) -> Result<Vec<u8>, CodecError> {
    let nonce_bytes = B64.decode(iv).map_err(|source| CodecError::Base64 {
        field: "iv",
        source,
    })?;
    let nonce: [u8; NONCE_SIZE] = nonce_bytes
        .try_into()
        .map_err(|_| CodecError::Crypto(KeyError::MalformedEnvelope("wrong nonce length".into())))?;
    let ciphertext = B64.decode(blob).map_err(|source| CodecError::Base64 {
        field: "encrypted_blob",
        source,
    })?;

    Ok(keys::open(key.as_bytes(), &ciphertext, &nonce)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(url: &str, window_id: u32, index: u32) -> TabRecord {
        TabRecord {
            url: url.into(),
            title: format!("title of {url}"),
            favicon_url: None,
            window_id,
            index,
            active: false,
            pinned: false,
        }
    }

    #[test]
    fn encoding_is_order_independent() {
        let mut forward = vec![tab("https://a", 1, 0), tab("https://b", 1, 1), tab("https://c", 2, 0)];
        let mut reversed: Vec<TabRecord> = forward.iter().cloned().rev().collect();

        let a = encode_tabs(&mut forward).unwrap();
        let b = encode_tabs(&mut reversed).unwrap();
        assert_eq!(a, b);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn content_change_moves_the_fingerprint() {
        let mut base = vec![tab("https://a", 1, 0)];
        let mut changed = vec![tab("https://a", 1, 0)];
        changed[0].pinned = true;

        let a = encode_tabs(&mut base).unwrap();
        let b = encode_tabs(&mut changed).unwrap();
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn decode_inverts_encode() {
        let mut tabs = vec![tab("https://a", 1, 0), tab("https://b", 1, 1)];
        let encoded = encode_tabs(&mut tabs).unwrap();
        let decoded = decode_tabs(&encoded).unwrap();
        assert_eq!(decoded, tabs);
    }

    #[test]
    fn snapshot_encrypts_and_decrypts() {
        let key = DataKey::generate();
        let mut tabs = vec![tab("https://private.example", 1, 0)];
        let encoded = encode_tabs(&mut tabs).unwrap();

        let sealed = encrypt_snapshot(&key, &encoded).unwrap();
        let opened = decrypt_snapshot(&key, &sealed.iv, &sealed.blob).unwrap();
        assert_eq!(opened, encoded);

        // The blob must not contain the plaintext URL.
        let raw = B64.decode(&sealed.blob).unwrap();
        let needle = b"private.example";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn repeated_encryption_never_reuses_an_iv() {
        let key = DataKey::generate();
        let mut tabs = vec![tab("https://a", 1, 0)];
        let encoded = encode_tabs(&mut tabs).unwrap();

        let first = encrypt_snapshot(&key, &encoded).unwrap();
        let second = encrypt_snapshot(&key, &encoded).unwrap();
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.blob, second.blob);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let mut tabs = vec![tab("https://a", 1, 0)];
        let encoded = encode_tabs(&mut tabs).unwrap();
        let sealed = encrypt_snapshot(&DataKey::generate(), &encoded).unwrap();

        let result = decrypt_snapshot(&DataKey::generate(), &sealed.iv, &sealed.blob);
        assert!(matches!(
            result,
            Err(CodecError::Crypto(KeyError::DecryptionFailed))
        ));
    }

    #[test]
    fn garbage_base64_is_rejected() {
        let key = DataKey::generate();
        let result = decrypt_snapshot(&key, "???", "???");
        assert!(matches!(result, Err(CodecError::Base64 { .. })));
    }

    #[test]
    fn empty_workspace_round_trips() {
        let key = DataKey::generate();
        let encoded = encode_tabs(&mut []).unwrap();
        let sealed = encrypt_snapshot(&key, &encoded).unwrap();
        let opened = decrypt_snapshot(&key, &sealed.iv, &sealed.blob).unwrap();
        assert!(decode_tabs(&opened).unwrap().is_empty());
    }
}

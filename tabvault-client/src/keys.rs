//! Envelope encryption for the account DataKey.
//!
//! Every snapshot is encrypted with one long-lived random DataKey. The
//! DataKey itself is never stored anywhere in the clear; the relay only
//! ever holds it wrapped inside envelopes:
//!
//! - the password envelope, wrapped with a key derived from the account
//!   password via PBKDF2-HMAC-SHA-256
//! - the recovery envelope, wrapped with a key derived from a randomly
//!   generated recovery code
//!
//! Changing the password rewraps the same DataKey in a fresh envelope, so
//! existing snapshots stay readable without re-encryption. Losing both the
//! password and the recovery code makes the data permanently unreadable;
//! there is no server-side escape hatch.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use tabvault_types::{PasswordEnvelope, RecoveryEnvelope};

/// Key size for XChaCha20-Poly1305 (256 bits).
pub const KEY_SIZE: usize = 32;

/// Nonce size for XChaCha20-Poly1305 (192 bits).
pub const NONCE_SIZE: usize = 24;

/// PBKDF2 salt size.
pub const SALT_SIZE: usize = 16;

/// PBKDF2 iterations for the password-derived wrapping key.
pub const PASSWORD_ITERATIONS: u32 = 100_000;

/// PBKDF2 iterations for the recovery-code-derived wrapping key.
///
/// The recovery code carries 125 bits of machine-generated entropy, so it
/// does not need the stretching a human password does. The lower count
/// keeps recovery usable on slow devices.
pub const RECOVERY_ITERATIONS: u32 = 10_000;

/// Number of symbols in a recovery code.
pub const RECOVERY_CODE_LEN: usize = 25;

/// Crockford base32 alphabet. Excludes I, L, O and U.
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Key handling errors.
#[derive(Debug, Error)]
pub enum KeyError {
    /// AEAD encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// AEAD open failed. For an envelope this means the password or
    /// recovery code is wrong (or the envelope is corrupt); the two are
    /// deliberately indistinguishable.
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// An envelope field was not valid base64 or had the wrong length.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The recovery code is not 25 Crockford base32 symbols.
    #[error("invalid recovery code")]
    InvalidRecoveryCode,
}

/// The long-lived random key that encrypts all snapshot payloads.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; KEY_SIZE]);

impl DataKey {
    /// Generate a fresh random DataKey. Done exactly once per account.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Reconstruct a DataKey from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

// Don't leak the key in debug output
impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataKey([REDACTED])")
    }
}

/// A machine-generated recovery code, stored in normalized form.
///
/// 25 Crockford base32 symbols, about 125 bits of entropy. Displayed in
/// five hyphenated groups for transcription.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryCode(String);

impl RecoveryCode {
    /// Generate a random recovery code.
    pub fn generate() -> Self {
        let mut raw = [0u8; RECOVERY_CODE_LEN];
        getrandom::getrandom(&mut raw).expect("getrandom failed");
        // Masking to 5 bits maps a uniform byte onto the 32-symbol
        // alphabet without modulo bias.
        let code: String = raw
            .iter()
            .map(|b| CROCKFORD[(b & 0x1f) as usize] as char)
            .collect();
        Self(code)
    }

    /// Parse a user-entered code.
    ///
    /// Accepts hyphens, spaces and lowercase, and folds the Crockford
    /// look-alikes: `O` reads as `0`, `I` and `L` read as `1`.
    pub fn parse(input: &str) -> Result<Self, KeyError> {
        let mut code = String::with_capacity(RECOVERY_CODE_LEN);
        for ch in input.chars() {
            if ch == '-' || ch.is_whitespace() {
                continue;
            }
            let ch = match ch.to_ascii_uppercase() {
                'O' => '0',
                'I' | 'L' => '1',
                other => other,
            };
            if !CROCKFORD.contains(&(ch as u8)) {
                return Err(KeyError::InvalidRecoveryCode);
            }
            code.push(ch);
        }
        if code.len() != RECOVERY_CODE_LEN {
            return Err(KeyError::InvalidRecoveryCode);
        }
        Ok(Self(code))
    }

    /// The normalized 25-symbol form, used for key derivation and the
    /// server-side verifier.
    pub fn normalized(&self) -> &str {
        &self.0
    }

    /// The display form: `XXXXX-XXXXX-XXXXX-XXXXX-XXXXX`.
    pub fn display_grouped(&self) -> String {
        self.0
            .as_bytes()
            .chunks(5)
            .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Salted verifier the relay stores to gate recovery-envelope reads.
    ///
    /// `hex(SHA-256(salt || normalized code))`. The relay compares this
    /// without ever seeing the code itself, and the salt prevents
    /// precomputed lookup across accounts.
    pub fn verifier(&self, salt: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Debug for RecoveryCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecoveryCode([REDACTED])")
    }
}

fn derive_wrapping_key(secret: &[u8], salt: &[u8], iterations: u32) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut key);
    key
}

pub(crate) fn seal(
    wrapping_key: &[u8; KEY_SIZE],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), KeyError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    getrandom::getrandom(&mut nonce_bytes).expect("getrandom failed");
    let nonce = XNonce::from_slice(&nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(wrapping_key)
        .map_err(|e| KeyError::EncryptionFailed(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| KeyError::EncryptionFailed("aead encrypt failed".into()))?;

    Ok((ciphertext, nonce_bytes))
}

pub(crate) fn open(
    wrapping_key: &[u8; KEY_SIZE],
    ciphertext: &[u8],
    nonce: &[u8; NONCE_SIZE],
) -> Result<Vec<u8>, KeyError> {
    let nonce = XNonce::from_slice(nonce);

    let cipher = XChaCha20Poly1305::new_from_slice(wrapping_key)
        .map_err(|e| KeyError::EncryptionFailed(e.to_string()))?;

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| KeyError::DecryptionFailed)
}

fn decode_b64(label: &str, value: &str) -> Result<Vec<u8>, KeyError> {
    B64.decode(value)
        .map_err(|e| KeyError::MalformedEnvelope(format!("{label}: {e}")))
}

fn decode_nonce(label: &str, value: &str) -> Result<[u8; NONCE_SIZE], KeyError> {
    let bytes = decode_b64(label, value)?;
    bytes
        .try_into()
        .map_err(|_| KeyError::MalformedEnvelope(format!("{label}: wrong nonce length")))
}

/// Wrap a DataKey with a password-derived key.
pub fn wrap_with_password(key: &DataKey, password: &str) -> Result<PasswordEnvelope, KeyError> {
    let mut salt = [0u8; SALT_SIZE];
    getrandom::getrandom(&mut salt).expect("getrandom failed");

    let mut wrapping = derive_wrapping_key(password.as_bytes(), &salt, PASSWORD_ITERATIONS);
    let result = seal(&wrapping, key.as_bytes());
    wrapping.zeroize();
    let (ciphertext, nonce) = result?;

    Ok(PasswordEnvelope {
        encrypted_master_key: B64.encode(ciphertext),
        master_key_iv: B64.encode(nonce),
        salt: B64.encode(salt),
        kdf_iterations: PASSWORD_ITERATIONS,
    })
}

/// Unwrap the DataKey from a password envelope.
///
/// A wrong password fails the AEAD tag check and surfaces as
/// [`KeyError::DecryptionFailed`].
pub fn open_password_envelope(
    envelope: &PasswordEnvelope,
    password: &str,
) -> Result<DataKey, KeyError> {
    let salt = decode_b64("salt", &envelope.salt)?;
    let nonce = decode_nonce("master_key_iv", &envelope.master_key_iv)?;
    let ciphertext = decode_b64("encrypted_master_key", &envelope.encrypted_master_key)?;

    // The envelope carries its own iteration count so old envelopes stay
    // readable after the default changes.
    let mut wrapping =
        derive_wrapping_key(password.as_bytes(), &salt, envelope.kdf_iterations);
    let result = open(&wrapping, &ciphertext, &nonce);
    wrapping.zeroize();
    let mut plaintext = result?;

    let bytes: [u8; KEY_SIZE] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::MalformedEnvelope("wrapped key has wrong length".into()))?;
    plaintext.zeroize();
    Ok(DataKey::from_bytes(bytes))
}

/// Wrap a DataKey with a recovery-code-derived key.
pub fn wrap_with_recovery(key: &DataKey, code: &RecoveryCode) -> Result<RecoveryEnvelope, KeyError> {
    let mut salt = [0u8; SALT_SIZE];
    getrandom::getrandom(&mut salt).expect("getrandom failed");

    let mut wrapping =
        derive_wrapping_key(code.normalized().as_bytes(), &salt, RECOVERY_ITERATIONS);
    let result = seal(&wrapping, key.as_bytes());
    wrapping.zeroize();
    let (ciphertext, nonce) = result?;

    Ok(RecoveryEnvelope {
        recovery_encrypted_master_key: B64.encode(ciphertext),
        recovery_key_iv: B64.encode(nonce),
        recovery_key_salt: B64.encode(salt),
        kdf_iterations: RECOVERY_ITERATIONS,
    })
}

/// Unwrap the DataKey from a recovery envelope.
pub fn open_recovery_envelope(
    envelope: &RecoveryEnvelope,
    code: &RecoveryCode,
) -> Result<DataKey, KeyError> {
    let salt = decode_b64("recovery_key_salt", &envelope.recovery_key_salt)?;
    let nonce = decode_nonce("recovery_key_iv", &envelope.recovery_key_iv)?;
    let ciphertext = decode_b64(
        "recovery_encrypted_master_key",
        &envelope.recovery_encrypted_master_key,
    )?;

    let mut wrapping =
        derive_wrapping_key(code.normalized().as_bytes(), &salt, envelope.kdf_iterations);
    let result = open(&wrapping, &ciphertext, &nonce);
    wrapping.zeroize();
    let mut plaintext = result?;

    let bytes: [u8; KEY_SIZE] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::MalformedEnvelope("wrapped key has wrong length".into()))?;
    plaintext.zeroize();
    Ok(DataKey::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_envelope_round_trips() {
        let key = DataKey::generate();
        let envelope = wrap_with_password(&key, "correct horse").unwrap();

        let opened = open_password_envelope(&envelope, "correct horse").unwrap();
        assert_eq!(opened.as_bytes(), key.as_bytes());
    }

    #[test]
    fn wrong_password_is_an_auth_failure() {
        let key = DataKey::generate();
        let envelope = wrap_with_password(&key, "correct horse").unwrap();

        let result = open_password_envelope(&envelope, "battery staple");
        assert!(matches!(result, Err(KeyError::DecryptionFailed)));
    }

    #[test]
    fn password_change_rewraps_the_same_key() {
        let key = DataKey::generate();
        let old_env = wrap_with_password(&key, "old-password").unwrap();

        // Rewrap under the new password: new salt, new nonce, same key.
        let opened = open_password_envelope(&old_env, "old-password").unwrap();
        let new_env = wrap_with_password(&opened, "new-password").unwrap();
        assert_ne!(new_env.salt, old_env.salt);

        let reopened = open_password_envelope(&new_env, "new-password").unwrap();
        assert_eq!(reopened.as_bytes(), key.as_bytes());
    }

    #[test]
    fn envelope_iteration_count_is_honored() {
        let key = DataKey::generate();
        let mut envelope = wrap_with_password(&key, "pw").unwrap();
        assert_eq!(envelope.kdf_iterations, PASSWORD_ITERATIONS);

        // Tampering with the recorded count changes the derived key and
        // fails the tag check rather than silently opening.
        envelope.kdf_iterations = 50_000;
        assert!(matches!(
            open_password_envelope(&envelope, "pw"),
            Err(KeyError::DecryptionFailed)
        ));
    }

    #[test]
    fn recovery_envelope_round_trips() {
        let key = DataKey::generate();
        let code = RecoveryCode::generate();
        let envelope = wrap_with_recovery(&key, &code).unwrap();
        assert_eq!(envelope.kdf_iterations, RECOVERY_ITERATIONS);

        let opened = open_recovery_envelope(&envelope, &code).unwrap();
        assert_eq!(opened.as_bytes(), key.as_bytes());
    }

    #[test]
    fn wrong_recovery_code_fails() {
        let key = DataKey::generate();
        let envelope = wrap_with_recovery(&key, &RecoveryCode::generate()).unwrap();

        let result = open_recovery_envelope(&envelope, &RecoveryCode::generate());
        assert!(matches!(result, Err(KeyError::DecryptionFailed)));
    }

    #[test]
    fn malformed_base64_is_reported() {
        let key = DataKey::generate();
        let mut envelope = wrap_with_password(&key, "pw").unwrap();
        envelope.salt = "not base64!!!".into();

        assert!(matches!(
            open_password_envelope(&envelope, "pw"),
            Err(KeyError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn recovery_code_has_25_crockford_symbols() {
        let code = RecoveryCode::generate();
        assert_eq!(code.normalized().len(), RECOVERY_CODE_LEN);
        for ch in code.normalized().bytes() {
            assert!(CROCKFORD.contains(&ch));
        }
    }

    #[test]
    fn display_form_is_five_hyphenated_groups() {
        let code = RecoveryCode::generate();
        let display = code.display_grouped();
        assert_eq!(display.len(), 29);
        let groups: Vec<&str> = display.split('-').collect();
        assert_eq!(groups.len(), 5);
        assert!(groups.iter().all(|g| g.len() == 5));
    }

    #[test]
    fn parse_accepts_display_form() {
        let code = RecoveryCode::generate();
        let parsed = RecoveryCode::parse(&code.display_grouped()).unwrap();
        assert_eq!(parsed.normalized(), code.normalized());
    }

    #[test]
    fn parse_folds_lookalikes_and_case() {
        let parsed = RecoveryCode::parse("oil0o-xxxxx-xxxxx-xxxxx-xxxxx").unwrap();
        assert!(parsed.normalized().starts_with("01100"));

        let lower = RecoveryCode::parse("abcde fghjk mnpqr stvwx yz012").unwrap();
        assert_eq!(lower.normalized(), "ABCDEFGHJKMNPQRSTVWXYZ012");
    }

    #[test]
    fn parse_rejects_bad_input() {
        // Wrong length.
        assert!(RecoveryCode::parse("ABCDE").is_err());
        // 'U' is not in the Crockford alphabet.
        assert!(RecoveryCode::parse("UUUUU-UUUUU-UUUUU-UUUUU-UUUUU").is_err());
    }

    #[test]
    fn verifier_is_salted() {
        let code = RecoveryCode::generate();
        let v1 = code.verifier(b"salt-one");
        let v2 = code.verifier(b"salt-two");
        assert_ne!(v1, v2);
        assert_eq!(v1, code.verifier(b"salt-one"));
        assert_eq!(v1.len(), 64);
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        assert_eq!(format!("{:?}", DataKey::generate()), "DataKey([REDACTED])");
        assert_eq!(
            format!("{:?}", RecoveryCode::generate()),
            "RecoveryCode([REDACTED])"
        );
    }
}

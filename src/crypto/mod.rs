//! Envelope encryption for OAuth tokens at rest.
//!
//! Every encrypt call generates a fresh 32-byte data key and 16-byte IV,
//! encrypts the plaintext with AES-256-CBC (PKCS7), and wraps the data key
//! under the configured master key. Blob layout:
//!
//! ```text
//! [wrapped-key-len: u32 LE][wrapped key][iv: 16 bytes][ciphertext]
//! ```
//!
//! The format carries no integrity tag: corrupted ciphertext surfaces only
//! if unpadding happens to fail, not deterministically. The layout is kept
//! for compatibility with existing blobs; a format revision should move to
//! an AEAD mode.
//!
//! Blobs are bound to the wrapper that produced them. A Vault-wrapped blob
//! cannot be read with a local master key and vice versa; mixing modes is a
//! configuration error, not a data error.

mod local;
mod vault;

pub use local::LocalKeyWrapper;
pub use vault::VaultKeyWrapper;

use std::sync::Arc;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;

use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Data-key length in bytes (AES-256).
pub const DATA_KEY_LEN: usize = 32;
/// Initialization-vector length in bytes (AES block size).
pub const IV_LEN: usize = 16;

/// Wraps and unwraps per-item data keys under a master key.
#[async_trait]
pub trait KeyWrapper: Send + Sync {
    /// Wrap a data key. The returned bytes are opaque to the caller.
    async fn wrap_data_key(&self, data_key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Unwrap a previously wrapped data key.
    async fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Envelope cipher for opaque secrets.
pub struct TokenCipher {
    wrapper: Arc<dyn KeyWrapper>,
}

impl TokenCipher {
    pub fn new(wrapper: Arc<dyn KeyWrapper>) -> Self {
        Self { wrapper }
    }

    /// Encrypt arbitrary bytes into an envelope blob.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut data_key = [0u8; DATA_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut data_key);
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext =
            Aes256CbcEnc::new(&data_key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let wrapped = self.wrapper.wrap_data_key(&data_key).await?;

        let mut blob = Vec::with_capacity(4 + wrapped.len() + IV_LEN + ciphertext.len());
        blob.extend_from_slice(&(wrapped.len() as u32).to_le_bytes());
        blob.extend_from_slice(&wrapped);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt an envelope blob back to the original bytes.
    pub async fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // Smallest well-formed blob: length prefix, empty wrapped key is
        // impossible, but the IV and at least one cipher block must be there.
        if blob.len() < 4 + IV_LEN + 1 {
            return Err(CryptoError::MalformedBlob(format!(
                "blob too short: {} bytes",
                blob.len()
            )));
        }

        let wrapped_len = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
        if 4 + wrapped_len + IV_LEN > blob.len() {
            return Err(CryptoError::MalformedBlob(format!(
                "wrapped-key length {} exceeds blob of {} bytes",
                wrapped_len,
                blob.len()
            )));
        }

        let wrapped = &blob[4..4 + wrapped_len];
        let iv = &blob[4 + wrapped_len..4 + wrapped_len + IV_LEN];
        let ciphertext = &blob[4 + wrapped_len + IV_LEN..];

        let data_key = self.wrapper.unwrap_data_key(wrapped).await?;
        if data_key.len() != DATA_KEY_LEN {
            return Err(CryptoError::Unwrap(format!(
                "unwrapped data key is {} bytes, expected {}",
                data_key.len(),
                DATA_KEY_LEN
            )));
        }

        let dec = Aes256CbcDec::new_from_slices(&data_key, iv)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;
        dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Cipher("unpadding failed".to_string()))
    }

    /// Encrypt a UTF-8 string to a base64 blob for text-column storage.
    pub async fn encrypt_string(&self, plaintext: &str) -> Result<String, CryptoError> {
        let blob = self.encrypt(plaintext.as_bytes()).await?;
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a base64 blob back to a UTF-8 string.
    pub async fn decrypt_string(&self, encoded: &str) -> Result<String, CryptoError> {
        let blob = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::MalformedBlob(format!("invalid base64: {e}")))?;
        let plaintext = self.decrypt(&blob).await?;
        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Cipher("decrypted bytes are not UTF-8".to_string()))
    }
}

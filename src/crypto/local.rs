//! Local master-key wrapper.
//!
//! INSECURE: the master key lives in configuration on the same host as the
//! data it protects. Intended for dev profiles; production deployments use
//! the Vault wrapper.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use super::{DATA_KEY_LEN, IV_LEN, KeyWrapper};
use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Wraps data keys with AES-256-CBC under a configuration-supplied master
/// key. Wrapped form: `[iv: 16][ciphertext: 48]`, 64 bytes total.
pub struct LocalKeyWrapper {
    master_key: [u8; DATA_KEY_LEN],
}

impl LocalKeyWrapper {
    /// Build from a base64-encoded 32-byte master key.
    pub fn from_config(key_base64: &SecretString) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(key_base64.expose_secret())
            .map_err(|e| CryptoError::InvalidMasterKey(format!("not valid base64: {e}")))?;
        let master_key: [u8; DATA_KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            CryptoError::InvalidMasterKey(format!(
                "must decode to {} bytes, got {}",
                DATA_KEY_LEN,
                b.len()
            ))
        })?;
        Ok(Self { master_key })
    }
}

#[async_trait]
impl KeyWrapper for LocalKeyWrapper {
    async fn wrap_data_key(&self, data_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.master_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(data_key);

        let mut wrapped = Vec::with_capacity(IV_LEN + ciphertext.len());
        wrapped.extend_from_slice(&iv);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    async fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if wrapped.len() < IV_LEN + 16 {
            return Err(CryptoError::Unwrap(format!(
                "wrapped key too short: {} bytes",
                wrapped.len()
            )));
        }
        let (iv, ciphertext) = wrapped.split_at(IV_LEN);

        let dec = Aes256CbcDec::new_from_slices(&self.master_key, iv)
            .map_err(|e| CryptoError::Unwrap(e.to_string()))?;
        dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Unwrap("master-key decryption failed".to_string()))
    }
}

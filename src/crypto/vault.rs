//! Master-key wrapping via HashiCorp Vault's transit engine.
//!
//! The master key never leaves Vault; data keys are sent to the transit
//! endpoints for wrapping and unwrapping. Wrapped keys are Vault ciphertext
//! strings (`vault:v1:...`) stored as their UTF-8 bytes.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::KeyWrapper;
use crate::error::CryptoError;

pub struct VaultKeyWrapper {
    http: reqwest::Client,
    addr: String,
    token: SecretString,
    key_name: String,
}

#[derive(Debug, Deserialize)]
struct TransitResponse {
    data: TransitData,
}

#[derive(Debug, Deserialize)]
struct TransitData {
    #[serde(default)]
    ciphertext: Option<String>,
    #[serde(default)]
    plaintext: Option<String>,
}

impl VaultKeyWrapper {
    pub fn new(addr: String, token: SecretString, key_name: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            addr: addr.trim_end_matches('/').to_string(),
            token,
            key_name,
        }
    }

    async fn transit(
        &self,
        operation: &str,
        body: serde_json::Value,
    ) -> Result<TransitData, CryptoError> {
        let url = format!("{}/v1/transit/{}/{}", self.addr, operation, self.key_name);
        let response = self
            .http
            .post(&url)
            .header("X-Vault-Token", self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| CryptoError::Wrap(format!("Vault request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CryptoError::Wrap(format!(
                "Vault {} returned HTTP {}",
                operation,
                status.as_u16()
            )));
        }

        let parsed: TransitResponse = response
            .json()
            .await
            .map_err(|e| CryptoError::Wrap(format!("Vault response unreadable: {e}")))?;
        Ok(parsed.data)
    }
}

#[async_trait]
impl KeyWrapper for VaultKeyWrapper {
    async fn wrap_data_key(&self, data_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let body = serde_json::json!({ "plaintext": BASE64.encode(data_key) });
        let data = self.transit("encrypt", body).await?;
        let ciphertext = data
            .ciphertext
            .ok_or_else(|| CryptoError::Wrap("Vault response missing ciphertext".to_string()))?;
        Ok(ciphertext.into_bytes())
    }

    async fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = std::str::from_utf8(wrapped)
            .map_err(|_| CryptoError::Unwrap("wrapped key is not UTF-8".to_string()))?;
        let body = serde_json::json!({ "ciphertext": ciphertext });
        let data = self
            .transit("decrypt", body)
            .await
            .map_err(|e| match e {
                CryptoError::Wrap(msg) => CryptoError::Unwrap(msg),
                other => other,
            })?;
        let plaintext = data
            .plaintext
            .ok_or_else(|| CryptoError::Unwrap("Vault response missing plaintext".to_string()))?;
        BASE64
            .decode(plaintext)
            .map_err(|e| CryptoError::Unwrap(format!("invalid base64 from Vault: {e}")))
    }
}

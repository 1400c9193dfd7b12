//! Credential store for ADB public key authentication.
//!
//! The device challenges with a 20-byte token which the host signs as if
//! it were a SHA-1 digest (RSA PKCS#1 v1.5). Unknown keys are offered to
//! the device in Android's `RSAPublicKey` struct format so the operator
//! can accept them on-device.

use crate::error::{BridgeError, Result};
use base64::Engine as _;
use bytes::BufMut;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Key size Android expects
pub const KEY_BITS: usize = 2048;

/// Holds the host key pair; loads or generates it on first use
pub struct CredentialStore {
    key_path: Option<PathBuf>,
    identity: String,
    key: OnceCell<RsaPrivateKey>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("key_path", &self.key_path)
            .field("identity", &self.identity)
            .field("loaded", &self.key.initialized())
            .finish()
    }
}

impl CredentialStore {
    /// Key persisted as PKCS#8 PEM at `key_path`
    pub fn new(key_path: impl Into<PathBuf>, identity: impl Into<String>) -> Self {
        Self {
            key_path: Some(key_path.into()),
            identity: identity.into(),
            key: OnceCell::new(),
        }
    }

    /// Key generated in memory and never written to disk
    pub fn ephemeral(identity: impl Into<String>) -> Self {
        Self {
            key_path: None,
            identity: identity.into(),
            key: OnceCell::new(),
        }
    }

    pub fn from_key(key: RsaPrivateKey, identity: impl Into<String>) -> Self {
        Self {
            key_path: None,
            identity: identity.into(),
            key: OnceCell::new_with(Some(key)),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.key.initialized()
    }

    /// Ensure a key pair exists. Idempotent.
    pub async fn generate_key(&self) -> Result<()> {
        self.private_key().await.map(|_| ())
    }

    async fn private_key(&self) -> Result<&RsaPrivateKey> {
        self.key.get_or_try_init(|| self.load_or_generate()).await
    }

    async fn load_or_generate(&self) -> Result<RsaPrivateKey> {
        if let Some(path) = &self.key_path {
            if tokio::fs::try_exists(path).await? {
                let pem = tokio::fs::read_to_string(path).await?;
                let key = RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| {
                    BridgeError::Authentication(format!(
                        "Invalid key file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                debug!("Loaded ADB key from {}", path.display());
                return Ok(key);
            }
        }

        info!("Generating {}-bit ADB key", KEY_BITS);
        let key = tokio::task::spawn_blocking(|| {
            RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
        })
        .await
        .map_err(|e| BridgeError::Authentication(format!("Key generation task failed: {}", e)))?
        .map_err(|e| BridgeError::Authentication(format!("Key generation failed: {}", e)))?;

        if let Some(path) = &self.key_path {
            persist_key(&key, path).await?;
            info!("Saved ADB key to {}", path.display());
        }
        Ok(key)
    }

    /// Sign an AUTH TOKEN challenge
    pub async fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>> {
        let key = self.private_key().await?;
        key.sign(Pkcs1v15Sign::new::<Sha1>(), token)
            .map_err(|e| BridgeError::Authentication(format!("Signing failed: {}", e)))
    }

    /// Payload for AUTH RSAPUBLICKEY: base64 key, a space, identity, NUL
    pub async fn public_key_payload(&self) -> Result<Vec<u8>> {
        let key = self.private_key().await?;
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(android_public_key(&RsaPublicKey::from(key)));

        let mut payload = Vec::with_capacity(encoded.len() + self.identity.len() + 2);
        payload.extend_from_slice(encoded.as_bytes());
        payload.push(b' ');
        payload.extend_from_slice(self.identity.as_bytes());
        payload.push(0);
        Ok(payload)
    }
}

async fn persist_key(key: &RsaPrivateKey, path: &Path) -> Result<()> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| BridgeError::Authentication(format!("Key encoding failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, pem.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

/// Encode a public key as Android's `RSAPublicKey` struct.
///
/// Layout (all little-endian u32): word count, `n0inv = -1 / n[0] mod 2^32`,
/// modulus words, `R^2 mod n` words (R = 2^bits), exponent.
pub fn android_public_key(key: &RsaPublicKey) -> Vec<u8> {
    let n = key.n();
    let modulus_bytes = key.size();
    let words = modulus_bytes / 4;

    let n_le = padded_le(n, modulus_bytes);
    let n0 = u32::from_le_bytes([n_le[0], n_le[1], n_le[2], n_le[3]]);

    let r = BigUint::from(1u32) << (modulus_bytes * 8);
    let rr = (&r * &r) % n;
    let rr_le = padded_le(&rr, modulus_bytes);

    let e_le = key.e().to_bytes_le();
    let mut exponent = [0u8; 4];
    for (dst, src) in exponent.iter_mut().zip(e_le.iter()) {
        *dst = *src;
    }

    let mut out = Vec::with_capacity(12 + 2 * modulus_bytes);
    out.put_u32_le(words as u32);
    out.put_u32_le(mod_inverse_u32(n0).wrapping_neg());
    out.put_slice(&n_le);
    out.put_slice(&rr_le);
    out.put_slice(&exponent);
    out
}

fn padded_le(value: &BigUint, len: usize) -> Vec<u8> {
    let mut bytes = value.to_bytes_le();
    bytes.resize(len, 0);
    bytes
}

/// Inverse of an odd `a` modulo 2^32 (Newton iteration)
fn mod_inverse_u32(a: u32) -> u32 {
    let mut inv = a;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(a.wrapping_mul(inv)));
    }
    inv
}

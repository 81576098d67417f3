// BSD-2-Clause

//! SignedReport codec: decode/verify/decrypt/encode.
//!
//! Verification is SHA-256 (integrity-only) or HMAC-SHA-256 (authenticated),
//! selected by [`KeyType`]. Encryption is AES-128-CTR with the nonce derived
//! from `device_id ^ report_id`.

use aes::cipher::{KeyIvInit, StreamCipher};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{decryption_failed, key_unavailable, signature_invalid, GatewayResult};
use crate::model::DeviceId;
use crate::report::{KeyType, SignedListReport, SIGNATURE_LEN, SIGNED_FOOTER_LEN};

type Aes128Ctr = ctr::Ctr64BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Why a key is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    Sign,
    Verify,
    Encrypt,
    Decrypt,
}

/// Source of signing/encryption keys, keyed by `(device_id, key_type)`.
///
/// The core composes providers in a chain; the first to return a key wins.
/// A provider that has no opinion about a given device/key_type returns
/// `None` rather than erroring, so the chain can fall through.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_key(
        &self,
        device_id: DeviceId,
        key_type: KeyType,
        purpose: KeyPurpose,
    ) -> Option<Vec<u8>>;
}

/// Chain of [`AuthProvider`]s, queried in order until one returns a key.
#[derive(Default)]
pub struct AuthProviderChain {
    providers: Vec<Box<dyn AuthProvider>>,
}

impl AuthProviderChain {
    pub fn new() -> Self {
        Self { providers: Vec::new() }
    }

    pub fn push(mut self, provider: Box<dyn AuthProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub async fn resolve(
        &self,
        device_id: DeviceId,
        key_type: KeyType,
        purpose: KeyPurpose,
    ) -> Option<Vec<u8>> {
        for provider in &self.providers {
            if let Some(key) = provider.get_key(device_id, key_type, purpose).await {
                return Some(key);
            }
        }
        None
    }
}

/// Default provider: a single key read from the `IOTILE_SIGNING_KEY`
/// environment variable (hex-encoded), used for the `device` key type
/// regardless of which device asks.
pub struct EnvKeyProvider {
    key: Option<Vec<u8>>,
}

impl EnvKeyProvider {
    pub fn from_env() -> Self {
        let key = std::env::var("IOTILE_SIGNING_KEY").ok().and_then(|hex_str| hex::decode(hex_str).ok());
        Self { key }
    }
}

#[async_trait]
impl AuthProvider for EnvKeyProvider {
    async fn get_key(
        &self,
        _device_id: DeviceId,
        _key_type: KeyType,
        _purpose: KeyPurpose,
    ) -> Option<Vec<u8>> {
        self.key.clone()
    }
}

/// A report, sliced into the header+readings region (pre-signature) and the
/// mutable lowest/highest/signature footer tail, for signing convenience.
fn wire_with_zeroed_signature(report: &SignedListReport) -> Vec<u8> {
    let mut zeroed = report.clone();
    zeroed.signature = [0u8; SIGNATURE_LEN];
    zeroed.encode()
}

/// Compute the 16-byte signature for `report` under `key`.
///
/// `SHA256`: first 16 bytes of `SHA256(bytes)` (integrity-only).
/// `HMAC-SHA256`: first 16 bytes of `HMAC-SHA256(key, bytes)` (authenticated).
fn compute_signature(report: &SignedListReport, key: &[u8]) -> [u8; SIGNATURE_LEN] {
    let bytes = wire_with_zeroed_signature(report);
    let digest = match report.flags.key_type {
        KeyType::None => Sha256::digest(&bytes).to_vec(),
        _ => {
            // HmacSha256::new_from_slice never fails for SHA-256 (no key-length limit).
            let mut mac = match HmacSha256::new_from_slice(key) {
                Ok(mac) => mac,
                Err(_) => return [0u8; SIGNATURE_LEN],
            };
            mac.update(&bytes);
            mac.finalize().into_bytes().to_vec()
        }
    };
    let mut sig = [0u8; SIGNATURE_LEN];
    sig.copy_from_slice(&digest[..SIGNATURE_LEN]);
    sig
}

/// Sign `report` in place using a key resolved from `providers`.
pub async fn sign(
    report: &mut SignedListReport,
    providers: &AuthProviderChain,
) -> GatewayResult<()> {
    let key = providers
        .resolve(report.device_id, report.flags.key_type, KeyPurpose::Sign)
        .await
        .unwrap_or_default();
    report.signature = compute_signature(report, &key);
    Ok(())
}

/// Verify `report`'s signature against a key resolved from `providers`.
///
/// Returns `Ok(true)` if a key was available and the signature matched,
/// `Ok(false)` if no key was available (verified-but-unauthenticated — the
/// caller applies policy), and `Err(SignatureInvalid)` if a key was
/// available and the signature did not match.
pub async fn verify(
    report: &SignedListReport,
    providers: &AuthProviderChain,
) -> GatewayResult<bool> {
    let Some(key) = providers.resolve(report.device_id, report.flags.key_type, KeyPurpose::Verify).await
    else {
        return Ok(false);
    };
    let expected = compute_signature(report, &key);
    if expected != report.signature {
        return Err(signature_invalid(format!(
            "signature mismatch for device {:#x} report {}",
            report.device_id, report.report_id
        )));
    }
    Ok(true)
}

/// Decrypt the reading region of `report` in place (AES-128-CTR). Nonce is
/// derived from `device_id ^ report_id`, zero-extended to the 16-byte IV.
pub async fn decrypt(
    report: &mut SignedListReport,
    providers: &AuthProviderChain,
) -> GatewayResult<()> {
    if !report.flags.encrypted {
        return Ok(());
    }
    let key = providers
        .resolve(report.device_id, report.flags.key_type, KeyPurpose::Decrypt)
        .await
        .ok_or_else(|| key_unavailable("no decryption key available"))?;
    decrypt_readings(report, &key).map_err(|e| decryption_failed(e.to_string()))
}

fn ctr_iv(device_id: DeviceId, report_id: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    let mixed = device_id ^ u64::from(report_id);
    iv[0..8].copy_from_slice(&mixed.to_le_bytes());
    iv
}

fn decrypt_readings(report: &mut SignedListReport, key: &[u8]) -> Result<(), String> {
    // stream_id stays plaintext (it is routing info, not payload); only the
    // timestamp+value pair of each reading is run through the stream cipher.
    let mut key16 = [0u8; 16];
    let take = key.len().min(16);
    key16[..take].copy_from_slice(&key[..take]);
    let iv = ctr_iv(report.device_id, report.report_id);
    let mut cipher = Aes128Ctr::new(&key16.into(), &iv.into());

    for reading in &mut report.readings {
        let mut block = [0u8; 8];
        block[0..4].copy_from_slice(&reading.timestamp.to_le_bytes());
        block[4..8].copy_from_slice(&reading.value.to_le_bytes());
        cipher.apply_keystream(&mut block);
        reading.timestamp = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        reading.value = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
    }
    Ok(())
}

/// Encrypt the reading region in place (inverse of [`decrypt`] — CTR mode is
/// its own inverse given the same key/IV).
pub fn encrypt_readings(report: &mut SignedListReport, key: &[u8]) -> GatewayResult<()> {
    decrypt_readings(report, key).map_err(decryption_failed)
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;

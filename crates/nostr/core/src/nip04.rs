//! NIP-04: ECDH + AES-256-CBC payload encryption.
//!
//! Used for encrypted job requests and results. The AES key is the x coordinate
//! of the shared secp256k1 point between the sender's secret and the peer's
//! public key, so either side can decrypt with its own secret and the other
//! party's public key. Content format: `base64(ciphertext)?iv=base64(iv)`.

use aes::Aes256;
use base64::{Engine, engine::general_purpose::STANDARD};
use bitcoin::secp256k1::{PublicKey, SecretKey, ecdh};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::RngCore;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_SEPARATOR: &str = "?iv=";

#[derive(Debug, Error)]
pub enum Nip04Error {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Shared AES key between `secret_key` and the peer's x-only (or compressed) hex pubkey.
pub fn shared_key(secret_key: &[u8; 32], peer_pubkey_hex: &str) -> Result<[u8; 32], Nip04Error> {
    let sk =
        SecretKey::from_slice(secret_key).map_err(|e| Nip04Error::InvalidSecretKey(e.to_string()))?;
    let pk = parse_public_key(peer_pubkey_hex)?;

    let point = ecdh::shared_secret_point(&pk, &sk);
    let mut key = [0u8; 32];
    key.copy_from_slice(&point[..32]);
    Ok(key)
}

fn parse_public_key(pubkey_hex: &str) -> Result<PublicKey, Nip04Error> {
    let bytes =
        hex::decode(pubkey_hex).map_err(|e| Nip04Error::InvalidPublicKey(e.to_string()))?;
    let compressed = match bytes.len() {
        32 => {
            let mut buf = Vec::with_capacity(33);
            buf.push(0x02);
            buf.extend_from_slice(&bytes);
            buf
        }
        33 => bytes,
        n => {
            return Err(Nip04Error::InvalidPublicKey(format!(
                "expected 32 or 33 bytes, got {}",
                n
            )));
        }
    };
    PublicKey::from_slice(&compressed).map_err(|e| Nip04Error::InvalidPublicKey(e.to_string()))
}

/// Encrypt `plaintext` for `peer_pubkey_hex`.
pub fn encrypt(
    secret_key: &[u8; 32],
    peer_pubkey_hex: &str,
    plaintext: &str,
) -> Result<String, Nip04Error> {
    let key = shared_key(secret_key, peer_pubkey_hex)?;
    let mut iv = [0u8; 16];
    rand::rng().fill_bytes(&mut iv);

    let ciphertext =
        Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    Ok(format!(
        "{}{}{}",
        STANDARD.encode(ciphertext),
        IV_SEPARATOR,
        STANDARD.encode(iv)
    ))
}

/// Decrypt a payload produced by [`encrypt`] on the other side.
pub fn decrypt(
    secret_key: &[u8; 32],
    peer_pubkey_hex: &str,
    payload: &str,
) -> Result<String, Nip04Error> {
    let (ciphertext_b64, iv_b64) = payload
        .split_once(IV_SEPARATOR)
        .ok_or_else(|| Nip04Error::InvalidPayload("missing iv".to_string()))?;

    let ciphertext = STANDARD
        .decode(ciphertext_b64)
        .map_err(|e| Nip04Error::InvalidPayload(format!("ciphertext: {}", e)))?;
    let iv: [u8; 16] = STANDARD
        .decode(iv_b64)
        .map_err(|e| Nip04Error::InvalidPayload(format!("iv: {}", e)))?
        .try_into()
        .map_err(|_| Nip04Error::InvalidPayload("iv must be 16 bytes".to_string()))?;

    let key = shared_key(secret_key, peer_pubkey_hex)?;
    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|e| Nip04Error::Decryption(e.to_string()))?;

    String::from_utf8(plaintext).map_err(|e| Nip04Error::Decryption(e.to_string()))
}

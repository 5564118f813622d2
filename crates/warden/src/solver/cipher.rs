//! Point payload encryption: compact JSON, AES-ECB, PKCS#7, base64.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use base64::{Engine, engine::general_purpose::STANDARD};
use beian_common::MatchedPoint;
use thiserror::Error;

pub const BLOCK_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("secret key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("failed to serialize points: {0}")]
    Encode(#[from] serde_json::Error),
}

/// `[{"x":..,"y":..},...]` with no whitespace
pub fn serialize_points(points: &[MatchedPoint]) -> Result<String, CipherError> {
    Ok(serde_json::to_string(points)?)
}

/// Encrypt matched points under the per-challenge secret key
pub fn encrypt_points(points: &[MatchedPoint], secret_key: &str) -> Result<String, CipherError> {
    let plaintext = serialize_points(points)?;
    let ciphertext = encrypt_ecb_pkcs7(plaintext.as_bytes(), secret_key.as_bytes())?;
    Ok(STANDARD.encode(ciphertext))
}

/// Pad with `n` bytes of value `n`, where `n = BLOCK_SIZE - len % BLOCK_SIZE`.
/// An already aligned input gains a full block.
pub fn pkcs7_pad(plaintext: &[u8]) -> Vec<u8> {
    let pad = BLOCK_SIZE - plaintext.len() % BLOCK_SIZE;
    let mut padded = Vec::with_capacity(plaintext.len() + pad);
    padded.extend_from_slice(plaintext);
    padded.resize(plaintext.len() + pad, pad as u8);
    padded
}

pub fn encrypt_ecb_pkcs7(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut buffer = pkcs7_pad(plaintext);
    match key.len() {
        16 => encrypt_blocks::<Aes128>(key, &mut buffer)?,
        24 => encrypt_blocks::<Aes192>(key, &mut buffer)?,
        32 => encrypt_blocks::<Aes256>(key, &mut buffer)?,
        other => return Err(CipherError::InvalidKeyLength(other)),
    }
    Ok(buffer)
}

fn encrypt_blocks<C: BlockEncrypt + KeyInit>(key: &[u8], buffer: &mut [u8]) -> Result<(), CipherError> {
    let cipher = C::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    for block in buffer.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

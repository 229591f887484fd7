//! Token codec: AES-CBC over URL-safe base64.
//!
//! Keys, IVs and ciphertexts travel as unpadded URL-safe base64. The raw key
//! length picks AES-128, AES-192 or AES-256. Padding is PKCS#7-shaped on the
//! way in; on the way out the last byte is trusted as the pad length without
//! checking the other pad bytes.
//!
//! There is no authentication tag. A bit-flipped ciphertext of the right
//! length decrypts to garbage rather than failing, and callers rely on the
//! descriptor parse + validation step to reject it.

use crate::error::{ConsoleError, ConsoleResult};
use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Encrypt `plaintext` with the base64url `key` and `iv`, returning base64url ciphertext.
pub fn encrypt(key: &str, iv: &str, plaintext: &[u8]) -> ConsoleResult<String> {
    let key = decode_field("key", key)?;
    let iv = decode_field("iv", iv)?;

    let ciphertext = match key.len() {
        16 => cbc_encrypt::<aes::Aes128>(&key, &iv, plaintext)?,
        24 => cbc_encrypt::<aes::Aes192>(&key, &iv, plaintext)?,
        32 => cbc_encrypt::<aes::Aes256>(&key, &iv, plaintext)?,
        n => return Err(invalid_key_len(n)),
    };

    Ok(URL_SAFE_NO_PAD.encode(ciphertext))
}

/// Decrypt base64url `ciphertext` with the base64url `key` and `iv`.
pub fn decrypt(key: &str, iv: &str, ciphertext: &str) -> ConsoleResult<Vec<u8>> {
    let key = decode_field("key", key)?;
    let iv = decode_field("iv", iv)?;
    let data = decode_field("ciphertext", ciphertext)?;

    if !matches!(key.len(), 16 | 24 | 32) {
        return Err(invalid_key_len(key.len()));
    }
    if data.len() < BLOCK_SIZE {
        return Err(ConsoleError::TruncatedCiphertext(data.len()));
    }
    if data.len() % BLOCK_SIZE != 0 {
        return Err(ConsoleError::Cipher(format!(
            "ciphertext length {} is not a multiple of the block size",
            data.len()
        )));
    }

    let decrypted = match key.len() {
        16 => cbc_decrypt::<aes::Aes128>(&key, &iv, &data)?,
        24 => cbc_decrypt::<aes::Aes192>(&key, &iv, &data)?,
        _ => cbc_decrypt::<aes::Aes256>(&key, &iv, &data)?,
    };

    Ok(unpad(decrypted))
}

/// Check that a base64url key/IV pair is usable without encrypting anything.
pub fn check_secret(key: &str, iv: &str) -> ConsoleResult<()> {
    let key = decode_field("key", key)?;
    let iv = decode_field("iv", iv)?;
    if !matches!(key.len(), 16 | 24 | 32) {
        return Err(invalid_key_len(key.len()));
    }
    if iv.len() != BLOCK_SIZE {
        return Err(invalid_iv_len(iv.len()));
    }
    Ok(())
}

fn decode_field(name: &str, value: &str) -> ConsoleResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| ConsoleError::Decode(format!("{name}: {e}")))
}

fn invalid_key_len(n: usize) -> ConsoleError {
    ConsoleError::Cipher(format!("invalid key size {n} (expected 16, 24 or 32 bytes)"))
}

fn invalid_iv_len(n: usize) -> ConsoleError {
    ConsoleError::Cipher(format!("invalid iv size {n} (expected {BLOCK_SIZE} bytes)"))
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8], plaintext: &[u8]) -> ConsoleResult<Vec<u8>>
where
    C: BlockEncryptMut + BlockCipher,
    cbc::Encryptor<C>: KeyIvInit + BlockEncryptMut,
{
    let mode = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| invalid_iv_len(iv.len()))?;
    Ok(mode.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], data: &[u8]) -> ConsoleResult<Vec<u8>>
where
    C: BlockDecryptMut + BlockCipher,
    cbc::Decryptor<C>: KeyIvInit + BlockDecryptMut,
{
    let mode = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| invalid_iv_len(iv.len()))?;
    // Padding is stripped by hand below; NoPadding only rejects partial blocks.
    mode.decrypt_padded_vec_mut::<NoPadding>(data)
        .map_err(|e| ConsoleError::Cipher(e.to_string()))
}

/// Trim as many trailing bytes as the last byte says.
fn unpad(mut buf: Vec<u8>) -> Vec<u8> {
    if let Some(&pad) = buf.last() {
        let keep = buf.len().saturating_sub(pad as usize);
        buf.truncate(keep);
    }
    buf
}

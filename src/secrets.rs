use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

pub const SECRETS_KEY_ENV_VAR: &str = "TRADER_SECRETS_KEY";
const ENCRYPTION_PREFIX: &str = "enc:v1:";
const ENCRYPTION_IV_LENGTH: usize = 12;
const GCM_TAG_LENGTH: usize = 16;

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTION_PREFIX)
}

/// Plain values pass through; `enc:v1:<iv>:<ciphertext>:<tag>` values are
/// decrypted with the key from `TRADER_SECRETS_KEY`.
pub fn decrypt_setting_value(value: &str) -> Result<String> {
    if value.is_empty() || !is_encrypted(value) {
        return Ok(value.to_string());
    }
    let key = load_secrets_key()?;
    decrypt_with_key(value, &key)
}

pub fn encrypt_setting_value(value: &str) -> Result<String> {
    let key = load_secrets_key()?;
    encrypt_with_key(value, &key)
}

fn decrypt_with_key(value: &str, key: &[u8; 32]) -> Result<String> {
    let payload = value
        .strip_prefix(ENCRYPTION_PREFIX)
        .ok_or_else(|| anyhow!("Encrypted value has an invalid format."))?;
    let parts: Vec<&str> = payload.split(':').collect();
    if parts.len() != 3 {
        return Err(anyhow!("Encrypted value has an invalid format."));
    }

    let decode = |part: &str| {
        BASE64_STANDARD
            .decode(part)
            .map_err(|_| anyhow!("Encrypted value payload is invalid."))
    };
    let iv = decode(parts[0])?;
    let data = decode(parts[1])?;
    let tag = decode(parts[2])?;
    if iv.len() != ENCRYPTION_IV_LENGTH || tag.len() != GCM_TAG_LENGTH {
        return Err(anyhow!("Encrypted value payload is invalid."));
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("Failed to initialize cipher."))?;
    let mut sealed = data;
    sealed.extend_from_slice(&tag);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
        .map_err(|_| anyhow!("Failed to decrypt encrypted value."))?;

    String::from_utf8(plaintext).context("Decrypted value is not valid UTF-8.")
}

fn encrypt_with_key(value: &str, key: &[u8; 32]) -> Result<String> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("Failed to initialize cipher."))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, value.as_bytes())
        .map_err(|_| anyhow!("Failed to encrypt value."))?;
    let split_at = sealed
        .len()
        .checked_sub(GCM_TAG_LENGTH)
        .ok_or_else(|| anyhow!("Cipher output is shorter than the GCM tag."))?;
    let (ciphertext, tag) = sealed.split_at(split_at);

    Ok(format!(
        "{}{}:{}:{}",
        ENCRYPTION_PREFIX,
        BASE64_STANDARD.encode(nonce),
        BASE64_STANDARD.encode(ciphertext),
        BASE64_STANDARD.encode(tag)
    ))
}

fn load_secrets_key() -> Result<[u8; 32]> {
    let raw = std::env::var(SECRETS_KEY_ENV_VAR).unwrap_or_default();
    parse_key(raw.trim())
}

fn parse_key(raw: &str) -> Result<[u8; 32]> {
    if raw.is_empty() {
        return Err(anyhow!(
            "{} is required to encrypt and decrypt secrets. Generate one with \"openssl rand -hex 32\".",
            SECRETS_KEY_ENV_VAR
        ));
    }

    let decoded = if raw.len() == 64 && raw.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        hex::decode(raw).map_err(|_| invalid_key_error(0))?
    } else {
        BASE64_STANDARD.decode(raw).unwrap_or_default()
    };
    decoded
        .try_into()
        .map_err(|decoded: Vec<u8>| invalid_key_error(decoded.len()))
}

fn invalid_key_error(key_length: usize) -> anyhow::Error {
    anyhow!(
        "{} must be a 32-byte key encoded as 64 hex characters or base64. Key length {}",
        SECRETS_KEY_ENV_VAR,
        key_length
    )
}

// One-way hashing of `encrypted` fields

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Prefix marking a value as already hashed.
pub const HASH_PREFIX: &str = "sha256$";

const DIGEST_HEX_LEN: usize = 64;

/// Hash a value with the configured secret. Strings hash their contents,
/// every other value its JSON text.
pub fn hash_value(value: &Value, secret: &str) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{HASH_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Whether a value is already in stored (hashed) form.
pub fn is_hashed(value: &Value) -> bool {
    value
        .as_str()
        .and_then(|s| s.strip_prefix(HASH_PREFIX))
        .map(|digest| {
            digest.len() == DIGEST_HEX_LEN
                && digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        })
        .unwrap_or(false)
}

/// Hash a value unless it is null or already hashed.
pub fn protect(value: Value, secret: &str) -> Value {
    if value.is_null() || is_hashed(&value) {
        return value;
    }
    Value::String(hash_value(&value, secret))
}

/// Check a plaintext candidate against a stored hash.
pub fn verify(candidate: &Value, stored: &Value, secret: &str) -> bool {
    stored
        .as_str()
        .map(|s| hash_value(candidate, secret) == s)
        .unwrap_or(false)
}

//! HMAC bearer tokens.
//!
//! A token names a user and an expiry, signed with the server secret.
//! Format (hex encoded on the wire): `[8-byte expiry][8-byte user id][32-byte HMAC-SHA256]`

use crate::error::{SixinError, SixinResult};
use crate::messages::UserId;
use ring::hmac;

const TOKEN_DOMAIN: &[u8] = b"sixin-token-v1\0";
const TOKEN_LEN: usize = 8 + 8 + 32;

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn signed_data(expiry: u64, user_id: UserId) -> Vec<u8> {
    let mut data = Vec::with_capacity(TOKEN_DOMAIN.len() + 16);
    data.extend_from_slice(TOKEN_DOMAIN);
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(&user_id.to_be_bytes());
    data
}

/// Issue a bearer token for `user_id`, valid for `ttl_secs`.
pub fn issue_token(secret: &[u8], user_id: UserId, ttl_secs: u64) -> String {
    issue_token_at(secret, user_id, now_secs().saturating_add(ttl_secs))
}

fn issue_token_at(secret: &[u8], user_id: UserId, expiry: u64) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &signed_data(expiry, user_id));

    let mut token = Vec::with_capacity(TOKEN_LEN);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(&user_id.to_be_bytes());
    token.extend_from_slice(tag.as_ref());
    hex::encode(token)
}

/// Verify a bearer token and return the user it names.
///
/// Checks the encoding, the HMAC signature and the expiry time.
pub fn verify_token(secret: &[u8], token: &str) -> SixinResult<UserId> {
    let raw = hex::decode(token.trim())
        .map_err(|_| SixinError::Authentication("malformed token".into()))?;
    if raw.len() != TOKEN_LEN {
        return Err(SixinError::Authentication(format!(
            "invalid token length: expected {TOKEN_LEN}, got {}",
            raw.len()
        )));
    }

    let mut expiry_bytes = [0u8; 8];
    expiry_bytes.copy_from_slice(&raw[..8]);
    let expiry = u64::from_be_bytes(expiry_bytes);

    let mut user_bytes = [0u8; 8];
    user_bytes.copy_from_slice(&raw[8..16]);
    let user_id = u64::from_be_bytes(user_bytes);

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &signed_data(expiry, user_id), &raw[16..])
        .map_err(|_| SixinError::Authentication("invalid token signature".into()))?;

    if now_secs() > expiry {
        return Err(SixinError::Authentication("token expired".into()));
    }

    Ok(user_id)
}

/// Generate a random server secret (32 bytes).
pub fn generate_secret() -> Vec<u8> {
    use rand::RngCore;
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

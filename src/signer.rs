//! HMAC-SHA256 request signing and endpoint secret generation
//!
//! The signed input is the UTF-8 concatenation of the decimal unix timestamp,
//! a dot, and the exact request body bytes. Signatures render as `v1=<hex>`;
//! a header value may carry several comma-separated candidates and a verifier
//! accepts if any candidate matches.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Scheme tag prepended to every signature.
pub const SCHEME: &str = "v1";

/// Prefix carried by generated endpoint secrets.
pub const SECRET_PREFIX: &str = "whsec_";

/// Sign a payload with the given secret at the given unix timestamp.
pub fn sign(payload: &[u8], secret: &str, unix_ts: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(unix_ts.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("{}={}", SCHEME, hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature header value against the payload and timestamp.
///
/// The header may contain multiple comma-separated `v1=<hex>` candidates;
/// any single match accepts. Comparison is constant time.
pub fn verify(payload: &[u8], secret: &str, unix_ts: i64, header: &str) -> bool {
    header
        .split(',')
        .filter_map(|part| part.trim().strip_prefix("v1="))
        .any(|candidate| verify_one(payload, secret, unix_ts, candidate))
}

fn verify_one(payload: &[u8], secret: &str, unix_ts: i64, sig_hex: &str) -> bool {
    let sig_bytes = match hex::decode(sig_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(unix_ts.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    // verify_slice is constant time; never compare hex strings directly
    mac.verify_slice(&sig_bytes).is_ok()
}

/// Generate a fresh endpoint secret: `whsec_` + 64 lowercase hex chars.
pub fn generate_secret() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    format!("{}{}", SECRET_PREFIX, hex::encode(buf))
}

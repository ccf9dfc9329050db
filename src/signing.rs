use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

/// Header carrying the hex HMAC-SHA256 signature of the delivery body.
pub const SIGNATURE_HEADER: &str = "X-Signal-HMAC";

/// Compute the hex HMAC-SHA256 signature of a webhook payload.
///
/// The signature covers the exact bytes sent on the wire; subscribers must
/// verify against the body they received, not a re-serialization.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received payload against its hex signature.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// Generate a URL-safe random token: 32 bytes of CSPRNG output,
/// base64url-encoded without padding.
///
/// Used for challenge tokens and server-generated subscription secrets.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

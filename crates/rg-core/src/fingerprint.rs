//! Content fingerprints and the classification state hash.

use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 over the parts joined with `|`.
pub fn content_fingerprint(parts: &[&str]) -> String {
    sha256_hex(parts.join("|").as_bytes())
}

/// Identity of one classification decision. Unchanged inputs hash to the same
/// value; bumping the threshold version yields a fresh one.
pub fn state_hash(
    contact_identity: &str,
    property_fingerprint: &str,
    loan_fingerprint: &str,
    threshold_version_id: &str,
) -> String {
    content_fingerprint(&[
        contact_identity,
        property_fingerprint,
        loan_fingerprint,
        threshold_version_id,
    ])
}

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the digest.
const FINGERPRINT_LEN: usize = 16;

/// Compute the public routing fingerprint for a new workspace.
///
/// SHA-256 over title, user id, organization id and the creation time in
/// nanoseconds, hex-encoded and cut to 16 characters. Callers derive it once
/// at creation; it never changes afterwards.
pub fn compute_fingerprint(
    title: &str,
    user_id: u64,
    organization_id: u64,
    created_at: DateTime<Utc>,
) -> String {
    let nanos = created_at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| created_at.timestamp_micros().saturating_mul(1000));

    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(user_id.to_string().as_bytes());
    hasher.update(organization_id.to_string().as_bytes());
    hasher.update(nanos.to_string().as_bytes());
    let hash = hasher.finalize();
    let mut encoded = hex::encode(hash);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}

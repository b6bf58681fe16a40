//! Stable content fingerprints for detecting already-ingested files.

use crate::types::Fingerprint;

/// Compute a fingerprint over a file's raw bytes.
///
/// Uses blake3 over the bytes as read, before any decoding, so the same file
/// gets the same fingerprint whatever encoding it ends up decoded with.
pub fn compute(bytes: &[u8]) -> Fingerprint {
  let hash = blake3::hash(bytes);
  // First 16 bytes (32 hex chars): compact but collision-resistant.
  let hex = hash.to_hex();
  Fingerprint(hex[..32].to_string())
}

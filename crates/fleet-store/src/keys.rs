//! Key encoding utilities for `RocksDB`.
//!
//! Keys sort in numeric order, including negative IDs, which the expiry
//! index relies on for range scans.

use chrono::{DateTime, Utc};
use fleet_core::{ContextId, HostId};

/// Encode a host key.
#[must_use]
pub fn host_key(host_id: HostId) -> Vec<u8> {
    host_id.to_key_bytes().to_vec()
}

/// Encode a context key.
#[must_use]
pub fn context_key(context_id: ContextId) -> Vec<u8> {
    context_id.to_key_bytes().to_vec()
}

/// Encode an expiry index key: `expires_at_millis || context_id`.
#[must_use]
pub fn expiry_context_key(expires_at: DateTime<Utc>, context_id: ContextId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&expiry_prefix(expires_at));
    key.extend_from_slice(&context_id.to_key_bytes());
    key
}

/// Encode the timestamp part of an expiry index key.
///
/// Timestamps before the epoch clamp to zero.
#[must_use]
pub fn expiry_prefix(expires_at: DateTime<Utc>) -> [u8; 8] {
    let millis = u64::try_from(expires_at.timestamp_millis()).unwrap_or(0);
    millis.to_be_bytes()
}

/// Extract the context ID from an expiry index key.
///
/// Returns `None` if the key is malformed.
#[must_use]
pub fn extract_context_id_from_expiry_key(key: &[u8]) -> Option<ContextId> {
    let bytes: [u8; 8] = key.get(8..16)?.try_into().ok()?;
    Some(ContextId::from_key_bytes(bytes))
}

//! Deterministic hash bucketing for rollouts and weighted segment rules.
//!
//! Every SDK talking to the same control plane must assign identical users to
//! identical buckets, so the exact construction here — SHA-1 over
//! `"{key}.{salt}.{id}"`, first 15 hex digits, divided by `0xFFFFFFFFFFFFFFF`
//! — is part of the wire contract.

use sha1::{Digest, Sha1};

use crate::user::User;
use crate::Value;

// 15 F's, matching the 15 hex digits taken from the hash.
const BUCKET_SCALE: f64 = 0x0FFF_FFFF_FFFF_FFFF_u64 as f64;

/// Computes the user's bucket in `[0, 1)` for the given flag or segment key.
///
/// The bucketing identifier is the `bucket_by` attribute (default `"key"`):
/// strings are used as-is, integer numbers as their decimal rendering, and
/// anything else buckets to 0. A secondary key, when present, is appended to
/// the identifier.
pub(crate) fn bucket_user(user: &User, key: &str, bucket_by: Option<&str>, salt: &str) -> f64 {
    let mut id = match user.attribute(bucket_by.unwrap_or("key")) {
        Some(Value::Str(s)) => s,
        Some(ref v) if v.is_int() => v.as_int().expect("checked is_int").to_string(),
        _ => return 0.0,
    };
    if let Some(secondary) = user.secondary() {
        id.push('.');
        id.push_str(secondary);
    }

    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(b".");
    hasher.update(salt.as_bytes());
    hasher.update(b".");
    hasher.update(id.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let value = u64::from_str_radix(&digest[..15], 16).expect("15 hex digits parse as u64");
    value as f64 / BUCKET_SCALE
}

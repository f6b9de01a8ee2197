//! Rule fingerprints
//!
//! Two header rules are the same logical rule when their action and condition
//! serialize identically. The fingerprint is a 32-bit string hash of that
//! serialization; it only has to keep the handful of concurrently active rules
//! apart, not resist crafted collisions.

use crate::error::LinkdropError;
use linkdrop_types::{RuleAction, RuleCondition};
use serde::Serialize;

/// Dedup key of a header rule
pub type Fingerprint = i32;

#[derive(Serialize)]
struct RuleKey<'a> {
    action: &'a RuleAction,
    condition: &'a RuleCondition,
}

/// Fingerprint of an action/condition pair
pub fn fingerprint(
    action: &RuleAction,
    condition: &RuleCondition,
) -> Result<Fingerprint, LinkdropError> {
    let json = serde_json::to_string(&RuleKey { action, condition })?;
    Ok(string_hash(&json))
}

/// `h = 31 * h + unit` over UTF-16 code units, wrapping at 32 bits
pub fn string_hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

//! Token lifecycle engine: pure logic for issuing, classifying, and
//! consuming instance tokens under a lifetime policy. No I/O here — the
//! broker supplies the clock and persists the results.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::instance::InstanceRecord;

/// One-time tokens are short-lived in addition to being consumed on first
/// resolution.
const ONE_TIME_LIFETIME_MINUTES: i64 = 10;

/// How long a token stays valid. Parsed once at the boundary; no raw
/// `"30d"`-style strings travel further into the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LifetimePolicy {
    /// Valid for ten minutes and consumed by the first successful resolution.
    OneTime,
    /// Valid for N whole days from issuance.
    Days(u32),
    /// Never expires until renewed or revoked.
    Forever,
}

#[derive(Debug, Error)]
#[error("invalid lifetime policy '{0}' (expected 'once', 'forever', or e.g. '30d')")]
pub struct ParsePolicyError(String);

impl FromStr for LifetimePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "once" => Ok(Self::OneTime),
            "forever" => Ok(Self::Forever),
            other => {
                let days = other
                    .strip_suffix('d')
                    .and_then(|n| n.parse::<u32>().ok())
                    .filter(|n| *n > 0);
                match days {
                    Some(n) => Ok(Self::Days(n)),
                    None => Err(ParsePolicyError(other.to_string())),
                }
            }
        }
    }
}

impl fmt::Display for LifetimePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneTime => f.write_str("once"),
            Self::Days(n) => write!(f, "{}d", n),
            Self::Forever => f.write_str("forever"),
        }
    }
}

impl TryFrom<String> for LifetimePolicy {
    type Error = ParsePolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LifetimePolicy> for String {
    fn from(policy: LifetimePolicy) -> Self {
        policy.to_string()
    }
}

/// Mint an opaque bearer token: 128 bits from the OS RNG, hex-encoded with a
/// versioned prefix.
pub fn mint_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("erp_v1_{}", hex::encode(bytes))
}

/// Issue a fresh token under `policy`. Returns the token together with its
/// expiry, which is `None` exactly for `Forever`.
pub fn issue(policy: LifetimePolicy, now: DateTime<Utc>) -> (String, Option<DateTime<Utc>>) {
    let expires_at = match policy {
        LifetimePolicy::OneTime => Some(now + Duration::minutes(ONE_TIME_LIFETIME_MINUTES)),
        LifetimePolicy::Days(n) => Some(now + Duration::days(i64::from(n))),
        LifetimePolicy::Forever => None,
    };
    (mint_token(), expires_at)
}

/// Whether the record's token has passed its expiry. Forever never expires;
/// otherwise expiry is strict (`now > expires_at`).
pub fn is_expired(record: &InstanceRecord, now: DateTime<Utc>) -> bool {
    match record.policy {
        LifetimePolicy::Forever => false,
        _ => record.expires_at.is_some_and(|expires_at| now > expires_at),
    }
}

/// If the record carries a one-time token, clear it so the next use forces
/// re-issuance. Returns true when the record was mutated; the caller is
/// responsible for persisting the cleared state.
pub fn consume_if_one_time(record: &mut InstanceRecord) -> bool {
    if record.policy == LifetimePolicy::OneTime {
        record.token = None;
        record.expires_at = None;
        true
    } else {
        false
    }
}

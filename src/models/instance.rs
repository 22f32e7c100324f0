use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::lifecycle::LifetimePolicy;

/// Opaque credential material. Zeroed on drop and redacted in Debug output
/// so it can never reach logs through a formatted record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Deliberate accessor — call sites that need the raw value are explicit.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// One tenant's upstream ERP instance, as persisted in the record store.
///
/// At most one non-null `token` maps to a record at a time and a token value
/// identifies exactly one record (unique index). `expires_at` is null iff the
/// policy is Forever or no token has been issued yet.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub id: Uuid,
    pub name: String,
    pub endpoint: String,
    pub database: String,
    pub username: String,
    pub secret: Secret,
    pub token: Option<String>,
    pub policy: LifetimePolicy,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// The single record→credentials conversion. Everything downstream
    /// (cache snapshots, RPC execution) consumes this one value type.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            endpoint: self.endpoint.clone(),
            database: self.database.clone(),
            username: self.username.clone(),
            secret: self.secret.clone(),
        }
    }
}

/// Resolved connection credentials for an instance. Also the shape of the
/// cached snapshot: a time-bounded projection of the record, never
/// authoritative beyond the cache TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub endpoint: String,
    pub database: String,
    pub username: String,
    pub secret: Secret,
}

/// Input for registering a new instance. The token fields are absent by
/// construction — issuance is a separate step.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub name: String,
    pub endpoint: String,
    pub database: String,
    pub username: String,
    pub secret: Secret,
}

//! The broker resolves bearer tokens to instance credentials and owns the
//! administrative token flows (register, renew, revoke).
//!
//! It holds its store and cache behind trait objects supplied at
//! construction, so tests substitute in-memory fakes. There is no global
//! lock: the one accepted relaxation is that two concurrent resolutions of
//! the same one-time token may both be served once, while the store's
//! compare-and-swap guarantees at most one consumption is durably recorded.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::cache::CredentialCache;
use crate::errors::AppError;
use crate::lifecycle::{self, LifetimePolicy};
use crate::models::instance::{Credentials, NewInstance};
use crate::store::InstanceStore;

/// Fixed snapshot TTL. This is the bound on how long a revoked token can
/// still resolve through a stale cache entry.
pub const CREDENTIAL_TTL_SECS: u64 = 600;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(300);

/// Result of a revoke. `record_cleared` without `cache_invalidated` is the
/// warning-level partial success: the staleness window is widened up to the
/// cache TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevokeOutcome {
    pub record_cleared: bool,
    pub cache_invalidated: bool,
}

#[derive(Clone)]
pub struct Broker {
    store: Arc<dyn InstanceStore>,
    cache: Arc<dyn CredentialCache>,
    op_timeout: Duration,
}

fn token_prefix(token: &str) -> String {
    token.chars().take(10).collect()
}

impl Broker {
    pub fn new(store: Arc<dyn InstanceStore>, cache: Arc<dyn CredentialCache>) -> Self {
        Self {
            store,
            cache,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Bound a store call. An elapsed timeout is a dependency failure, never
    /// an authentication verdict.
    async fn bounded<T, F>(&self, dep: &'static str, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>> + Send,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(AppError::BackendUnavailable(format!("{} timed out", dep))),
        }
    }

    /// Resolve a bearer token to connection credentials.
    ///
    /// Fast path: a cache hit returns immediately without re-checking expiry
    /// or one-time consumption. Miss path: store lookup, expiry check,
    /// one-time consumption (persisted before returning), cache population.
    #[tracing::instrument(skip_all, fields(token = %token_prefix(token)))]
    pub async fn resolve(&self, token: &str) -> Result<Credentials, AppError> {
        if token.is_empty() {
            return Err(AppError::MissingToken);
        }

        match tokio::time::timeout(self.op_timeout, self.cache.get(token)).await {
            Ok(Some(creds)) => {
                tracing::debug!("cache hit");
                return Ok(creds);
            }
            Ok(None) => {}
            Err(_) => tracing::debug!("cache read timed out, treating as miss"),
        }

        match self.resolve_from_store(token).await {
            // A consumption CAS lost to a concurrent writer; re-resolve once.
            // If the racing resolution consumed the token we now see it as
            // cleared, which correctly reads as InvalidToken.
            Err(AppError::Conflict) => match self.resolve_from_store(token).await {
                Err(AppError::Conflict) => Err(AppError::InvalidToken),
                other => other,
            },
            other => other,
        }
    }

    async fn resolve_from_store(&self, token: &str) -> Result<Credentials, AppError> {
        let mut record = self
            .bounded("instance store", self.store.find_by_token(token))
            .await?
            .ok_or(AppError::InvalidToken)?;

        if lifecycle::is_expired(&record, Utc::now()) {
            // Expired tokens are never cached.
            return Err(AppError::TokenExpired);
        }

        // Snapshot pre-consumption: the caller gets credentials even when
        // this resolution clears the token.
        let creds = record.credentials();

        if lifecycle::consume_if_one_time(&mut record) {
            self.bounded(
                "instance store",
                self.store.save_token_state(&record, Some(token)),
            )
            .await?;
            // A consumed token must not be resolvable again, so it never
            // enters the cache.
            return Ok(creds);
        }

        self.cache_put(token, &creds).await;
        Ok(creds)
    }

    /// Best-effort cache population; a failing cache costs latency only.
    async fn cache_put(&self, token: &str, creds: &Credentials) {
        match tokio::time::timeout(
            self.op_timeout,
            self.cache.put(token, creds, CREDENTIAL_TTL_SECS),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("failed to cache credential snapshot: {}", e),
            Err(_) => tracing::warn!("credential cache write timed out"),
        }
    }

    /// Best-effort invalidation. Returns whether an entry existed; failures
    /// widen the staleness window up to the TTL and are logged at warn.
    async fn cache_invalidate(&self, token: &str) -> bool {
        match tokio::time::timeout(self.op_timeout, self.cache.invalidate(token)).await {
            Ok(Ok(existed)) => existed,
            Ok(Err(e)) => {
                tracing::warn!(
                    "cache invalidation failed, entry may stay live up to {}s: {}",
                    CREDENTIAL_TTL_SECS,
                    e
                );
                false
            }
            Err(_) => {
                tracing::warn!(
                    "cache invalidation timed out, entry may stay live up to {}s",
                    CREDENTIAL_TTL_SECS
                );
                false
            }
        }
    }

    /// Register a new instance and issue its first token.
    pub async fn register(
        &self,
        new: NewInstance,
        policy: LifetimePolicy,
    ) -> Result<String, AppError> {
        let name = new.name.clone();
        let mut record = self.bounded("instance store", self.store.create(new)).await?;

        let (token, expires_at) = lifecycle::issue(policy, Utc::now());
        record.policy = policy;
        record.token = Some(token.clone());
        record.expires_at = expires_at;

        // The record was just created with no token, so the expected state
        // for the CAS is None.
        self.bounded(
            "instance store",
            self.store.save_token_state(&record, None),
        )
        .await?;

        tracing::info!(instance = %name, %policy, "registered instance and issued token");
        Ok(token)
    }

    /// Re-issue a token for an existing instance, superseding and
    /// invalidating the previous one. Accepts the instance name or the
    /// current token as the handle. Concurrent renews are last-write-wins;
    /// the losing CAS surfaces as Conflict to the admin caller.
    pub async fn renew(
        &self,
        name_or_token: &str,
        policy: LifetimePolicy,
    ) -> Result<String, AppError> {
        let record = self
            .bounded("instance store", self.store.find_by_name(name_or_token))
            .await?;
        let mut record = match record {
            Some(r) => r,
            None => self
                .bounded("instance store", self.store.find_by_token(name_or_token))
                .await?
                .ok_or(AppError::NotFound)?,
        };

        let old_token = record.token.clone();
        let (token, expires_at) = lifecycle::issue(policy, Utc::now());
        record.policy = policy;
        record.token = Some(token.clone());
        record.expires_at = expires_at;

        self.bounded(
            "instance store",
            self.store.save_token_state(&record, old_token.as_deref()),
        )
        .await?;

        if let Some(old) = old_token {
            self.cache_invalidate(&old).await;
        }

        tracing::info!(instance = %record.name, %policy, "renewed token");
        Ok(token)
    }

    /// Revoke a token: clear it on the owning record and drop the cached
    /// snapshot. Succeeds if the token was known to either the store or the
    /// cache; NotFound only when absent from both.
    pub async fn revoke(&self, token: &str) -> Result<RevokeOutcome, AppError> {
        let record = self
            .bounded("instance store", self.store.find_by_token(token))
            .await?;

        let record_cleared = match record {
            Some(mut r) => {
                r.token = None;
                r.expires_at = None;
                self.bounded(
                    "instance store",
                    self.store.save_token_state(&r, Some(token)),
                )
                .await?;
                tracing::info!(instance = %r.name, "revoked token");
                true
            }
            None => false,
        };

        let cache_invalidated = self.cache_invalidate(token).await;

        if !record_cleared && !cache_invalidated {
            return Err(AppError::NotFound);
        }
        Ok(RevokeOutcome {
            record_cleared,
            cache_invalidated,
        })
    }
}

//! Broker integration tests against the in-memory store and cache,
//! exercising the full resolve state machine, the administrative flows, and
//! the accepted concurrency relaxations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use erplink::broker::Broker;
use erplink::cache::{CredentialCache, MemoryCache};
use erplink::errors::AppError;
use erplink::lifecycle::LifetimePolicy;
use erplink::models::instance::{Credentials, InstanceRecord, NewInstance, Secret};
use erplink::store::{InstanceStore, MemoryStore};

// ── Fixtures ──────────────────────────────────────────────────

fn new_instance(name: &str) -> NewInstance {
    NewInstance {
        name: name.to_string(),
        endpoint: format!("https://{}.erp.test", name),
        database: format!("{}_db", name),
        username: "svc".to_string(),
        secret: Secret::new(format!("{}-secret", name)),
    }
}

fn broker_with(store: Arc<dyn InstanceStore>, cache: Arc<dyn CredentialCache>) -> Broker {
    Broker::new(store, cache)
}

/// Rewind a stored record's expiry so it reads as already past, simulating
/// the passage of wall-clock time without a clock abstraction.
fn expire_stored_token(store: &MemoryStore, name: &str) {
    let mut record = store.get_by_name(name).expect("record exists");
    record.expires_at = Some(Utc::now() - ChronoDuration::days(1));
    store.put_record(record);
}

// ── Test doubles ──────────────────────────────────────────────

/// Always-miss cache: proves resolution outcomes do not depend on caching.
struct NullCache;

#[async_trait]
impl CredentialCache for NullCache {
    async fn get(&self, _token: &str) -> Option<Credentials> {
        None
    }
    async fn put(&self, _token: &str, _creds: &Credentials, _ttl: u64) -> anyhow::Result<()> {
        Ok(())
    }
    async fn invalidate(&self, _token: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Cache whose writes and invalidations always error.
struct FailingCache;

#[async_trait]
impl CredentialCache for FailingCache {
    async fn get(&self, _token: &str) -> Option<Credentials> {
        None
    }
    async fn put(&self, _token: &str, _creds: &Credentials, _ttl: u64) -> anyhow::Result<()> {
        anyhow::bail!("cache write refused")
    }
    async fn invalidate(&self, _token: &str) -> anyhow::Result<bool> {
        anyhow::bail!("cache unreachable")
    }
}

/// Store that is down across the board.
struct FailingStore;

#[async_trait]
impl InstanceStore for FailingStore {
    async fn find_by_token(&self, _token: &str) -> Result<Option<InstanceRecord>, AppError> {
        Err(AppError::BackendUnavailable("instance store: down".into()))
    }
    async fn find_by_name(&self, _name: &str) -> Result<Option<InstanceRecord>, AppError> {
        Err(AppError::BackendUnavailable("instance store: down".into()))
    }
    async fn create(&self, _new: NewInstance) -> Result<InstanceRecord, AppError> {
        Err(AppError::BackendUnavailable("instance store: down".into()))
    }
    async fn save_token_state(
        &self,
        _record: &InstanceRecord,
        _expected_token: Option<&str>,
    ) -> Result<(), AppError> {
        Err(AppError::BackendUnavailable("instance store: down".into()))
    }
    async fn list(&self) -> Result<Vec<InstanceRecord>, AppError> {
        Err(AppError::BackendUnavailable("instance store: down".into()))
    }
}

/// Store whose reads hang long enough to trip the broker's bounded timeout.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl InstanceStore for SlowStore {
    async fn find_by_token(&self, token: &str) -> Result<Option<InstanceRecord>, AppError> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_by_token(token).await
    }
    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, AppError> {
        self.inner.find_by_name(name).await
    }
    async fn create(&self, new: NewInstance) -> Result<InstanceRecord, AppError> {
        self.inner.create(new).await
    }
    async fn save_token_state(
        &self,
        record: &InstanceRecord,
        expected_token: Option<&str>,
    ) -> Result<(), AppError> {
        self.inner.save_token_state(record, expected_token).await
    }
    async fn list(&self) -> Result<Vec<InstanceRecord>, AppError> {
        self.inner.list().await
    }
}

/// Store whose first save loses the optimistic check, as if a concurrent
/// writer had just committed.
struct ConflictOnceStore {
    inner: MemoryStore,
    fired: AtomicBool,
}

#[async_trait]
impl InstanceStore for ConflictOnceStore {
    async fn find_by_token(&self, token: &str) -> Result<Option<InstanceRecord>, AppError> {
        self.inner.find_by_token(token).await
    }
    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, AppError> {
        self.inner.find_by_name(name).await
    }
    async fn create(&self, new: NewInstance) -> Result<InstanceRecord, AppError> {
        self.inner.create(new).await
    }
    async fn save_token_state(
        &self,
        record: &InstanceRecord,
        expected_token: Option<&str>,
    ) -> Result<(), AppError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            return Err(AppError::Conflict);
        }
        self.inner.save_token_state(record, expected_token).await
    }
    async fn list(&self) -> Result<Vec<InstanceRecord>, AppError> {
        self.inner.list().await
    }
}

// ── Resolution ────────────────────────────────────────────────

mod resolve_tests {
    use super::*;

    #[tokio::test]
    async fn resolve_returns_the_registered_credentials() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker_with(store.clone(), Arc::new(MemoryCache::new()));

        let token = broker
            .register(new_instance("acme"), LifetimePolicy::Forever)
            .await
            .unwrap();

        let creds = broker.resolve(&token).await.unwrap();
        assert_eq!(creds.endpoint, "https://acme.erp.test");
        assert_eq!(creds.database, "acme_db");
        assert_eq!(creds.username, "svc");
        assert_eq!(creds.secret, Secret::new("acme-secret"));
    }

    #[tokio::test]
    async fn empty_token_is_missing_token() {
        let broker = broker_with(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()));
        let err = broker.resolve("").await.unwrap_err();
        assert!(matches!(err, AppError::MissingToken));
    }

    #[tokio::test]
    async fn unknown_token_is_invalid_token() {
        let broker = broker_with(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()));
        let err = broker.resolve("erp_v1_0000").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidToken));
    }

    #[tokio::test]
    async fn expired_days_token_fails_and_is_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let broker = broker_with(store.clone(), cache.clone());

        let token = broker
            .register(new_instance("acme"), LifetimePolicy::Days(30))
            .await
            .unwrap();
        broker.resolve(&token).await.unwrap();

        expire_stored_token(&store, "acme");
        // Drop the snapshot as if its TTL had lapsed along with the 30 days.
        cache.invalidate(&token).await.unwrap();

        let err = broker.resolve(&token).await.unwrap_err();
        assert!(matches!(err, AppError::TokenExpired));
        // An expired token never repopulates the cache.
        assert!(cache.get(&token).await.is_none());
    }

    #[tokio::test]
    async fn one_time_token_resolves_exactly_once_sequentially() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker_with(store.clone(), Arc::new(MemoryCache::new()));

        let token = broker
            .register(new_instance("acme"), LifetimePolicy::OneTime)
            .await
            .unwrap();

        broker.resolve(&token).await.unwrap();
        let err = broker.resolve(&token).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidToken));

        // The consumption was persisted, not just observed in memory.
        assert!(store.find_by_token(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_one_time_token_expires_before_consumption() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker_with(store.clone(), Arc::new(MemoryCache::new()));

        let token = broker
            .register(new_instance("acme"), LifetimePolicy::OneTime)
            .await
            .unwrap();
        expire_stored_token(&store, "acme");

        let err = broker.resolve(&token).await.unwrap_err();
        assert!(matches!(err, AppError::TokenExpired));
        // Expiry does not consume: the token is still on the record.
        assert!(store.find_by_token(&token).await.unwrap().is_some());
    }
}

// ── Administrative flows ──────────────────────────────────────

mod admin_tests {
    use super::*;

    #[tokio::test]
    async fn register_rejects_duplicate_names() {
        let broker = broker_with(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()));

        broker
            .register(new_instance("acme"), LifetimePolicy::Forever)
            .await
            .unwrap();
        let err = broker
            .register(new_instance("acme"), LifetimePolicy::Forever)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists(name) if name == "acme"));
    }

    #[tokio::test]
    async fn renew_supersedes_and_invalidates_the_old_token() {
        let cache = Arc::new(MemoryCache::new());
        let broker = broker_with(Arc::new(MemoryStore::new()), cache.clone());

        let t1 = broker
            .register(new_instance("acme"), LifetimePolicy::Forever)
            .await
            .unwrap();
        broker.resolve(&t1).await.unwrap();
        assert!(cache.get(&t1).await.is_some());

        let t2 = broker.renew("acme", LifetimePolicy::Days(30)).await.unwrap();
        assert_ne!(t1, t2);

        // The superseded token is gone from cache and store alike.
        assert!(cache.get(&t1).await.is_none());
        assert!(matches!(
            broker.resolve(&t1).await.unwrap_err(),
            AppError::InvalidToken
        ));
        broker.resolve(&t2).await.unwrap();
    }

    #[tokio::test]
    async fn renew_accepts_the_current_token_as_handle() {
        let broker = broker_with(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()));

        let t1 = broker
            .register(new_instance("acme"), LifetimePolicy::Forever)
            .await
            .unwrap();
        let t2 = broker.renew(&t1, LifetimePolicy::Forever).await.unwrap();
        broker.resolve(&t2).await.unwrap();
    }

    #[tokio::test]
    async fn renew_of_unknown_instance_is_not_found() {
        let broker = broker_with(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()));
        let err = broker
            .renew("ghost", LifetimePolicy::Forever)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn revoke_clears_the_record_and_the_cache() {
        let cache = Arc::new(MemoryCache::new());
        let broker = broker_with(Arc::new(MemoryStore::new()), cache.clone());

        let token = broker
            .register(new_instance("acme"), LifetimePolicy::Forever)
            .await
            .unwrap();
        broker.resolve(&token).await.unwrap();

        let outcome = broker.revoke(&token).await.unwrap();
        assert!(outcome.record_cleared);
        assert!(outcome.cache_invalidated);

        let err = broker.resolve(&token).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidToken));
    }

    #[tokio::test]
    async fn revoke_is_idempotent_via_not_found() {
        let broker = broker_with(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()));

        let token = broker
            .register(new_instance("acme"), LifetimePolicy::Forever)
            .await
            .unwrap();
        broker.revoke(&token).await.unwrap();

        // Second revoke, and revoke of a token that never existed.
        assert!(matches!(
            broker.revoke(&token).await.unwrap_err(),
            AppError::NotFound
        ));
        assert!(matches!(
            broker.revoke("erp_v1_0000").await.unwrap_err(),
            AppError::NotFound
        ));
    }

    #[tokio::test]
    async fn revoke_of_a_cache_only_token_is_partial_success() {
        let cache = Arc::new(MemoryCache::new());
        let broker = broker_with(Arc::new(MemoryStore::new()), cache.clone());

        // Entry in cache but no backing record, e.g. renewed elsewhere while
        // the snapshot is still live.
        let creds = Credentials {
            endpoint: "https://orphan.erp.test".into(),
            database: "orphan_db".into(),
            username: "svc".into(),
            secret: Secret::new("pw"),
        };
        cache.put("erp_v1_orphan", &creds, 600).await.unwrap();

        let outcome = broker.revoke("erp_v1_orphan").await.unwrap();
        assert!(!outcome.record_cleared);
        assert!(outcome.cache_invalidated);
    }
}

// ── Failure handling ──────────────────────────────────────────

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn store_failure_is_backend_unavailable_not_invalid_token() {
        let broker = broker_with(Arc::new(FailingStore), Arc::new(MemoryCache::new()));
        let err = broker.resolve("erp_v1_any").await.unwrap_err();
        assert!(matches!(err, AppError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn slow_store_trips_the_bounded_timeout() {
        let inner = MemoryStore::new();
        let store = Arc::new(SlowStore {
            inner,
            delay: Duration::from_millis(500),
        });
        let broker = Broker::new(store, Arc::new(MemoryCache::new()))
            .with_op_timeout(Duration::from_millis(50));

        let err = broker.resolve("erp_v1_any").await.unwrap_err();
        assert!(matches!(err, AppError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn cache_failures_never_fail_resolution() {
        let broker = broker_with(Arc::new(MemoryStore::new()), Arc::new(FailingCache));

        let token = broker
            .register(new_instance("acme"), LifetimePolicy::Forever)
            .await
            .unwrap();

        // Every resolve takes the store path; the failing cache only costs
        // latency, never correctness.
        broker.resolve(&token).await.unwrap();
        broker.resolve(&token).await.unwrap();
    }

    #[tokio::test]
    async fn revoke_with_unreachable_cache_is_partial_success() {
        let broker = broker_with(Arc::new(MemoryStore::new()), Arc::new(FailingCache));

        let token = broker
            .register(new_instance("acme"), LifetimePolicy::Forever)
            .await
            .unwrap();

        let outcome = broker.revoke(&token).await.unwrap();
        assert!(outcome.record_cleared);
        assert!(!outcome.cache_invalidated);
    }

    #[tokio::test]
    async fn a_lost_consumption_race_is_retried_once() {
        // Disarmed during registration so its own save goes through.
        let store = Arc::new(ConflictOnceStore {
            inner: MemoryStore::new(),
            fired: AtomicBool::new(true),
        });
        let broker = broker_with(store.clone(), Arc::new(MemoryCache::new()));

        let token = broker
            .register(new_instance("acme"), LifetimePolicy::OneTime)
            .await
            .unwrap();

        // Arm: the consumption save loses its optimistic check once, then
        // the broker re-resolves and the second attempt commits.
        store.fired.store(false, Ordering::SeqCst);
        broker.resolve(&token).await.unwrap();
        assert!(store.find_by_token(&token).await.unwrap().is_none());
    }
}

// ── Concurrency ───────────────────────────────────────────────

mod concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_one_time_resolutions_leave_the_token_cleared() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker_with(store.clone(), Arc::new(MemoryCache::new()));

        let token = broker
            .register(new_instance("acme"), LifetimePolicy::OneTime)
            .await
            .unwrap();

        let (a, b) = tokio::join!(broker.resolve(&token), broker.resolve(&token));

        // At-most-approximately-once: at least one caller is served, and no
        // caller sees anything other than credentials or InvalidToken.
        let outcomes = [a, b];
        assert!(outcomes.iter().any(|r| r.is_ok()));
        for outcome in &outcomes {
            if let Err(e) = outcome {
                assert!(matches!(e, AppError::InvalidToken));
            }
        }

        // Exactly one consumption was durably recorded.
        assert!(store.find_by_token(&token).await.unwrap().is_none());
        assert!(matches!(
            broker.resolve(&token).await.unwrap_err(),
            AppError::InvalidToken
        ));
    }

    #[tokio::test]
    async fn concurrent_renews_are_last_write_wins() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker_with(store.clone(), Arc::new(MemoryCache::new()));

        broker
            .register(new_instance("acme"), LifetimePolicy::Forever)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            broker.renew("acme", LifetimePolicy::Days(30)),
            broker.renew("acme", LifetimePolicy::Days(60))
        );

        // Whoever committed last holds the live token; the loser saw the CAS
        // conflict. Under this interleaving at least one renew must land.
        let winners: Vec<String> = [a, b].into_iter().filter_map(Result::ok).collect();
        assert!(!winners.is_empty());

        let live = store.get_by_name("acme").unwrap().token.unwrap();
        assert!(winners.contains(&live));
        broker.resolve(&live).await.unwrap();
    }
}

// ── Cache transparency & the end-to-end scenario ──────────────

mod scenario_tests {
    use super::*;

    /// Outcomes must be identical with and without a functioning cache; only
    /// latency may differ.
    #[tokio::test]
    async fn disabling_the_cache_changes_no_outcomes() {
        for cache in [
            Arc::new(MemoryCache::new()) as Arc<dyn CredentialCache>,
            Arc::new(NullCache) as Arc<dyn CredentialCache>,
        ] {
            let broker = broker_with(Arc::new(MemoryStore::new()), cache);

            let token = broker
                .register(new_instance("acme"), LifetimePolicy::Forever)
                .await
                .unwrap();
            broker.resolve(&token).await.unwrap();
            broker.resolve(&token).await.unwrap();

            broker.revoke(&token).await.unwrap();
            assert!(matches!(
                broker.resolve(&token).await.unwrap_err(),
                AppError::InvalidToken
            ));
            assert!(matches!(
                broker.resolve("erp_v1_unknown").await.unwrap_err(),
                AppError::InvalidToken
            ));
        }
    }

    #[tokio::test]
    async fn acme_register_renew_expire_scenario() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let broker = broker_with(store.clone(), cache.clone());

        // Register with Forever: no expiry, resolves repeatedly.
        let t1 = broker
            .register(new_instance("acme"), LifetimePolicy::Forever)
            .await
            .unwrap();
        assert!(store.get_by_name("acme").unwrap().expires_at.is_none());
        for _ in 0..3 {
            broker.resolve(&t1).await.unwrap();
        }

        // Renew under Days(30): old token dies, new one works.
        let t2 = broker.renew("acme", LifetimePolicy::Days(30)).await.unwrap();
        assert!(matches!(
            broker.resolve(&t1).await.unwrap_err(),
            AppError::InvalidToken
        ));
        broker.resolve(&t2).await.unwrap();

        // 31 days later the snapshot TTL has long lapsed and the token has
        // passed its expiry.
        expire_stored_token(&store, "acme");
        cache.invalidate(&t2).await.unwrap();
        assert!(matches!(
            broker.resolve(&t2).await.unwrap_err(),
            AppError::TokenExpired
        ));
    }
}

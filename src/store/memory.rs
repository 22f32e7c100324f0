use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::instance::{InstanceRecord, NewInstance};
use crate::store::InstanceStore;

/// In-memory store with the same optimistic-write contract as Postgres.
/// Used by the test suite; has no durability.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<DashMap<Uuid, InstanceRecord>>,
    // Serializes name-uniqueness checks against inserts.
    create_lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: fetch a record by name for direct mutation of stored state
    /// (e.g. simulating the passage of time against `expires_at`).
    pub fn get_by_name(&self, name: &str) -> Option<InstanceRecord> {
        self.records
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.clone())
    }

    /// Test hook: overwrite a stored record unconditionally.
    pub fn put_record(&self, record: InstanceRecord) {
        self.records.insert(record.id, record);
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn find_by_token(&self, token: &str) -> Result<Option<InstanceRecord>, AppError> {
        Ok(self
            .records
            .iter()
            .find(|r| r.token.as_deref() == Some(token))
            .map(|r| r.clone()))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, AppError> {
        Ok(self.get_by_name(name))
    }

    async fn create(&self, new: NewInstance) -> Result<InstanceRecord, AppError> {
        let _guard = self.create_lock.lock().unwrap();
        if self.records.iter().any(|r| r.name == new.name) {
            return Err(AppError::AlreadyExists(new.name));
        }
        let record = InstanceRecord {
            id: Uuid::new_v4(),
            name: new.name,
            endpoint: new.endpoint,
            database: new.database,
            username: new.username,
            secret: new.secret,
            token: None,
            policy: crate::lifecycle::LifetimePolicy::Forever,
            expires_at: None,
            created_at: Utc::now(),
        };
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn save_token_state(
        &self,
        record: &InstanceRecord,
        expected_token: Option<&str>,
    ) -> Result<(), AppError> {
        // get_mut holds the shard lock, making compare-and-swap atomic.
        let mut stored = self.records.get_mut(&record.id).ok_or(AppError::NotFound)?;
        if stored.token.as_deref() != expected_token {
            return Err(AppError::Conflict);
        }
        stored.token = record.token.clone();
        stored.policy = record.policy;
        stored.expires_at = record.expires_at;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>, AppError> {
        let mut all: Vec<InstanceRecord> = self.records.iter().map(|r| r.clone()).collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }
}

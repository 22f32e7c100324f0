//! Instance record store: the durable source of truth for tenant
//! credentials and token state. The broker consumes the trait; production
//! wiring uses Postgres, tests use the in-memory implementation.

use async_trait::async_trait;

use crate::errors::AppError;
use crate::models::instance::{InstanceRecord, NewInstance};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn find_by_token(&self, token: &str) -> Result<Option<InstanceRecord>, AppError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, AppError>;

    /// Create a record with credentials and no token. Fails with
    /// `AlreadyExists` on a name collision.
    async fn create(&self, new: NewInstance) -> Result<InstanceRecord, AppError>;

    /// Persist the record's token fields (`token`, `policy`, `expires_at`)
    /// with an optimistic check: the write only lands if the stored token
    /// still equals `expected_token`. A concurrent writer winning the race
    /// surfaces as `Conflict`.
    async fn save_token_state(
        &self,
        record: &InstanceRecord,
        expected_token: Option<&str>,
    ) -> Result<(), AppError>;

    async fn list(&self) -> Result<Vec<InstanceRecord>, AppError>;
}

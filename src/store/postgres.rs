use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::instance::{InstanceRecord, NewInstance, Secret};
use crate::store::InstanceStore;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

const SELECT_COLUMNS: &str =
    "id, name, endpoint, db_name, username, secret, token, token_policy, expires_at, created_at";

/// Store failures are dependency failures from the broker's point of view.
/// They must never be mistaken for an unknown token.
fn store_err(e: sqlx::Error) -> AppError {
    AppError::BackendUnavailable(format!("instance store: {}", e))
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    name: String,
    endpoint: String,
    db_name: String,
    username: String,
    secret: String,
    token: Option<String>,
    token_policy: String,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = AppError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        let policy = row
            .token_policy
            .parse()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt policy column: {}", e)))?;
        Ok(InstanceRecord {
            id: row.id,
            name: row.name,
            endpoint: row.endpoint,
            database: row.db_name,
            username: row.username,
            secret: Secret::new(row.secret),
            token: row.token,
            policy,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn find_by_token(&self, token: &str) -> Result<Option<InstanceRecord>, AppError> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM instances WHERE token = $1",
            SELECT_COLUMNS
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(InstanceRecord::try_from).transpose()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, AppError> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM instances WHERE name = $1",
            SELECT_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(InstanceRecord::try_from).transpose()
    }

    async fn create(&self, new: NewInstance) -> Result<InstanceRecord, AppError> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"INSERT INTO instances (name, endpoint, db_name, username, secret)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING {}"#,
            SELECT_COLUMNS
        ))
        .bind(&new.name)
        .bind(&new.endpoint)
        .bind(&new.database)
        .bind(&new.username)
        .bind(new.secret.expose())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.constraint() == Some("instances_name_key") => {
                AppError::AlreadyExists(new.name.clone())
            }
            _ => store_err(e),
        })?;

        row.try_into()
    }

    async fn save_token_state(
        &self,
        record: &InstanceRecord,
        expected_token: Option<&str>,
    ) -> Result<(), AppError> {
        // Compare-and-swap on the token column: the write lands only if no
        // concurrent writer changed the token since this record was read.
        let result = sqlx::query(
            r#"UPDATE instances
               SET token = $1, token_policy = $2, expires_at = $3
               WHERE id = $4 AND token IS NOT DISTINCT FROM $5"#,
        )
        .bind(&record.token)
        .bind(record.policy.to_string())
        .bind(record.expires_at)
        .bind(record.id)
        .bind(expected_token)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            // A colliding fresh token loses the same way a CAS miss does.
            sqlx::Error::Database(db) if db.constraint() == Some("instances_token_key") => {
                AppError::Conflict
            }
            _ => store_err(e),
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>, AppError> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM instances ORDER BY created_at ASC",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter().map(InstanceRecord::try_from).collect()
    }
}

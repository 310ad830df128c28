//! Upsert contract between the pipeline and the relational store.

use async_trait::async_trait;
use ecomon_core::UpsertPlan;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

use crate::config::DatabaseConfig;

#[derive(Debug, Error)]
pub enum PersistError {
    /// The store refused this record's values (type mismatch, constraint).
    #[error("row rejected by {table}: {message}")]
    RowRejected { table: &'static str, message: String },

    /// Connection, pool or transaction failure unrelated to the row.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl PersistError {
    pub fn is_row_rejection(&self) -> bool {
        matches!(self, Self::RowRejected { .. })
    }

    fn from_write(table: &'static str, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => Self::RowRejected {
                table,
                message: db_err.message().to_owned(),
            },
            sqlx::Error::Encode(encode_err) => Self::RowRejected {
                table,
                message: encode_err.to_string(),
            },
            other => Self::Database(other),
        }
    }
}

/// A store that hands out one transactional session per dataset.
#[async_trait]
pub trait PersistenceEndpoint: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn PersistenceSession>, PersistError>;
}

/// Connection-scoped write session. Dropping it without `commit` discards
/// everything written through it.
#[async_trait]
pub trait PersistenceSession: Send {
    /// Apply one upsert. After a rejection the session must only be rolled
    /// back.
    async fn execute(&mut self, plan: &UpsertPlan) -> Result<(), PersistError>;

    /// Apply one upsert such that a rejection undoes only this record and the
    /// session stays usable.
    async fn execute_isolated(&mut self, plan: &UpsertPlan) -> Result<(), PersistError>;

    async fn commit(self: Box<Self>) -> Result<(), PersistError>;

    async fn rollback(self: Box<Self>) -> Result<(), PersistError>;
}

#[derive(Debug, Clone)]
pub struct PgEndpoint {
    pool: PgPool,
}

impl PgEndpoint {
    /// Builds the pool without connecting; the first `begin` opens the
    /// connection. A single connection is enough for the sequential writer.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self, PersistError> {
        let options = config.connect_options().map_err(PersistError::Database)?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(options);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PersistError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl PersistenceEndpoint for PgEndpoint {
    async fn begin(&self) -> Result<Box<dyn PersistenceSession>, PersistError> {
        let tx = self.pool.begin().await.map_err(PersistError::Database)?;
        Ok(Box::new(PgSession { tx }))
    }
}

pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

const ROW_SAVEPOINT: &str = "ecomon_row";

impl PgSession {
    async fn run(&mut self, sql: &str) -> Result<(), PersistError> {
        sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map_err(PersistError::Database)?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceSession for PgSession {
    async fn execute(&mut self, plan: &UpsertPlan) -> Result<(), PersistError> {
        let table = plan.table();
        let sql = table.upsert_statement();
        // Every parameter is TEXT; the statement's CASTs do the coercion, so
        // the prepared statement cached for this SQL fits every row.
        let query = plan
            .values
            .iter()
            .fold(sqlx::query(&sql), |query, value| query.bind(value.to_sql_text()));
        query
            .execute(&mut *self.tx)
            .await
            .map_err(|err| PersistError::from_write(table.table, err))?;
        Ok(())
    }

    async fn execute_isolated(&mut self, plan: &UpsertPlan) -> Result<(), PersistError> {
        self.run(&format!("SAVEPOINT {ROW_SAVEPOINT}")).await?;
        match self.execute(plan).await {
            Ok(()) => self.run(&format!("RELEASE SAVEPOINT {ROW_SAVEPOINT}")).await,
            Err(err) => {
                self.run(&format!("ROLLBACK TO SAVEPOINT {ROW_SAVEPOINT}"))
                    .await?;
                Err(err)
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistError> {
        self.tx.commit().await.map_err(PersistError::Database)
    }

    async fn rollback(self: Box<Self>) -> Result<(), PersistError> {
        self.tx.rollback().await.map_err(PersistError::Database)
    }
}

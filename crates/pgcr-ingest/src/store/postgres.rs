//! PostgreSQL sink

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres};
use tracing::{info, warn};

use super::{CommitError, TransactionSink};
use crate::config::DatasourceConfig;
use crate::record::PersistRequest;

const INSERT_PGCR: &str = "INSERT INTO raid_pgcr (instance_id, blob) VALUES ($1, $2)";

/// A pooled connection inside an explicit `BEGIN` block.
///
/// Unlike `sqlx::Transaction`, a failed `COMMIT` leaves the handle with the
/// caller so the rollback can be issued on the same connection.
#[derive(Debug)]
pub struct PgTransaction {
    conn: Option<PoolConnection<Postgres>>,
}

impl PgTransaction {
    fn connection(&mut self) -> Result<&mut PoolConnection<Postgres>, sqlx::Error> {
        self.conn
            .as_mut()
            .ok_or_else(|| sqlx::Error::Protocol("transaction already finished".into()))
    }

    async fn execute(&mut self, statement: &str) -> Result<(), sqlx::Error> {
        sqlx::query(statement).execute(&mut **self.connection()?).await?;
        Ok(())
    }

    /// Hand the connection back to the pool.
    fn release(mut self) {
        drop(self.conn.take());
    }

    /// Close the connection instead of pooling it.
    fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        // Still inside BEGIN: never return it to the pool.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

/// Writes PGCR blobs into the `raid_pgcr` table.
#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool for `datasource`.
    pub async fn connect(datasource: &DatasourceConfig) -> Result<Self, sqlx::Error> {
        let options = PgConnectOptions::new()
            .host(&datasource.host)
            .port(datasource.port)
            .username(&datasource.user)
            .password(&datasource.password)
            .database(&datasource.database);

        info!(
            host = %datasource.host,
            port = datasource.port,
            database = %datasource.database,
            max_connections = datasource.max_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(datasource.max_connections)
            .connect_with(options)
            .await?;

        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations");
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionSink for PgSink {
    type Transaction = PgTransaction;

    async fn begin(&self) -> Result<Self::Transaction, sqlx::Error> {
        let mut tx = PgTransaction {
            conn: Some(self.pool.acquire().await?),
        };
        tx.execute("BEGIN").await?;
        Ok(tx)
    }

    async fn insert(
        &self,
        tx: &mut Self::Transaction,
        request: &PersistRequest,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(INSERT_PGCR)
            .bind(request.instance_id)
            .bind(&request.payload)
            .execute(&mut **tx.connection()?)
            .await?;
        Ok(())
    }

    async fn commit(
        &self,
        mut tx: Self::Transaction,
    ) -> Result<(), CommitError<Self::Transaction>> {
        match tx.execute("COMMIT").await {
            Ok(()) => {
                tx.release();
                Ok(())
            }
            Err(source) => Err(CommitError::new(Some(tx), source)),
        }
    }

    async fn rollback(&self, mut tx: Self::Transaction) -> Result<(), sqlx::Error> {
        match tx.execute("ROLLBACK").await {
            Ok(()) => {
                tx.release();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Rollback failed, closing connection");
                tx.discard();
                Err(e)
            }
        }
    }
}

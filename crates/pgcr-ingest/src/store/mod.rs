//! Transactional sinks
//!
//! The transaction manager talks to the store through [`TransactionSink`] so
//! the batching discipline can be exercised without a database.

mod memory;
mod postgres;

pub use memory::MemorySink;
pub use postgres::{PgSink, PgTransaction};

use async_trait::async_trait;

use crate::record::PersistRequest;

/// A commit that did not go through.
///
/// `transaction` is handed back when the sink still holds an open
/// transaction that the caller has to roll back.
#[derive(Debug)]
pub struct CommitError<T> {
    pub transaction: Option<T>,
    pub source: sqlx::Error,
}

impl<T> CommitError<T> {
    pub fn new(transaction: Option<T>, source: sqlx::Error) -> Self {
        Self {
            transaction,
            source,
        }
    }
}

/// A store that accepts inserts inside explicit transactions.
#[async_trait]
pub trait TransactionSink: Send + Sync + 'static {
    /// Handle of one open transaction
    type Transaction: Send + 'static;

    async fn begin(&self) -> Result<Self::Transaction, sqlx::Error>;

    async fn insert(
        &self,
        tx: &mut Self::Transaction,
        request: &PersistRequest,
    ) -> Result<(), sqlx::Error>;

    async fn commit(&self, tx: Self::Transaction) -> Result<(), CommitError<Self::Transaction>>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), sqlx::Error>;
}

//! In-memory sink for dry runs and tests

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{CommitError, TransactionSink};
use crate::record::PersistRequest;

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<PersistRequest>,
    discard_rows: bool,
    committed_rows: u64,
    begins: u64,
    commits: u64,
    rollbacks: u64,
    fail_commits: bool,
}

/// Keeps committed rows in memory. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

/// Rows staged by one open transaction.
#[derive(Debug, Default)]
pub struct MemoryTransaction {
    staged: Vec<PersistRequest>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that only counts committed rows, for dry runs over large inputs.
    pub fn discarding() -> Self {
        let sink = Self::default();
        sink.state().discard_rows = true;
        sink
    }

    /// Make every following commit fail.
    pub fn fail_commits(&self, fail: bool) {
        self.state().fail_commits = fail;
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Committed rows, in commit order.
    pub fn rows(&self) -> Vec<PersistRequest> {
        self.state().rows.clone()
    }

    /// Committed rows, including discarded ones.
    pub fn row_count(&self) -> u64 {
        self.state().committed_rows
    }

    /// Transactions opened so far.
    pub fn begins(&self) -> u64 {
        self.state().begins
    }

    pub fn commits(&self) -> u64 {
        self.state().commits
    }

    pub fn rollbacks(&self) -> u64 {
        self.state().rollbacks
    }
}

#[async_trait]
impl TransactionSink for MemorySink {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, sqlx::Error> {
        self.state().begins += 1;
        Ok(MemoryTransaction::default())
    }

    async fn insert(
        &self,
        tx: &mut Self::Transaction,
        request: &PersistRequest,
    ) -> Result<(), sqlx::Error> {
        tx.staged.push(request.clone());
        Ok(())
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), CommitError<Self::Transaction>> {
        let mut state = self.state();
        if state.fail_commits {
            // The staged rows stay with the transaction until it is rolled back.
            return Err(CommitError::new(
                Some(tx),
                sqlx::Error::Protocol("commit rejected by memory sink".into()),
            ));
        }
        state.committed_rows += tx.staged.len() as u64;
        if !state.discard_rows {
            state.rows.extend(tx.staged);
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&self, _tx: Self::Transaction) -> Result<(), sqlx::Error> {
        self.state().rollbacks += 1;
        Ok(())
    }
}

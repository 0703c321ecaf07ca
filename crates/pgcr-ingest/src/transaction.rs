//! Batched transaction manager
//!
//! Workers share one open transaction. Every persist request is inserted into
//! it under a single lock, and the transaction is committed once it holds
//! `batch_size` requests; a fresh one is opened right after. A failed commit
//! is rolled back explicitly before the error surfaces, and a fresh
//! transaction is opened for whoever comes next. On cancellation the open
//! transaction is rolled back, never committed, even when workers are still
//! racing to add to it.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{IngestError, Result};
use crate::record::PersistRequest;
use crate::store::{CommitError, TransactionSink};

/// Counters kept by the manager, readable while the run is in flight.
#[derive(Debug, Default)]
pub struct BatchStats {
    inserted: AtomicU64,
    committed: AtomicU64,
    commits: AtomicU64,
    commit_errors: AtomicU64,
    rollbacks: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStatsSnapshot {
    /// Requests applied to a transaction
    pub inserted: u64,
    /// Requests in transactions that committed
    pub committed: u64,
    pub commits: u64,
    pub commit_errors: u64,
    /// Rollbacks of non-empty batches that went through
    pub rollbacks: u64,
}

impl BatchStats {
    pub fn snapshot(&self) -> BatchStatsSnapshot {
        BatchStatsSnapshot {
            inserted: self.inserted.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_errors: self.commit_errors.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

struct BatchState<T> {
    open: Option<T>,
    /// Requests applied to `open` since the last commit, always below `batch_size`
    pending: u64,
    closed: bool,
}

pub struct TransactionManager<S: TransactionSink> {
    sink: S,
    batch_size: u64,
    shutdown: CancellationToken,
    state: Mutex<BatchState<S::Transaction>>,
    stats: BatchStats,
}

impl<S: TransactionSink> TransactionManager<S> {
    /// Open the manager and its first transaction.
    ///
    /// `shutdown` is the run's cancellation signal: once it fires, pending
    /// work is rolled back instead of committed.
    pub async fn begin(sink: S, batch_size: u64, shutdown: CancellationToken) -> Result<Self> {
        if batch_size == 0 {
            return Err(IngestError::Config(
                "Batch size cannot be zero or negative".to_string(),
            ));
        }

        let tx = sink.begin().await?;

        Ok(Self {
            sink,
            batch_size,
            shutdown,
            state: Mutex::new(BatchState {
                open: Some(tx),
                pending: 0,
                closed: false,
            }),
            stats: BatchStats::default(),
        })
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    pub fn stats(&self) -> BatchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Requests applied to the open transaction but not yet committed.
    pub async fn pending(&self) -> u64 {
        self.state.lock().await.pending
    }

    /// Apply `request` to the open transaction, committing when the batch is full.
    pub async fn add_persist(&self, request: &PersistRequest) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.closed {
            return Err(IngestError::ManagerClosed);
        }
        if self.shutdown.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        // Reopen lazily if opening one failed earlier.
        let mut tx = match state.open.take() {
            Some(tx) => tx,
            None => self.sink.begin().await?,
        };

        let inserted = self.sink.insert(&mut tx, request).await;
        if let Err(e) = inserted {
            state.open = Some(tx);
            return Err(e.into());
        }
        state.pending += 1;
        self.stats.inserted.fetch_add(1, Ordering::Relaxed);

        if state.pending < self.batch_size {
            state.open = Some(tx);
            return Ok(());
        }

        // Cancellation may have fired while the insert was in flight.
        if self.shutdown.is_cancelled() {
            state.open = Some(tx);
            return Err(IngestError::Cancelled);
        }

        let pending = std::mem::take(&mut state.pending);

        if let Err(failure) = self.sink.commit(tx).await {
            let err = self.rollback_failed_commit(failure, pending).await;
            match self.sink.begin().await {
                Ok(tx) => state.open = Some(tx),
                Err(e) => warn!(error = %e, "Failed to open transaction after failed commit"),
            }
            return Err(err);
        }

        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        self.stats.committed.fetch_add(pending, Ordering::Relaxed);
        debug!(records = pending, "Committed batch");

        state.open = Some(self.sink.begin().await?);
        Ok(())
    }

    /// Finish the manager.
    ///
    /// Commits the partial batch, or rolls it back when the run was cancelled.
    /// The manager is terminal afterwards; calling `close` again is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let pending = std::mem::take(&mut state.pending);
        let Some(tx) = state.open.take() else {
            return Ok(());
        };

        if self.shutdown.is_cancelled() {
            self.sink.rollback(tx).await?;
            if pending > 0 {
                warn!(pending, "Run cancelled, rolled back open batch");
                self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(());
        }

        if pending == 0 {
            // Nothing to keep, release the connection.
            self.sink.rollback(tx).await?;
            return Ok(());
        }

        if let Err(failure) = self.sink.commit(tx).await {
            return Err(self.rollback_failed_commit(failure, pending).await);
        }

        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        self.stats.committed.fetch_add(pending, Ordering::Relaxed);
        debug!(records = pending, "Committed final batch");
        Ok(())
    }

    /// Roll back whatever a failed commit left open.
    ///
    /// The rollback is counted only when it went through; its own failure is
    /// logged and the commit error is what surfaces.
    async fn rollback_failed_commit(
        &self,
        failure: CommitError<S::Transaction>,
        pending: u64,
    ) -> IngestError {
        error!(pending, error = %failure.source, "Failed to commit batch, rolling back");
        self.stats.commit_errors.fetch_add(1, Ordering::Relaxed);

        if let Some(tx) = failure.transaction {
            match self.sink.rollback(tx).await {
                Ok(()) => {
                    self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(pending, error = %e, "Rollback after failed commit failed"),
            }
        }

        IngestError::Commit {
            pending,
            source: failure.source,
        }
    }
}
